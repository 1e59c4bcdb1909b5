// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Binary trace fixtures, built by hand with small test-side encoders and
//! fed to the decoder.

use std::io::Write;
use waverec::{
    fst, ErrorKind, LoadConfig, LogicLevel, Progress, Record, SampleWriter, STATE_0, STATE_1,
    STATE_X, STATE_Z,
};

// ----------------------------------------------------------------------
// test-side encoders
// ----------------------------------------------------------------------

fn varint_u(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let next = value >> 7;
        if next == 0 {
            out.push((value & 0x7f) as u8);
            return;
        }
        out.push((value & 0x7f) as u8 | 0x80);
        value = next;
    }
}

fn varint_i(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let bits = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && bits & 0x40 == 0) || (value == -1 && bits & 0x40 != 0);
        if done {
            out.push(bits);
            return;
        }
        out.push(bits | 0x80);
    }
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn header_block(start: u64, end: u64, max_handle: u64, section_count: u64, timezero: u64) -> Vec<u8> {
    let mut p = Vec::with_capacity(321);
    p.extend_from_slice(&start.to_be_bytes());
    p.extend_from_slice(&end.to_be_bytes());
    p.extend_from_slice(&std::f64::consts::E.to_be_bytes());
    p.extend_from_slice(&0u64.to_be_bytes()); // memory hint
    p.extend_from_slice(&1u64.to_be_bytes()); // scope count
    p.extend_from_slice(&max_handle.to_be_bytes()); // var count
    p.extend_from_slice(&max_handle.to_be_bytes());
    p.extend_from_slice(&section_count.to_be_bytes());
    p.push((-9i8) as u8); // 1ns
    let mut version = [0u8; 128];
    version[..12].copy_from_slice(b"waverec-test");
    p.extend_from_slice(&version);
    let mut date = [0u8; 119];
    date[..10].copy_from_slice(b"2025-06-01");
    p.extend_from_slice(&date);
    p.push(0); // file type
    p.extend_from_slice(&timezero.to_be_bytes());
    assert_eq!(p.len(), 321);
    raw_block(0, &p)
}

fn raw_block(block_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut block = vec![block_type];
    block.extend_from_slice(&((payload.len() + 8) as u64).to_be_bytes());
    block.extend_from_slice(payload);
    block
}

struct HierarchyBuilder {
    entries: Vec<u8>,
}

impl HierarchyBuilder {
    fn new() -> Self {
        HierarchyBuilder { entries: Vec::new() }
    }

    fn scope(mut self, name: &str) -> Self {
        self.entries.push(254);
        self.entries.push(0); // module
        self.entries.extend_from_slice(name.as_bytes());
        self.entries.push(0);
        self.entries.push(0); // empty component
        self
    }

    fn upscope(mut self) -> Self {
        self.entries.push(255);
        self
    }

    fn var(mut self, type_tag: u8, name: &str, width: u64, declared_handle: u64) -> Self {
        self.entries.push(type_tag);
        self.entries.push(0); // implicit direction
        self.entries.extend_from_slice(name.as_bytes());
        self.entries.push(0);
        varint_u(&mut self.entries, width);
        varint_u(&mut self.entries, declared_handle);
        self
    }

    fn attribute(mut self, name: &str, arg: u64) -> Self {
        self.entries.push(252);
        self.entries.push(0);
        self.entries.push(0);
        self.entries.extend_from_slice(name.as_bytes());
        self.entries.push(0);
        varint_u(&mut self.entries, arg);
        self.entries.push(253);
        self
    }

    fn build(self) -> Vec<u8> {
        let compressed = gzip(&self.entries);
        let mut payload = Vec::new();
        payload.extend_from_slice(&(self.entries.len() as u64).to_be_bytes());
        payload.extend_from_slice(&compressed);
        raw_block(4, &payload)
    }
}

/// Geometry stored raw (compressed and uncompressed lengths agree).
fn geometry_block(entries: &[u64]) -> Vec<u8> {
    let mut data = Vec::new();
    for &value in entries {
        varint_u(&mut data, value);
    }
    let mut payload = Vec::new();
    payload.extend_from_slice(&(data.len() as u64).to_be_bytes());
    payload.extend_from_slice(&(entries.len() as u64).to_be_bytes());
    payload.extend_from_slice(&data);
    raw_block(3, &payload)
}

fn blackout_block(entries: &[(bool, u64)]) -> Vec<u8> {
    let mut payload = Vec::new();
    varint_u(&mut payload, entries.len() as u64);
    for &(activity, delta) in entries {
        payload.push(activity as u8);
        varint_u(&mut payload, delta);
    }
    raw_block(2, &payload)
}

/// Chain entries for the fixture builders.
enum Chain {
    /// Offset delta to the next data chunk.
    Data(i64),
    /// New alias reference to an earlier handle.
    Alias(u64),
    /// Run of handles without data.
    Skip(i64),
}

fn chain_dyn_alias2(entries: &[Chain]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        match entry {
            Chain::Data(delta) => varint_i(&mut out, (delta << 1) | 1),
            Chain::Alias(target) => varint_i(&mut out, ((-(*target as i64)) << 1) | 1),
            Chain::Skip(count) => varint_i(&mut out, count << 1),
        }
    }
    out
}

fn chain_dyn_alias(entries: &[Chain]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        match entry {
            Chain::Data(delta) => varint_u(&mut out, ((delta << 1) | 1) as u64),
            Chain::Alias(target) => {
                varint_u(&mut out, 0);
                varint_u(&mut out, *target);
            }
            Chain::Skip(count) => varint_u(&mut out, (count << 1) as u64),
        }
    }
    out
}

struct VcBlockBuilder {
    block_type: u8,
    start_time: u64,
    end_time: u64,
    frame: Vec<u8>,
    frame_max_handle: u64,
    vc_max_handle: u64,
    vc_data: Vec<u8>,
    chain: Vec<u8>,
    time_deltas: Vec<u64>,
}

impl VcBlockBuilder {
    fn new(block_type: u8, start_time: u64, end_time: u64) -> Self {
        VcBlockBuilder {
            block_type,
            start_time,
            end_time,
            frame: Vec::new(),
            frame_max_handle: 0,
            vc_max_handle: 0,
            vc_data: Vec::new(),
            chain: Vec::new(),
            time_deltas: Vec::new(),
        }
    }

    fn frame(mut self, bytes: &[u8], max_handle: u64) -> Self {
        self.frame = bytes.to_vec();
        self.frame_max_handle = max_handle;
        self
    }

    /// Appends a raw (uncompressed) chunk and returns its offset delta.
    fn raw_chunk(&mut self, records: &[u8]) -> i64 {
        let start = self.vc_data.len();
        self.vc_data.push(0); // uncompressed marker
        self.vc_data.extend_from_slice(records);
        (self.vc_data.len() - start) as i64
    }

    /// Appends a zlib chunk and returns its length as the offset delta.
    fn zlib_chunk(&mut self, records: &[u8]) -> i64 {
        let start = self.vc_data.len();
        varint_u(&mut self.vc_data, records.len() as u64);
        self.vc_data.extend_from_slice(&zlib(records));
        (self.vc_data.len() - start) as i64
    }

    fn chain(mut self, chain: Vec<u8>, vc_max_handle: u64) -> Self {
        self.chain = chain;
        self.vc_max_handle = vc_max_handle;
        self
    }

    fn times(mut self, deltas: &[u64]) -> Self {
        self.time_deltas = deltas.to_vec();
        self
    }

    fn build(self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&self.start_time.to_be_bytes());
        payload.extend_from_slice(&self.end_time.to_be_bytes());
        payload.extend_from_slice(&0u64.to_be_bytes()); // memory requirement
        // frame stored raw: compressed and uncompressed lengths agree
        varint_u(&mut payload, self.frame.len() as u64);
        varint_u(&mut payload, self.frame.len() as u64);
        varint_u(&mut payload, self.frame_max_handle);
        payload.extend_from_slice(&self.frame);
        varint_u(&mut payload, self.vc_max_handle);
        payload.push(b'Z');
        payload.extend_from_slice(&self.vc_data);
        payload.extend_from_slice(&self.chain);
        payload.extend_from_slice(&(self.chain.len() as u64).to_be_bytes());
        let mut times = Vec::new();
        for &delta in &self.time_deltas {
            varint_u(&mut times, delta);
        }
        payload.extend_from_slice(&times);
        payload.extend_from_slice(&(times.len() as u64).to_be_bytes());
        payload.extend_from_slice(&(times.len() as u64).to_be_bytes());
        payload.extend_from_slice(&(self.time_deltas.len() as u64).to_be_bytes());
        raw_block(self.block_type, &payload)
    }
}

// record records for single-bit and vector changes

fn bit2_record(out: &mut Vec<u8>, time_delta: u64, bit: u8) {
    varint_u(out, (time_delta << 2) | ((bit as u64) << 1));
}

fn bit4_record(out: &mut Vec<u8>, time_delta: u64, packed: u64) {
    varint_u(out, (time_delta << 4) | packed);
}

fn ascii_vector_record(out: &mut Vec<u8>, time_delta: u64, chars: &[u8]) {
    varint_u(out, (time_delta << 1) | 1);
    out.extend_from_slice(chars);
}

fn packed_vector_record(out: &mut Vec<u8>, time_delta: u64, packed: &[u8]) {
    varint_u(out, time_delta << 1);
    out.extend_from_slice(packed);
}

fn real_record(out: &mut Vec<u8>, time_delta: u64, value: f64) {
    varint_u(out, time_delta << 1);
    out.extend_from_slice(&value.to_be_bytes());
}

// ----------------------------------------------------------------------
// helpers over the decoded record
// ----------------------------------------------------------------------

fn decode(file: &[u8]) -> Record {
    fst::read(file, &LoadConfig::default(), &Progress::new()).unwrap()
}

fn logic_changes(record: &Record, full_name: &str) -> Vec<(i64, Vec<u8>)> {
    let id = record.find_signal(full_name).expect("signal exists");
    match &record.writers[record.signals[id].writer] {
        SampleWriter::Logic(w) => w.samples.iter().map(|s| (s.time, s.states.clone())).collect(),
        other => panic!("expected logic writer, got {other:?}"),
    }
}

fn float_changes(record: &Record, full_name: &str) -> Vec<(i64, f64)> {
    let id = record.find_signal(full_name).expect("signal exists");
    match &record.writers[record.signals[id].writer] {
        SampleWriter::Float(w) => w.samples.iter().map(|s| (s.time, s.value)).collect(),
        other => panic!("expected float writer, got {other:?}"),
    }
}

// ----------------------------------------------------------------------
// fixtures
// ----------------------------------------------------------------------

/// A trace with one real handle and a hierarchy alias of it: two signals,
/// one dataset.
fn alias_fixture() -> Vec<u8> {
    let mut records = Vec::new();
    bit2_record(&mut records, 0, 1); // timestamps[0], value 1
    bit2_record(&mut records, 1, 0); // timestamps[1], value 0
    let mut vc = VcBlockBuilder::new(8, 0, 10).frame(b"0", 1).times(&[2, 3]);
    vc.raw_chunk(&records);
    // the single chunk starts right at the data region: offset 1
    let vc = vc.chain(chain_dyn_alias2(&[Chain::Data(1)]), 1);

    let mut file = Vec::new();
    file.extend(header_block(0, 10, 1, 1, 0));
    file.extend(
        HierarchyBuilder::new()
            .scope("top")
            .var(16, "a", 1, 0) // wire, new handle 1
            .var(16, "b", 1, 1) // alias of handle 1
            .upscope()
            .build(),
    );
    file.extend(geometry_block(&[1]));
    file.extend(vc.build());
    file
}

#[test]
fn test_hierarchy_alias_mirrors_samples() {
    let record = decode(&alias_fixture());
    assert_eq!(record.signals.len(), 2);
    let a = logic_changes(&record, "top.a");
    let b = logic_changes(&record, "top.b");
    // frame initial at block start, then the two changes
    assert_eq!(
        a,
        vec![(0, vec![STATE_0]), (2, vec![STATE_1]), (5, vec![STATE_0])]
    );
    assert_eq!(a, b);
    assert_eq!(record.opened_at(), Some(0));
    assert_eq!(record.closed_at(), Some(11));
}

#[test]
fn test_two_pass_handles_blocks_in_any_order() {
    // geometry and hierarchy after the value-change block in file order
    let ordered = alias_fixture();
    let record = decode(&ordered);

    let mut reordered = Vec::new();
    reordered.extend(header_block(0, 10, 1, 1, 0));
    let mut records = Vec::new();
    bit2_record(&mut records, 0, 1);
    bit2_record(&mut records, 1, 0);
    let mut vc = VcBlockBuilder::new(8, 0, 10).frame(b"0", 1).times(&[2, 3]);
    vc.raw_chunk(&records);
    reordered.extend(vc.chain(chain_dyn_alias2(&[Chain::Data(1)]), 1).build());
    reordered.extend(
        HierarchyBuilder::new()
            .scope("top")
            .var(16, "a", 1, 0)
            .var(16, "b", 1, 1)
            .upscope()
            .build(),
    );
    reordered.extend(geometry_block(&[1]));
    let reordered_record = decode(&reordered);

    assert_eq!(
        logic_changes(&record, "top.a"),
        logic_changes(&reordered_record, "top.a")
    );
}

#[test]
fn test_chain_alias_mirrors_samples() {
    // two independent handles; handle 2's chunk aliases handle 1 dynamically
    let mut records = Vec::new();
    bit2_record(&mut records, 0, 1);
    bit2_record(&mut records, 1, 0);
    let mut vc = VcBlockBuilder::new(8, 0, 10).frame(b"01", 2).times(&[2, 3]);
    vc.raw_chunk(&records);
    let vc = vc.chain(chain_dyn_alias2(&[Chain::Data(1), Chain::Alias(1)]), 2);

    let mut file = Vec::new();
    file.extend(header_block(0, 10, 2, 1, 0));
    file.extend(
        HierarchyBuilder::new()
            .scope("top")
            .var(16, "a", 1, 0)
            .var(16, "b", 1, 0)
            .upscope()
            .build(),
    );
    file.extend(geometry_block(&[1, 1]));
    file.extend(vc.build());

    let record = decode(&file);
    let a = logic_changes(&record, "top.a");
    let b = logic_changes(&record, "top.b");
    assert_eq!(
        a,
        vec![(0, vec![STATE_0]), (2, vec![STATE_1]), (5, vec![STATE_0])]
    );
    // the alias gets its own frame initial, then the mirrored changes
    assert_eq!(
        b,
        vec![(0, vec![STATE_1]), (2, vec![STATE_1]), (5, vec![STATE_0])]
    );
}

#[test]
fn test_skip_only_block_keeps_frame_initials() {
    let vc = VcBlockBuilder::new(8, 0, 10)
        .frame(b"00101", 2)
        .times(&[0])
        .chain(chain_dyn_alias2(&[Chain::Skip(2)]), 2);

    let mut file = Vec::new();
    file.extend(header_block(0, 10, 2, 1, 0));
    file.extend(
        HierarchyBuilder::new()
            .scope("top")
            .var(16, "a", 1, 0)
            .var(16, "v", 4, 0)
            .upscope()
            .build(),
    );
    file.extend(geometry_block(&[1, 4]));
    file.extend(vc.build());

    let record = decode(&file);
    assert_eq!(logic_changes(&record, "top.a"), vec![(0, vec![STATE_0])]);
    assert_eq!(
        logic_changes(&record, "top.v"),
        vec![(0, vec![STATE_0, STATE_1, STATE_0, STATE_1])]
    );
}

#[test]
fn test_dyn_alias_variant_with_vectors_and_reals() {
    let mut vector_records = Vec::new();
    ascii_vector_record(&mut vector_records, 0, b"10xz");
    packed_vector_record(&mut vector_records, 1, &[0b1111_0000]);
    let mut real_records = Vec::new();
    real_record(&mut real_records, 0, 1.5);
    real_record(&mut real_records, 1, -2.5);

    let mut vc = VcBlockBuilder::new(5, 0, 10).times(&[0, 4]);
    let first_len = vc.zlib_chunk(&vector_records);
    vc.raw_chunk(&real_records);
    let vc = vc.chain(chain_dyn_alias(&[Chain::Data(1), Chain::Data(first_len)]), 2);

    let mut file = Vec::new();
    file.extend(header_block(0, 10, 2, 1, 0));
    file.extend(
        HierarchyBuilder::new()
            .scope("top")
            .var(16, "v", 4, 0)
            .var(3, "r", 64, 0)
            .upscope()
            .build(),
    );
    file.extend(geometry_block(&[4, 0]));
    file.extend(vc.build());

    let record = decode(&file);
    let v = logic_changes(&record, "top.v");
    assert_eq!(
        v,
        vec![
            (0, vec![STATE_1, STATE_0, STATE_X, STATE_Z]),
            (4, vec![STATE_1, STATE_1, STATE_1, STATE_1]),
        ]
    );
    let id = record.find_signal("top.v").unwrap();
    match &record.writers[record.signals[id].writer] {
        SampleWriter::Logic(w) => {
            assert!(w.samples[0].tag);
            assert_eq!(w.samples[0].level, LogicLevel::Four);
            assert!(!w.samples[1].tag);
            assert_eq!(w.samples[1].level, LogicLevel::Two);
        }
        _ => unreachable!(),
    }
    assert_eq!(float_changes(&record, "top.r"), vec![(0, 1.5), (4, -2.5)]);
}

#[test]
fn test_plain_value_change_block_is_reported_and_skipped() {
    // a type-1 block: recognized, skipped, the rest of the trace survives
    let mut plain_payload = Vec::new();
    plain_payload.extend_from_slice(&0u64.to_be_bytes());
    plain_payload.extend_from_slice(&10u64.to_be_bytes());
    plain_payload.extend_from_slice(&0u64.to_be_bytes());
    plain_payload.extend_from_slice(b"opaque section data");

    let mut file = Vec::new();
    file.extend(header_block(0, 10, 1, 1, 0));
    file.extend(
        HierarchyBuilder::new()
            .scope("top")
            .var(16, "a", 1, 0)
            .upscope()
            .build(),
    );
    file.extend(geometry_block(&[1]));
    file.extend(raw_block(1, &plain_payload));

    let record = decode(&file);
    assert_eq!(logic_changes(&record, "top.a"), Vec::new());
}

#[test]
fn test_unknown_and_blackout_blocks_are_tolerated() {
    let mut file = Vec::new();
    file.extend(header_block(0, 10, 1, 1, 0));
    file.extend(blackout_block(&[(false, 2), (true, 5)]));
    file.extend(raw_block(0x4d, b"junk payload"));
    file.extend(
        HierarchyBuilder::new()
            .scope("top")
            .attribute("sourcestem", 7)
            .var(16, "a", 1, 0)
            .upscope()
            .build(),
    );
    file.extend(geometry_block(&[1]));

    let record = decode(&file);
    assert_eq!(record.signals.len(), 1);
}

#[test]
fn test_gzip_wrapper() {
    let inner = alias_fixture();
    let compressed = gzip(&inner);
    let mut payload = Vec::new();
    payload.extend_from_slice(&(inner.len() as u64).to_be_bytes());
    payload.extend_from_slice(&compressed);
    let file = raw_block(254, &payload);

    let record = decode(&file);
    assert_eq!(
        logic_changes(&record, "top.a"),
        vec![(0, vec![STATE_0]), (2, vec![STATE_1]), (5, vec![STATE_0])]
    );
}

#[test]
fn test_duplicate_header_is_fatal() {
    let mut file = Vec::new();
    file.extend(header_block(0, 10, 1, 1, 0));
    file.extend(header_block(0, 10, 1, 1, 0));
    let err = fst::read(file.as_slice(), &LoadConfig::default(), &Progress::new()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvariantViolation);
}

#[test]
fn test_block_before_header_is_fatal() {
    let file = geometry_block(&[1]);
    let err = fst::read(file.as_slice(), &LoadConfig::default(), &Progress::new()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvariantViolation);
}

#[test]
fn test_time_zero_offsets_timestamps() {
    let mut records = Vec::new();
    bit2_record(&mut records, 0, 1);
    let mut vc = VcBlockBuilder::new(8, 0, 10).times(&[2]);
    vc.raw_chunk(&records);
    let vc = vc.chain(chain_dyn_alias2(&[Chain::Data(1)]), 1);

    let mut file = Vec::new();
    file.extend(header_block(0, 10, 1, 1, 100));
    file.extend(
        HierarchyBuilder::new()
            .scope("top")
            .var(16, "a", 1, 0)
            .upscope()
            .build(),
    );
    file.extend(geometry_block(&[1]));
    file.extend(vc.build());

    let record = decode(&file);
    assert_eq!(logic_changes(&record, "top.a"), vec![(102, vec![STATE_1])]);
    assert_eq!(record.opened_at(), Some(100));
    assert_eq!(record.closed_at(), Some(111));
}

#[test]
fn test_window_and_transform_apply_to_binary_emissions() {
    let config = LoadConfig {
        end: Some("3".to_string()),
        ..LoadConfig::default()
    };
    let record = fst::read(alias_fixture().as_slice(), &config, &Progress::new()).unwrap();
    assert_eq!(
        logic_changes(&record, "top.a"),
        vec![(0, vec![STATE_0]), (2, vec![STATE_1])]
    );
    assert_eq!(record.closed_at(), Some(3));

    let delayed = LoadConfig {
        delay: Some("5".to_string()),
        dilate: Some(2.0),
        ..LoadConfig::default()
    };
    let record = fst::read(alias_fixture().as_slice(), &delayed, &Progress::new()).unwrap();
    assert_eq!(
        logic_changes(&record, "top.a"),
        vec![(10, vec![STATE_0]), (14, vec![STATE_1]), (20, vec![STATE_0])]
    );
}

#[test]
fn test_four_state_single_bit_changes() {
    let mut records = Vec::new();
    bit4_record(&mut records, 0, 1); // x
    bit4_record(&mut records, 1, 3); // z
    let mut vc = VcBlockBuilder::new(8, 0, 10).times(&[1, 2]);
    vc.raw_chunk(&records);
    let vc = vc.chain(chain_dyn_alias2(&[Chain::Data(1)]), 1);

    let mut file = Vec::new();
    file.extend(header_block(0, 10, 1, 1, 0));
    file.extend(
        HierarchyBuilder::new()
            .scope("top")
            .var(16, "a", 1, 0)
            .upscope()
            .build(),
    );
    file.extend(geometry_block(&[1]));
    file.extend(vc.build());

    let record = decode(&file);
    let id = record.find_signal("top.a").unwrap();
    match &record.writers[record.signals[id].writer] {
        SampleWriter::Logic(w) => {
            assert_eq!(w.samples[0].states, vec![STATE_X]);
            assert!(w.samples[0].tag);
            assert_eq!(w.samples[1].states, vec![STATE_Z]);
            assert!(!w.samples[1].tag);
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_cancellation_before_header() {
    let progress = Progress::new();
    progress.cancel();
    let err = fst::read(alias_fixture().as_slice(), &LoadConfig::default(), &progress).unwrap_err();
    assert_eq!(err.kind, ErrorKind::CancelRequested);
}

#[test]
fn test_auto_detection() {
    let file = alias_fixture();
    let record =
        waverec::read_auto(&file, &LoadConfig::default(), &Progress::new()).unwrap();
    assert_eq!(record.signals.len(), 2);
}
