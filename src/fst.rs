// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Block-oriented decoder for FST binary traces. Phase 1 frames all blocks
//! and parses header, geometry and hierarchy; value-change blocks are queued
//! in an owned byte store. Phase 2 walks the queued blocks in file order and
//! emits samples, because widths and handles must be known before the
//! value-change chunks can be interpreted.

use crate::buffer::{BlockReader, StreamReader};
use crate::compress::{self, Codec};
use crate::error::{DecodeError, ErrorKind, Result};
use crate::index::IdIndex;
use crate::progress::Progress;
use crate::record::{DataKind, Record, SampleWriter, ScopeId, ScopeTree, TimeBase};
use crate::tokens::{binary_state, LogicLevel, STATE_0, STATE_X};
use crate::varint::{read_varint_i64, read_varint_u64, varint_size};
use crate::variable::{self, FilterList, VarRecord};
use crate::LoadConfig;
use log::{error, info, warn};
use num_enum::TryFromPrimitive;
use rustc_hash::FxHashMap;
use std::io::Read;

/// Chain offsets are measured from the pack-type byte, one byte before the
/// start of the VC data region. Derived from fixtures, see the chunk tests.
const CHAIN_OFFSET_BASE: i64 = 1;

/// Longest null-terminated name accepted in hierarchy entries.
const NAME_MAX_LEN: usize = 512;

/// The endian-test double stored in the header.
const ENDIAN_TEST: f64 = std::f64::consts::E;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum BlockType {
    Header = 0,
    ValueChange = 1,
    Blackout = 2,
    Geometry = 3,
    Hierarchy = 4,
    ValueChangeDynAlias = 5,
    HierarchyLz4 = 6,
    HierarchyLz4Duo = 7,
    ValueChangeDynAlias2 = 8,
    ZWrapper = 254,
    Skip = 255,
}

/// Variable-declaration type codes of hierarchy entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum TraceVarType {
    Event = 0,
    Integer = 1,
    Parameter = 2,
    Real = 3,
    RealParameter = 4,
    Reg = 5,
    Supply0 = 6,
    Supply1 = 7,
    Time = 8,
    Tri = 9,
    TriAnd = 10,
    TriOr = 11,
    TriReg = 12,
    Tri0 = 13,
    Tri1 = 14,
    WAnd = 15,
    Wire = 16,
    WOr = 17,
    Port = 18,
    SparseArray = 19,
    RealTime = 20,
    GenString = 21,
    SvBit = 22,
    SvLogic = 23,
    SvInt = 24,
    SvShortInt = 25,
    SvLongInt = 26,
    SvByte = 27,
    SvEnum = 28,
    SvShortReal = 29,
}

impl TraceVarType {
    fn kind(&self) -> DataKind {
        match self {
            TraceVarType::Event => DataKind::Event,
            TraceVarType::Real
            | TraceVarType::RealParameter
            | TraceVarType::RealTime
            | TraceVarType::SvShortReal => DataKind::Float,
            TraceVarType::GenString => DataKind::Text,
            _ => DataKind::Logic,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TraceVarType::Event => "event",
            TraceVarType::Integer => "integer",
            TraceVarType::Parameter => "parameter",
            TraceVarType::Real => "real",
            TraceVarType::RealParameter => "real_parameter",
            TraceVarType::Reg => "reg",
            TraceVarType::Supply0 => "supply0",
            TraceVarType::Supply1 => "supply1",
            TraceVarType::Time => "time",
            TraceVarType::Tri => "tri",
            TraceVarType::TriAnd => "triand",
            TraceVarType::TriOr => "trior",
            TraceVarType::TriReg => "trireg",
            TraceVarType::Tri0 => "tri0",
            TraceVarType::Tri1 => "tri1",
            TraceVarType::WAnd => "wand",
            TraceVarType::Wire => "wire",
            TraceVarType::WOr => "wor",
            TraceVarType::Port => "port",
            TraceVarType::SparseArray => "sparray",
            TraceVarType::RealTime => "realtime",
            TraceVarType::GenString => "string",
            TraceVarType::SvBit => "bit",
            TraceVarType::SvLogic => "logic",
            TraceVarType::SvInt => "int",
            TraceVarType::SvShortInt => "shortint",
            TraceVarType::SvLongInt => "longint",
            TraceVarType::SvByte => "byte",
            TraceVarType::SvEnum => "enum",
            TraceVarType::SvShortReal => "shortreal",
        }
    }
}

const HIERARCHY_TAG_SCOPE: u8 = 254;
const HIERARCHY_TAG_UPSCOPE: u8 = 255;
const HIERARCHY_TAG_ATTR_BEGIN: u8 = 252;
const HIERARCHY_TAG_ATTR_END: u8 = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FloatEndian {
    Little,
    Big,
}

#[derive(Debug)]
struct TraceHeader {
    start_time: i64,
    end_time: i64,
    float_endian: FloatEndian,
    scope_count: u64,
    var_count: u64,
    max_handle: u64,
    section_count: u64,
    timescale_exponent: i8,
    version: String,
    date: String,
    file_type: u8,
    time_zero: i64,
}

/// Geometry of one handle's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleKind {
    Logic(u32),
    Real,
    /// Zero-width: variable-length payloads (strings).
    VarLen,
}

#[derive(Debug, Default)]
struct HandleState {
    kind: Option<HandleKind>,
    /// Frame initial value, emitted before the first post-initial sample.
    initial: Option<Vec<u8>>,
}

/// A dump-activity interval; parsed and retained, not applied to emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blackout {
    pub time: u64,
    pub activity: bool,
}

/// Pageable byte store for queued value-change blocks: amortized O(1)
/// append, random access by fragment index.
#[derive(Default)]
struct BlockStore {
    fragments: Vec<Vec<u8>>,
}

impl BlockStore {
    fn add_fragment(&mut self, block: Vec<u8>) {
        self.fragments.push(block);
    }

    fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

/// Reads a complete binary trace into a record.
pub fn read<'a>(input: impl Read + 'a, config: &LoadConfig, progress: &Progress) -> Result<Record> {
    let mut decoder = TraceDecoder::new(config, progress);
    let mut stream = StreamReader::new(Box::new(input) as Box<dyn Read + 'a>);
    info!("binary trace decoder started");

    let cancelled = match decoder.parse_blocks(&mut stream) {
        Ok(()) => false,
        Err(e) if e.kind == ErrorKind::CancelRequested => true,
        Err(e) => return Err(e),
    };
    progress.add_bytes(stream.offset());
    if cancelled && decoder.header.is_none() {
        return Err(DecodeError::new(
            ErrorKind::CancelRequested,
            "decode cancelled before the header block",
        ));
    }

    decoder.build_record()?;
    if !cancelled {
        decoder.decode_queued_blocks()?;
    }
    decoder.finish()
}

/// Tries to guess whether the input could be a binary trace: the first byte
/// must be the header block type followed by its fixed section length.
pub fn looks_like_binary_trace(prefix: &[u8]) -> bool {
    prefix.len() >= 9
        && prefix[0] == BlockType::Header as u8
        && u64::from_be_bytes(prefix[1..9].try_into().unwrap()) == HEADER_SECTION_LENGTH
}

/// Fixed header section length: 8-byte length field plus 321 payload bytes.
const HEADER_SECTION_LENGTH: u64 = 329;

struct TraceDecoder<'a> {
    config: &'a LoadConfig,
    progress: &'a Progress,

    header: Option<TraceHeader>,
    tree: ScopeTree,
    scope: ScopeId,
    handles: Vec<HandleState>,
    vars: Vec<VarRecord>,
    var_handles: Vec<u64>,
    first_var_of_handle: FxHashMap<u64, usize>,
    blocks: BlockStore,
    blackouts: Vec<Blackout>,

    geometry_cursor: u64,
    hierarchy_cursor: u64,
    frame_cursor: u64,

    record: Option<Record>,
    index: IdIndex,
    start: i64,
    end: i64,
    delay: i64,
    dilate: f64,
    last_time: i64,
    blocks_consumed: usize,
}

impl<'a> TraceDecoder<'a> {
    fn new(config: &'a LoadConfig, progress: &'a Progress) -> Self {
        TraceDecoder {
            config,
            progress,
            header: None,
            tree: ScopeTree::new(),
            scope: ScopeTree::ROOT,
            handles: Vec::new(),
            vars: Vec::new(),
            var_handles: Vec::new(),
            first_var_of_handle: FxHashMap::default(),
            blocks: BlockStore::default(),
            blackouts: Vec::new(),
            geometry_cursor: 0,
            hierarchy_cursor: 0,
            frame_cursor: 0,
            record: None,
            index: IdIndex::default(),
            start: i64::MIN,
            end: i64::MAX,
            delay: 0,
            dilate: 1.0,
            last_time: 0,
            blocks_consumed: 0,
        }
    }

    // ------------------------------------------------------------------
    // phase 1: block framing
    // ------------------------------------------------------------------

    fn parse_blocks<'r>(&mut self, reader: &mut StreamReader<Box<dyn Read + 'r>>) -> Result<()> {
        loop {
            if self.progress.is_cancelled() {
                return Err(DecodeError::new(ErrorKind::CancelRequested, "decode cancelled"));
            }
            if reader.at_eof()? {
                return Ok(());
            }
            let offset = reader.offset();
            let type_byte = reader.read_u8()?;
            let section_length = reader.read_u64()?;
            let data_size = section_length.checked_sub(8).ok_or_else(|| {
                DecodeError::new(
                    ErrorKind::InvalidNumeric,
                    format!("block length {section_length} is below the length field itself"),
                )
                .with_offset(offset)
            })?;

            let block_type = match BlockType::try_from(type_byte) {
                Ok(block_type) => block_type,
                Err(_) => {
                    warn!("unknown block type 0x{type_byte:02x} at byte {offset}, skipping {data_size} bytes");
                    reader.skip(data_size)?;
                    continue;
                }
            };

            match block_type {
                BlockType::Header => {
                    if self.header.is_some() {
                        return Err(DecodeError::invariant("duplicate header block")
                            .with_offset(offset));
                    }
                    let payload = reader.read_bytes(data_size as usize)?;
                    self.parse_header(&payload, offset)?;
                }
                BlockType::ValueChange
                | BlockType::ValueChangeDynAlias
                | BlockType::ValueChangeDynAlias2 => {
                    self.require_header(offset)?;
                    // keep the block with its type and length prefix; the
                    // time range is learned in the second pass
                    let mut block = Vec::with_capacity(9 + data_size as usize);
                    block.push(type_byte);
                    block.extend_from_slice(&section_length.to_be_bytes());
                    block.resize(9 + data_size as usize, 0);
                    reader.read_exact_into(&mut block[9..])?;
                    self.blocks.add_fragment(block);
                }
                BlockType::Blackout => {
                    self.require_header(offset)?;
                    let payload = reader.read_bytes(data_size as usize)?;
                    self.parse_blackout(&payload)?;
                }
                BlockType::Geometry => {
                    self.require_header(offset)?;
                    let payload = reader.read_bytes(data_size as usize)?;
                    self.parse_geometry(&payload, offset)?;
                }
                BlockType::Hierarchy | BlockType::HierarchyLz4 | BlockType::HierarchyLz4Duo => {
                    self.require_header(offset)?;
                    let codec = match block_type {
                        BlockType::Hierarchy => Codec::Gzip,
                        BlockType::HierarchyLz4 => Codec::Lz4,
                        _ => Codec::Lz4Duo,
                    };
                    let payload = reader.read_bytes(data_size as usize)?;
                    self.parse_hierarchy(&payload, codec, offset)?;
                }
                BlockType::ZWrapper => {
                    // whole-file gzip wrapper: decompress and frame recursively
                    let wrapped_len = data_size.checked_sub(8).ok_or_else(|| {
                        DecodeError::eof("wrapper block too small for its length field")
                            .with_offset(offset)
                    })?;
                    let _uncompressed_len = reader.read_u64()?;
                    let wrapped = reader.read_bytes(wrapped_len as usize)?;
                    let gz = flate2::read::GzDecoder::new(wrapped.as_slice());
                    let mut inner = StreamReader::new(Box::new(gz) as Box<dyn Read + '_>);
                    info!("entering gzip wrapper block ({} compressed bytes)", wrapped.len());
                    self.parse_blocks(&mut inner)?;
                }
                BlockType::Skip => {
                    reader.skip(data_size)?;
                }
            }
        }
    }

    fn require_header(&self, offset: u64) -> Result<()> {
        if self.header.is_none() {
            return Err(DecodeError::invariant("header must be the first block")
                .with_offset(offset));
        }
        Ok(())
    }

    fn parse_header(&mut self, payload: &[u8], offset: u64) -> Result<()> {
        if payload.len() != (HEADER_SECTION_LENGTH - 8) as usize {
            return Err(DecodeError::new(
                ErrorKind::InvalidNumeric,
                format!("header block has {} payload bytes, expected 321", payload.len()),
            )
            .with_offset(offset));
        }
        let mut r = BlockReader::new(payload);
        let start_time = r.read_u64()? as i64;
        let end_time = r.read_u64()? as i64;
        let endian_bytes: [u8; 8] = r.take_bytes(8)?.try_into().unwrap();
        let float_endian = if f64::from_le_bytes(endian_bytes) == ENDIAN_TEST {
            FloatEndian::Little
        } else if f64::from_be_bytes(endian_bytes) == ENDIAN_TEST {
            FloatEndian::Big
        } else {
            return Err(DecodeError::new(
                ErrorKind::InvalidNumeric,
                "endian-test value does not decode to e in either byte order",
            )
            .with_offset(offset + 17));
        };
        let _memory_hint = r.read_u64()?;
        let scope_count = r.read_u64()?;
        let var_count = r.read_u64()?;
        let max_handle = r.read_u64()?;
        let section_count = r.read_u64()?;
        let timescale_exponent = r.read_u8()? as i8;
        let version = read_fixed_str(&mut r, 128)?;
        let date = read_fixed_str(&mut r, 119)?;
        let file_type = r.read_u8()?;
        let time_zero = r.read_u64()? as i64;

        let header = TraceHeader {
            start_time: start_time + time_zero,
            end_time: end_time + 1 + time_zero,
            float_endian,
            scope_count,
            var_count,
            max_handle,
            section_count,
            timescale_exponent,
            version,
            date,
            file_type,
            time_zero,
        };
        info!(
            "header: time {}..{}, {} scopes, {} vars, max handle {}, {} sections, file type {}, writer '{}', date '{}'",
            header.start_time,
            header.end_time,
            header.scope_count,
            header.var_count,
            header.max_handle,
            header.section_count,
            header.file_type,
            header.version,
            header.date,
        );
        self.handles = Vec::with_capacity(max_handle as usize + 1);
        self.handles.resize_with(max_handle as usize + 1, HandleState::default);
        self.header = Some(header);
        Ok(())
    }

    fn parse_blackout(&mut self, payload: &[u8]) -> Result<()> {
        let mut r = BlockReader::new(payload);
        let (count, _) = read_varint_u64(&mut r)?;
        let mut time = 0u64;
        for _ in 0..count {
            let activity = r.read_u8()? != 0;
            let (delta, _) = read_varint_u64(&mut r)?;
            time += delta;
            self.blackouts.push(Blackout { time, activity });
        }
        Ok(())
    }

    fn parse_geometry(&mut self, payload: &[u8], offset: u64) -> Result<()> {
        let mut r = BlockReader::new(payload);
        let uncompressed_len = r.read_u64()? as usize;
        let entry_count = r.read_u64()?;
        let data = r.take_bytes(r.remaining())?;
        let bytes = compress::maybe_zlib(data, uncompressed_len)?.require_full()?;

        let mut geo = BlockReader::new(&bytes);
        let first = self.geometry_cursor + 1;
        let last = self.geometry_cursor + entry_count;
        for handle in first..=last {
            let (value, _) = read_varint_u64(&mut geo)?;
            let kind = match value {
                0 => HandleKind::Real,
                0xFFFF_FFFF => HandleKind::VarLen,
                width => HandleKind::Logic(width as u32),
            };
            match self.handles.get_mut(handle as usize) {
                Some(state) => state.kind = Some(kind),
                None => {
                    warn!("geometry entry for handle {handle} beyond declared max, ignored");
                }
            }
        }
        self.geometry_cursor = last;
        info!("geometry: handles {first}..={last} assigned (offset {offset})");
        Ok(())
    }

    fn parse_hierarchy(&mut self, payload: &[u8], codec: Codec, offset: u64) -> Result<()> {
        let mut r = BlockReader::new(payload);
        let uncompressed_len = r.read_u64()? as usize;
        let data = r.take_bytes(r.remaining())?;
        let bytes = compress::decompress(codec, data, uncompressed_len)?.require_full()?;

        let mut h = BlockReader::new(&bytes);
        let mut entries = 0usize;
        while h.remaining() > 0 {
            let tag = h.read_u8()?;
            entries += 1;
            match tag {
                HIERARCHY_TAG_SCOPE => {
                    let _kind = h.read_u8()?;
                    let name = read_c_str(&mut h)?;
                    let _component = read_c_str(&mut h)?;
                    self.scope = self.tree.add_child(self.scope, &name);
                }
                HIERARCHY_TAG_UPSCOPE => {
                    if let Some(parent) = self.tree.parent(self.scope) {
                        self.scope = parent;
                    }
                }
                HIERARCHY_TAG_ATTR_BEGIN => {
                    let _kind = h.read_u8()?;
                    let _sub_kind = h.read_u8()?;
                    let name = read_c_str(&mut h)?;
                    let (_arg, _) = read_varint_u64(&mut h)?;
                    warn!("hierarchy attribute '{name}' is advisory only, ignored");
                }
                HIERARCHY_TAG_ATTR_END => {}
                0..=29 => {
                    let var_type = TraceVarType::try_from(tag).expect("tag range checked");
                    self.parse_hierarchy_variable(&mut h, var_type, offset)?;
                }
                other => {
                    warn!("unknown hierarchy tag {other}, trying to continue");
                    if h.remaining() > 0 {
                        let _ = h.read_u8()?;
                    }
                }
            }
        }
        info!("hierarchy: {entries} entries processed");
        Ok(())
    }

    fn parse_hierarchy_variable(
        &mut self,
        h: &mut BlockReader<'_>,
        var_type: TraceVarType,
        offset: u64,
    ) -> Result<()> {
        let _direction = h.read_u8()?;
        let name = read_c_str(h)?;
        let (raw_length, _) = read_varint_u64(h)?;
        let length = if var_type == TraceVarType::Port {
            // port widths carry delimiting spaces on the wire
            (raw_length.saturating_sub(2)) / 3
        } else {
            raw_length
        };
        let (declared, _) = read_varint_u64(h)?;

        let handle = if declared == 0 {
            self.hierarchy_cursor += 1;
            self.hierarchy_cursor
        } else {
            declared
        };
        if handle == 0 || handle as usize >= self.handles.len() {
            return Err(DecodeError::invariant(format!(
                "variable handle {handle} is out of bounds (max {})",
                self.handles.len().saturating_sub(1)
            ))
            .with_offset(offset));
        }

        let mut var = VarRecord::new(name, var_type.kind(), length as u32, self.scope, var_type.name());
        var.check_range_constraints()?;
        if declared != 0 {
            // alias: this variable shares the declared handle's dataset
            var.shared = true;
            if let Some(&first) = self.first_var_of_handle.get(&handle) {
                self.vars[first].shared = true;
            }
        } else {
            self.first_var_of_handle.insert(handle, self.vars.len());
        }
        self.var_handles.push(handle);
        self.vars.push(var);
        Ok(())
    }

    // ------------------------------------------------------------------
    // registration between the passes
    // ------------------------------------------------------------------

    fn build_record(&mut self) -> Result<()> {
        let header = self.header.as_ref().ok_or_else(|| {
            DecodeError::eof("input ended without a header block")
        })?;

        let exponent = header.timescale_exponent as i32;
        let base = match TimeBase::from_exponent(exponent) {
            Some(base) => base,
            None => {
                warn!("timescale exponent {exponent} out of range, clamping");
                TimeBase::from_exponent(exponent.clamp(-15, 0)).expect("clamped range")
            }
        };

        // geometry settles each variable's storage; the declared type only
        // refines how logic-width handles are written
        for (var, handle) in self.vars.iter_mut().zip(&self.var_handles) {
            match self.handles[*handle as usize].kind {
                Some(HandleKind::Real) => {
                    var.kind = DataKind::Float;
                    var.width = 0;
                }
                Some(HandleKind::VarLen) => {
                    var.kind = DataKind::Text;
                    var.width = 0;
                }
                Some(HandleKind::Logic(width)) => {
                    if var.kind != DataKind::Event {
                        var.kind = DataKind::Logic;
                    }
                    var.width = width;
                }
                None => {
                    warn!("no geometry for handle {handle}, keeping declared shape");
                }
            }
        }

        let tree = std::mem::take(&mut self.tree);
        let mut record = Record::new("FST Record", base, tree);
        variable::identify_groups(&mut self.vars, false);
        let include = FilterList::parse(self.config.include.as_deref());
        let exclude = FilterList::parse(self.config.exclude.as_deref());
        let signals = variable::create_signals(&mut record, &self.vars, &include, &exclude);
        let writers = variable::create_writers(&record, &signals);
        self.index = IdIndex::build(
            self.var_handles
                .iter()
                .zip(&writers)
                .filter_map(|(handle, writer)| writer.map(|w| (*handle, w))),
        );

        let parse = |text: &Option<String>, fallback: i64| {
            text.as_deref().and_then(|t| base.parse_value(t)).unwrap_or(fallback)
        };
        self.start = parse(&self.config.start, i64::MIN);
        self.end = parse(&self.config.end, i64::MAX);
        self.delay = parse(&self.config.delay, 0);
        self.dilate = self.config.dilate.unwrap_or(1.0);

        if !self.config.empty {
            record.prune_empty_scopes();
        }
        if let Some(pattern) = self.config.hierarchy.as_deref().filter(|p| !p.is_empty()) {
            let re = regex::Regex::new(pattern).map_err(|e| {
                DecodeError::new(ErrorKind::InvalidCommand, format!("hierarchy pattern: {e}"))
            })?;
            record.resolve_hierarchy(&re);
        }

        let open_at = if self.start != i64::MIN {
            self.start
        } else {
            self.transform(header.start_time)
        };
        record.open(open_at);
        self.last_time = open_at;
        self.record = Some(record);
        Ok(())
    }

    fn transform(&self, raw: i64) -> i64 {
        if self.dilate == 1.0 {
            raw + self.delay
        } else {
            ((raw + self.delay) as f64 * self.dilate) as i64
        }
    }

    /// Applies the time transform and the configured window. Samples outside
    /// the window are dropped.
    fn emission_time(&mut self, raw: i64) -> Option<i64> {
        let time = self.transform(raw);
        if time < self.start || time > self.end {
            return None;
        }
        self.last_time = self.last_time.max(time);
        self.progress.set_current_time(time);
        Some(time)
    }

    fn finish(mut self) -> Result<Record> {
        if !self.blackouts.is_empty() {
            info!("{} blackout intervals recorded (not applied)", self.blackouts.len());
        }
        let close_at = {
            let header = self.header.as_ref().expect("record was built");
            let end = self.transform(header.end_time);
            if self.end != i64::MAX {
                end.min(self.end)
            } else {
                end
            }
        };
        let mut record = self.record.take().expect("record was built");
        record.close(close_at);
        Ok(record)
    }

    // ------------------------------------------------------------------
    // phase 2: value-change blocks
    // ------------------------------------------------------------------

    fn decode_queued_blocks(&mut self) -> Result<()> {
        let store = std::mem::take(&mut self.blocks);
        let queued = store.fragment_count();
        info!("phase 2: decoding {queued} queued value-change blocks");
        for block in &store.fragments {
            if self.progress.is_cancelled() {
                info!("binary trace decode cancelled, keeping partial data");
                break;
            }
            self.decode_vc_block(block)?;
            self.blocks_consumed += 1;
        }
        info!("phase 2 complete: {} of {queued} blocks consumed", self.blocks_consumed);
        Ok(())
    }

    fn decode_vc_block(&mut self, block: &[u8]) -> Result<()> {
        let mut r = BlockReader::new(block);
        let type_byte = r.read_u8()?;
        let block_type = BlockType::try_from(type_byte).expect("queued blocks have known types");
        let section_length = r.read_u64()?;
        let block_start = r.read_u64()? as i64;
        let _block_end = r.read_u64()? as i64;
        let _memory_hint = r.read_u64()?;
        let time_zero = self.header.as_ref().expect("header parsed").time_zero;
        let block_start = block_start + time_zero;

        if block_type == BlockType::ValueChange {
            warn!(
                "plain (non-alias) value-change block is not supported, {} bytes skipped",
                section_length
            );
            return Ok(());
        }

        // the section length covers its own field plus the three time words;
        // the type byte is not part of it
        let data_size = (section_length as i64) - 32;
        if data_size < 0 || block.len() != 9 + (section_length - 8) as usize {
            return Err(DecodeError::new(
                ErrorKind::UnexpectedEof,
                "value-change block shorter than its declared length",
            ));
        }

        // frame header: three varints, then the compressed initial values
        let (frame_uclen, s1) = read_varint_u64(&mut r)?;
        let (frame_clen, s2) = read_varint_u64(&mut r)?;
        let (frame_max_handle, s3) = read_varint_u64(&mut r)?;
        let frame_data_pos = r.position();
        r.skip(frame_clen as usize)?;

        // value-change header
        let (vc_max_handle, s4) = read_varint_u64(&mut r)?;
        let pack_byte = r.read_u8()?;
        let pack_codec = match pack_byte {
            b'Z' => Codec::Zlib,
            b'4' => Codec::Lz4,
            b'F' => Codec::FastLz,
            other => {
                return Err(DecodeError::new(
                    ErrorKind::InvalidToken,
                    format!("invalid pack type 0x{other:02x}"),
                ))
            }
        };
        let vc_data_start = r.position();

        // trailer sections, located from the block end
        if block.len() < 9 + 24 + 24 + 8 {
            return Err(DecodeError::eof("value-change block too small for its trailer"));
        }
        let time_header_pos = block.len() - 24;
        r.seek(time_header_pos)?;
        let tsec_uclen = r.read_u64()? as usize;
        let tsec_clen = r.read_u64()? as usize;
        let tsec_count = r.read_u64()? as usize;
        let time_data_pos = time_header_pos
            .checked_sub(tsec_clen)
            .ok_or_else(|| DecodeError::eof("time section reaches before the block start"))?;
        let chain_header_pos = time_data_pos
            .checked_sub(8)
            .ok_or_else(|| DecodeError::eof("chain trailer reaches before the block start"))?;
        r.seek(chain_header_pos)?;
        let chain_clen = r.read_u64()? as usize;
        let chain_data_pos = chain_header_pos
            .checked_sub(chain_clen)
            .ok_or_else(|| DecodeError::eof("chain section reaches before the block start"))?;

        let vc_data_size = data_size
            - (s1 + s2 + s3) as i64
            - frame_clen as i64
            - (s4 + 1) as i64
            - 8
            - chain_clen as i64
            - 24
            - tsec_clen as i64;
        if vc_data_size < 0 {
            return Err(DecodeError::eof("value-change sections overlap"));
        }

        // frame: per-handle initial values, stored but not yet emitted
        if frame_clen > 0 {
            let raw = &block[frame_data_pos..frame_data_pos + frame_clen as usize];
            let decoded = compress::maybe_zlib(raw, frame_uclen as usize)?;
            if decoded.short {
                warn!("frame section decoded short, initial values may be incomplete");
            }
            self.store_frame_initials(&decoded.bytes, frame_max_handle);
        }

        // time section: delta-coded timestamps
        let timestamps = {
            let raw = &block[time_data_pos..time_data_pos + tsec_clen];
            let bytes = compress::maybe_zlib(raw, tsec_uclen)?.require_full()?;
            let mut tr = BlockReader::new(&bytes);
            let mut out = Vec::with_capacity(tsec_count);
            let mut current = time_zero;
            for _ in 0..tsec_count {
                let (delta, _) = read_varint_u64(&mut tr)?;
                current += delta as i64;
                out.push(current);
            }
            out
        };

        // chain table: handle -> (offset, length) into the VC data region
        let chain_data = &block[chain_data_pos..chain_data_pos + chain_clen];
        let (mut offsets, mut lengths) = if block_type == BlockType::ValueChangeDynAlias2 {
            decode_chain_dyn_alias2(chain_data, vc_max_handle as usize)?
        } else {
            decode_chain_dyn_alias(chain_data, vc_max_handle as usize)?
        };
        close_final_chunk(&mut offsets, &mut lengths, vc_data_size);

        // alias propagation: a negative length points at the target handle
        let alias_members = propagate_aliases(&lengths)?;

        // per-handle compressed chunks
        for handle in 1..offsets.len() {
            if offsets[handle] <= 0 || lengths[handle] <= 0 {
                continue;
            }
            if handle >= self.handles.len() {
                warn!("chain entry for handle {handle} beyond declared max, skipped");
                continue;
            }
            let outcome = self.decode_chunk(
                block,
                vc_data_start,
                offsets[handle],
                lengths[handle] as usize,
                pack_codec,
                handle,
                &timestamps,
                &alias_members,
                block_start,
            );
            if let Err(e) = outcome {
                // abandon this signal's chunk, continue with the others
                error!("handle {handle}: chunk decode failed: {e}");
            }
        }

        // initial values of handles that saw no change in this block
        for handle in 1..self.handles.len() {
            self.flush_initial(handle, block_start)?;
        }
        Ok(())
    }

    fn store_frame_initials(&mut self, frame: &[u8], frame_max_handle: u64) {
        let first = self.frame_cursor + 1;
        let last = self.frame_cursor + frame_max_handle;
        let mut pos = 0usize;
        for handle in first..=last {
            let Some(state) = self.handles.get_mut(handle as usize) else {
                warn!("frame entry for handle {handle} beyond declared max, stopping");
                break;
            };
            let size = match state.kind {
                Some(HandleKind::Real) => 8,
                Some(HandleKind::Logic(width)) if width > 0 => width as usize,
                _ => continue,
            };
            if pos + size > frame.len() {
                warn!("frame section ends inside handle {handle}, remaining initials dropped");
                break;
            }
            state.initial = Some(frame[pos..pos + size].to_vec());
            pos += size;
        }
        self.frame_cursor = last;
    }

    /// Emits the pending frame initial value of `handle` at the block start.
    fn flush_initial(&mut self, handle: usize, block_start: i64) -> Result<()> {
        if handle >= self.handles.len() {
            return Ok(());
        }
        let Some(bytes) = self.handles[handle].initial.take() else {
            return Ok(());
        };
        let Some(time) = self.emission_time(block_start) else {
            return Ok(());
        };
        let kind = self.handles[handle].kind;
        match kind {
            Some(HandleKind::Real) => {
                let endian = self.header.as_ref().expect("header").float_endian;
                let value = decode_f64(&bytes, endian)?;
                self.write_float(handle, time, value)?;
            }
            Some(HandleKind::Logic(_)) => {
                let (states, level, tag) = decode_state_chars(&bytes)?;
                self.write_vector(handle, time, tag, level, &states)?;
            }
            _ => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_chunk(
        &mut self,
        block: &[u8],
        vc_data_start: usize,
        offset: i64,
        length: usize,
        pack_codec: Codec,
        handle: usize,
        timestamps: &[i64],
        alias_members: &FxHashMap<usize, Vec<usize>>,
        block_start: i64,
    ) -> Result<()> {
        let chunk_start = (vc_data_start as i64 + offset - CHAIN_OFFSET_BASE) as usize;
        let chunk_end = chunk_start + length;
        if chunk_start >= chunk_end || chunk_end > block.len() {
            return Err(DecodeError::eof("chunk range leaves the value-change region"));
        }
        let chunk = &block[chunk_start..chunk_end];
        let mut cr = BlockReader::new(chunk);
        let (uncompressed_len, _) = read_varint_u64(&mut cr)?;
        let payload = &chunk[varint_size(uncompressed_len)..];
        // an uncompressed-size of zero marks a raw chunk
        let bytes = if uncompressed_len == 0 {
            payload.to_vec()
        } else {
            compress::decompress(pack_codec, payload, uncompressed_len as usize)?.require_full()?
        };

        let kind = self.handles[handle].kind.ok_or_else(|| {
            DecodeError::invariant(format!("no geometry for handle {handle}"))
        })?;
        let members: &[usize] = alias_members
            .get(&handle)
            .map(Vec::as_slice)
            .unwrap_or(std::slice::from_ref(&handle));

        let mut dr = BlockReader::new(&bytes);
        let mut time_index = 0usize;
        while dr.remaining() > 0 {
            let (vli, _) = read_varint_u64(&mut dr)?;
            match kind {
                HandleKind::Logic(1) => {
                    let shift = 2 << (vli & 1);
                    time_index += (vli >> shift) as usize;
                    let raw = self.timestamp(timestamps, time_index)?;
                    let packed = if vli & 1 == 0 { (vli & 0x03) as u8 } else { (vli & 0x0f) as u8 };
                    let (level, state) = binary_state(packed).ok_or_else(|| {
                        DecodeError::new(
                            ErrorKind::InvalidToken,
                            format!("invalid packed state 0x{packed:02x}"),
                        )
                    })?;
                    for &member in members {
                        self.flush_initial(member, block_start)?;
                        if let Some(time) = self.emission_time(raw) {
                            self.write_bit(member, time, level, state)?;
                        }
                    }
                }
                HandleKind::VarLen => {
                    time_index += (vli >> 1) as usize;
                    let raw = self.timestamp(timestamps, time_index)?;
                    let (len, _) = read_varint_u64(&mut dr)?;
                    let payload = dr.take_bytes(len as usize)?;
                    let value = String::from_utf8_lossy(payload).into_owned();
                    for &member in members {
                        self.flush_initial(member, block_start)?;
                        if let Some(time) = self.emission_time(raw) {
                            self.write_text(member, time, value.clone())?;
                        }
                    }
                }
                HandleKind::Logic(width) => {
                    time_index += (vli >> 1) as usize;
                    let raw = self.timestamp(timestamps, time_index)?;
                    let (states, level, tag) = if vli & 1 == 0 {
                        // one bit per bit, padded to whole bytes
                        let count = width.div_ceil(8) as usize;
                        let packed = dr.take_bytes(count)?;
                        (unpack_bits(packed, width as usize), LogicLevel::Two, false)
                    } else {
                        // one state character per bit
                        let chars = dr.take_bytes(width as usize)?;
                        decode_state_chars(chars)?
                    };
                    for &member in members {
                        self.flush_initial(member, block_start)?;
                        if let Some(time) = self.emission_time(raw) {
                            self.write_vector(member, time, tag, level, &states)?;
                        }
                    }
                }
                HandleKind::Real => {
                    time_index += (vli >> 1) as usize;
                    let raw = self.timestamp(timestamps, time_index)?;
                    let bytes = dr.take_bytes(8)?;
                    let endian = self.header.as_ref().expect("header").float_endian;
                    let value = decode_f64(bytes, endian)?;
                    for &member in members {
                        self.flush_initial(member, block_start)?;
                        if let Some(time) = self.emission_time(raw) {
                            self.write_float(member, time, value)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn timestamp(&self, timestamps: &[i64], index: usize) -> Result<i64> {
        timestamps.get(index).copied().ok_or_else(|| {
            DecodeError::new(
                ErrorKind::InvalidNumeric,
                format!("time index {index} beyond the block's {} entries", timestamps.len()),
            )
        })
    }

    // writers, fanned out per handle through the identifier index

    fn write_bit(&mut self, handle: usize, time: i64, level: LogicLevel, state: u8) -> Result<()> {
        let tag = level == LogicLevel::Four && state == STATE_X;
        for &wid in self.index.lookup(handle as u64) {
            match self.record.as_mut().expect("record built").writer(wid) {
                SampleWriter::Logic(w) => {
                    let preceding = if w.width > 1 { STATE_0 } else { state };
                    w.write_bit(time, tag, level, preceding, state)?;
                }
                SampleWriter::Event(w) => w.write(time, tag)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn write_vector(
        &mut self,
        handle: usize,
        time: i64,
        tag: bool,
        level: LogicLevel,
        states: &[u8],
    ) -> Result<()> {
        for &wid in self.index.lookup(handle as u64) {
            match self.record.as_mut().expect("record built").writer(wid) {
                SampleWriter::Logic(w) => {
                    w.write_states(time, tag, level, STATE_0, states)?;
                }
                SampleWriter::Event(w) => w.write(time, tag)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn write_float(&mut self, handle: usize, time: i64, value: f64) -> Result<()> {
        for &wid in self.index.lookup(handle as u64) {
            if let SampleWriter::Float(w) = self.record.as_mut().expect("record built").writer(wid)
            {
                w.write(time, false, value)?;
            }
        }
        Ok(())
    }

    fn write_text(&mut self, handle: usize, time: i64, value: String) -> Result<()> {
        for &wid in self.index.lookup(handle as u64) {
            if let SampleWriter::Text(w) = self.record.as_mut().expect("record built").writer(wid) {
                w.write(time, false, value.clone())?;
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// chain decoding
// ----------------------------------------------------------------------

/// DYN_ALIAS chain: unsigned varints. Zero introduces an alias pair, odd
/// values advance the offset accumulator, even values skip handles.
fn decode_chain_dyn_alias(data: &[u8], max_handle: usize) -> Result<(Vec<i64>, Vec<i64>)> {
    let mut offsets = vec![0i64; max_handle + 1];
    let mut lengths = vec![0i64; max_handle + 1];
    let mut r = BlockReader::new(data);
    let mut idx = 1usize;
    let mut pidx = 0usize;
    let mut pval = 0i64;
    while r.remaining() > 0 && idx <= max_handle {
        let (val, _) = read_varint_u64(&mut r)?;
        if val == 0 {
            let (target, _) = read_varint_u64(&mut r)?;
            offsets[idx] = 0;
            lengths[idx] = -(target as i64);
            idx += 1;
        } else if val & 1 != 0 {
            pval += (val >> 1) as i64;
            offsets[idx] = pval;
            if pidx > 0 {
                lengths[pidx] = pval - offsets[pidx];
            }
            pidx = idx;
            idx += 1;
        } else {
            let skip = val >> 1;
            for _ in 0..skip {
                if idx > max_handle {
                    warn!("chain skip run extends beyond declared max handle");
                    break;
                }
                offsets[idx] = 0;
                lengths[idx] = 0;
                idx += 1;
            }
        }
    }
    Ok((offsets, lengths))
}

/// DYN_ALIAS2 chain: signed varints with the LSB as tag. Positive values
/// are offset deltas, negative ones new alias references, zero reuses the
/// previous alias; cleared LSB skips handles.
fn decode_chain_dyn_alias2(data: &[u8], max_handle: usize) -> Result<(Vec<i64>, Vec<i64>)> {
    let mut offsets = vec![0i64; max_handle + 1];
    let mut lengths = vec![0i64; max_handle + 1];
    let mut r = BlockReader::new(data);
    let mut idx = 1usize;
    let mut pidx = 0usize;
    let mut pval = 0i64;
    let mut prev_alias = 0i64;
    while r.remaining() > 0 && idx <= max_handle {
        let (val, _) = read_varint_i64(&mut r)?;
        if val & 1 != 0 {
            let shval = val >> 1;
            if shval > 0 {
                pval += shval;
                offsets[idx] = pval;
                if pidx > 0 {
                    lengths[pidx] = pval - offsets[pidx];
                }
                pidx = idx;
            } else if shval < 0 {
                offsets[idx] = 0;
                prev_alias = shval;
                lengths[idx] = shval;
            } else {
                if prev_alias == 0 {
                    return Err(DecodeError::invariant(
                        "chain reuses an alias reference before any was set",
                    ));
                }
                offsets[idx] = 0;
                lengths[idx] = prev_alias;
            }
            idx += 1;
        } else {
            let skip = val >> 1;
            if skip < 0 {
                return Err(DecodeError::new(
                    ErrorKind::InvalidNumeric,
                    "negative skip run in chain stream",
                ));
            }
            for _ in 0..skip {
                if idx > max_handle {
                    warn!("chain skip run extends beyond declared max handle");
                    break;
                }
                offsets[idx] = 0;
                lengths[idx] = 0;
                idx += 1;
            }
        }
    }
    Ok((offsets, lengths))
}

/// Closes the last non-alias chunk against the end of the VC data region.
fn close_final_chunk(offsets: &mut [i64], lengths: &mut [i64], vc_data_size: i64) {
    // the final chunk runs to the end of the region; offsets are measured
    // from the pack-type byte, hence the +1
    if let Some(last) = (1..offsets.len()).filter(|h| offsets[*h] > 0).next_back() {
        if lengths[last] == 0 {
            lengths[last] = vc_data_size - offsets[last] + CHAIN_OFFSET_BASE;
        }
    }
}

/// Augments each alias target with the referring handles. The target itself
/// leads its member list. Alias-of-alias references are fatal.
fn propagate_aliases(lengths: &[i64]) -> Result<FxHashMap<usize, Vec<usize>>> {
    let mut members: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
    for (handle, &length) in lengths.iter().enumerate().skip(1) {
        if length >= 0 {
            continue;
        }
        let target = (-length) as usize;
        if target == 0 || target >= lengths.len() || target == handle {
            return Err(DecodeError::invariant(format!(
                "handle {handle} references out-of-range alias target {target}"
            )));
        }
        if lengths[target] < 0 {
            return Err(DecodeError::invariant(format!(
                "handle {handle} references handle {target}, which is itself an alias"
            )));
        }
        members.entry(target).or_insert_with(|| vec![target]).push(handle);
    }
    Ok(members)
}

// ----------------------------------------------------------------------
// payload helpers
// ----------------------------------------------------------------------

/// Decodes a run of ASCII state characters into state codes, the highest
/// observed level and the X tag.
fn decode_state_chars(chars: &[u8]) -> Result<(Vec<u8>, LogicLevel, bool)> {
    let mut states = Vec::with_capacity(chars.len());
    let mut level = LogicLevel::Two;
    let mut tag = false;
    for &c in chars {
        let (char_level, state) = binary_state(c).ok_or_else(|| {
            DecodeError::new(
                ErrorKind::InvalidToken,
                format!("invalid logic state character 0x{c:02x} in vector payload"),
            )
        })?;
        if char_level > level {
            level = char_level;
        }
        if state == STATE_X {
            tag = true;
        }
        states.push(state);
    }
    Ok((states, level, tag))
}

/// Expands a bit-packed payload, most significant bit first per byte.
fn unpack_bits(packed: &[u8], width: usize) -> Vec<u8> {
    let mut states = Vec::with_capacity(width);
    for ii in 0..width {
        let byte = packed[ii / 8];
        let bit = (byte >> (7 - (ii & 7))) & 1;
        states.push(bit);
    }
    states
}

fn decode_f64(bytes: &[u8], endian: FloatEndian) -> Result<f64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DecodeError::eof("real payload shorter than 8 bytes"))?;
    Ok(match endian {
        FloatEndian::Little => f64::from_le_bytes(array),
        FloatEndian::Big => f64::from_be_bytes(array),
    })
}

fn read_c_str(r: &mut BlockReader<'_>) -> Result<String> {
    let mut bytes = Vec::with_capacity(32);
    for _ in 0..NAME_MAX_LEN {
        let byte = r.read_u8()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_fixed_str(r: &mut BlockReader<'_>, len: usize) -> Result<String> {
    let bytes = r.take_bytes(len)?;
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(len);
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}
