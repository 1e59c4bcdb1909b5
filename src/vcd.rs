// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Streaming decoder for VCD text dumps: header commands build the scope
//! tree and variable declarations, value-change records are dispatched per
//! classified first byte. The parser consumes only complete tokens; the
//! caller preserves the unconsumed tail across buffer refills.

use crate::buffer::TokenBuffer;
use crate::error::{DecodeError, ErrorKind, Result};
use crate::index::IdIndex;
use crate::progress::Progress;
use crate::record::{DataKind, Record, ScopeId, ScopeTree, TimeBase};
use crate::tokens::{
    self, LogicLevel, STATE_0, STATE_X, TEXT_TOKENS, TOKEN_CHANGE16, TOKEN_CHANGE2, TOKEN_CHANGE4,
    TOKEN_COMMAND, TOKEN_REAL, TOKEN_STRING, TOKEN_TIME, TOKEN_VECTOR, TOKEN_WS,
};
use crate::variable::{self, FilterList, VarRecord};
use crate::LoadConfig;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::io::Read;

/// Longest vector payload a single change record may carry.
const MAX_VECTOR_STATES: usize = 4096;

/// Reads a complete text dump into a record.
pub fn read(input: impl Read, config: &LoadConfig, progress: &Progress) -> Result<Record> {
    let mut decoder = TextDecoder::new(config, progress);
    let mut buffer = TokenBuffer::new(input);
    info!("text dump decoder started");

    while !decoder.closed {
        if progress.is_cancelled() {
            info!("text dump decode cancelled, keeping partial data");
            break;
        }
        let offset = buffer.offset();
        let view = match buffer.fill()? {
            Some(view) => view,
            None => break,
        };
        let used = decoder.parse_chunk(view, offset)?;
        buffer.consume(used)?;
        progress.add_bytes(used as u64);
        if buffer.done() {
            break;
        }
    }

    decoder.finish()
}

/// Tries to guess whether the input could be a text dump by looking for a
/// leading command start.
pub fn looks_like_text_dump(prefix: &[u8]) -> bool {
    prefix.iter().copied().find(|b| !tokens::is_whitespace(*b)) == Some(b'$')
}

struct TextDecoder<'a> {
    config: &'a LoadConfig,
    progress: &'a Progress,

    // header state, alive until the record is initialized
    tree: ScopeTree,
    scope: ScopeId,
    hierarchy_enabled: bool,
    time_base: TimeBase,
    time_zero: i64,
    vars: Vec<VarRecord>,
    var_handles: Vec<u64>,
    ids: FxHashMap<Vec<u8>, usize>,

    // decode state
    record: Option<Record>,
    index: IdIndex,
    var_writers: Vec<Option<usize>>,
    initialized: bool,
    opened: bool,
    closed: bool,
    current: i64,
    last_raw_time: i64,
    start: i64,
    end: i64,
    delay: i64,
    dilate: f64,
    states: Vec<u8>,
}

impl<'a> TextDecoder<'a> {
    fn new(config: &'a LoadConfig, progress: &'a Progress) -> Self {
        TextDecoder {
            config,
            progress,
            tree: ScopeTree::new(),
            scope: ScopeTree::ROOT,
            hierarchy_enabled: true,
            time_base: TimeBase::default(),
            time_zero: 0,
            vars: Vec::new(),
            var_handles: Vec::new(),
            ids: FxHashMap::default(),
            record: None,
            index: IdIndex::default(),
            var_writers: Vec::new(),
            initialized: false,
            opened: false,
            closed: false,
            current: 0,
            last_raw_time: 0,
            start: i64::MIN,
            end: i64::MAX,
            delay: 0,
            dilate: 1.0,
            states: Vec::with_capacity(64),
        }
    }

    /// Parses as much of `buf` as forms complete tokens and returns the
    /// number of consumed bytes.
    fn parse_chunk(&mut self, buf: &[u8], chunk_offset: u64) -> Result<usize> {
        let mut n = 0usize;
        while n < buf.len() {
            let sel = TEXT_TOKENS[buf[n] as usize];
            let next = match sel & 0xf0 {
                TOKEN_WS => Some(n + 1),
                TOKEN_TIME => self.parse_time(buf, n)?,
                TOKEN_COMMAND => self.parse_command(buf, n, chunk_offset)?,
                TOKEN_CHANGE2 => {
                    self.parse_scalar(buf, n, LogicLevel::Two, sel & 0x0f, chunk_offset)?
                }
                TOKEN_CHANGE4 => {
                    self.parse_scalar(buf, n, LogicLevel::Four, sel & 0x0f, chunk_offset)?
                }
                TOKEN_CHANGE16 => {
                    self.parse_scalar(buf, n, LogicLevel::Sixteen, sel & 0x0f, chunk_offset)?
                }
                TOKEN_VECTOR => self.parse_vector(buf, n, chunk_offset)?,
                TOKEN_REAL => self.parse_real(buf, n, chunk_offset)?,
                TOKEN_STRING => self.parse_string(buf, n, chunk_offset)?,
                _ => {
                    return Err(DecodeError::new(
                        ErrorKind::InvalidToken,
                        format!("invalid character 0x{:02x} in dump", buf[n]),
                    )
                    .with_offset(chunk_offset + n as u64)
                    .with_snippet(buf, n))
                }
            };
            match next {
                Some(next_n) => {
                    debug_assert!(next_n > n);
                    n = next_n;
                    if self.closed {
                        return Ok(n);
                    }
                }
                // incomplete token: leave it for the next refill
                None => return Ok(n),
            }
        }
        Ok(n)
    }

    // ------------------------------------------------------------------
    // time markers and record lifecycle
    // ------------------------------------------------------------------

    fn parse_time(&mut self, buf: &[u8], n: usize) -> Result<Option<usize>> {
        let mut time = 0i64;
        for i in n + 1..buf.len() {
            let b = buf[i];
            if !b.is_ascii_digit() {
                self.last_raw_time = time;
                self.current = self.transform(time);
                self.progress.set_current_time(self.current);
                if !self.initialized {
                    info!("initializing record structure on first time marker");
                    self.initialize()?;
                    self.try_open();
                } else if !self.opened {
                    self.try_open();
                } else if !self.closed && self.current > self.end {
                    let end = self.end;
                    self.record_mut().close(end);
                    self.closed = true;
                }
                return Ok(Some(i));
            }
            time = time * 10 + (b - b'0') as i64;
        }
        Ok(None)
    }

    fn transform(&self, raw: i64) -> i64 {
        if self.dilate == 1.0 {
            raw + self.delay
        } else {
            ((raw + self.delay) as f64 * self.dilate) as i64
        }
    }

    fn try_open(&mut self) {
        if !self.opened && self.current >= self.start {
            let at = if self.start != i64::MIN { self.start } else { self.current };
            self.record_mut().open(at);
            self.opened = true;
        }
    }

    fn emitting(&self) -> bool {
        self.opened && !self.closed
    }

    fn record_mut(&mut self) -> &mut Record {
        self.record.as_mut().expect("record is initialized")
    }

    /// Creates the record and the signal/writer structure from the parsed
    /// declarations, then materializes the configuration against the
    /// established domain base.
    fn initialize(&mut self) -> Result<()> {
        debug_assert!(!self.initialized);
        let tree = std::mem::take(&mut self.tree);
        let mut record = Record::new("VCD Record", self.time_base, tree);

        variable::identify_groups(&mut self.vars, self.config.vector);
        let include = FilterList::parse(self.config.include.as_deref());
        let exclude = FilterList::parse(self.config.exclude.as_deref());
        let signals = variable::create_signals(&mut record, &self.vars, &include, &exclude);
        self.var_writers = variable::create_writers(&record, &signals);
        info!("created {} signal writers", self.var_writers.iter().flatten().count());

        self.index = IdIndex::build(
            self.var_handles
                .iter()
                .zip(&self.var_writers)
                .filter_map(|(handle, writer)| writer.map(|w| (*handle, w))),
        );

        let base = self.time_base;
        let parse = |text: &Option<String>, fallback: i64| {
            text.as_deref()
                .and_then(|t| base.parse_value(t))
                .unwrap_or(fallback)
        };
        self.start = parse(&self.config.start, i64::MIN);
        self.end = parse(&self.config.end, i64::MAX);
        self.delay = parse(&self.config.delay, 0) + self.time_zero;
        self.dilate = self.config.dilate.unwrap_or(1.0);
        self.current = self.transform(self.last_raw_time);

        if !self.config.empty {
            info!("removing empty scopes from record structure");
            record.prune_empty_scopes();
        }
        if let Some(pattern) = self.config.hierarchy.as_deref().filter(|p| !p.is_empty()) {
            if self.hierarchy_enabled {
                info!("building hierarchical signal organization");
                let re = regex::Regex::new(pattern).map_err(|e| {
                    DecodeError::new(ErrorKind::InvalidCommand, format!("hierarchy pattern: {e}"))
                })?;
                record.resolve_hierarchy(&re);
            }
        }

        self.record = Some(record);
        self.initialized = true;
        Ok(())
    }

    fn finish(mut self) -> Result<Record> {
        if !self.initialized {
            // no time marker and no $dumpvars: still deliver the structure
            warn!("input ended before any time marker, record holds no samples");
            self.initialize()?;
        }
        let current = self.current;
        if !self.closed {
            self.record_mut().close(current + 1);
        }
        Ok(self.record.take().expect("record was initialized"))
    }

    // ------------------------------------------------------------------
    // value changes
    // ------------------------------------------------------------------

    fn require_initialized(&self, buf: &[u8], n: usize, chunk_offset: u64) -> Result<()> {
        if !self.initialized {
            return Err(DecodeError::new(
                ErrorKind::InvalidToken,
                "value change before the record was initialized",
            )
            .with_offset(chunk_offset + n as u64)
            .with_snippet(buf, n));
        }
        Ok(())
    }

    /// Skips a value change outside the emission window, to the end of line.
    fn skip_change(&self, buf: &[u8], n: usize) -> Option<usize> {
        buf[n + 1..].iter().position(|b| *b == b'\n').map(|p| n + 1 + p)
    }

    /// Reads the identifier token starting at `from`; returns its numeric
    /// form and the position of the terminating byte.
    fn read_id(buf: &[u8], from: usize) -> Option<(u64, usize)> {
        let mut index = 0u64;
        for i in from..buf.len() {
            let b = buf[i];
            if !(b'!'..=b'~').contains(&b) {
                if i == from {
                    return Some((u64::MAX, i));
                }
                return Some((index, i));
            }
            index = index.wrapping_mul(100).wrapping_add((b - 0x20) as u64);
        }
        None
    }

    fn parse_scalar(
        &mut self,
        buf: &[u8],
        n: usize,
        level: LogicLevel,
        state: u8,
        chunk_offset: u64,
    ) -> Result<Option<usize>> {
        self.require_initialized(buf, n, chunk_offset)?;
        if !self.emitting() {
            return Ok(self.skip_change(buf, n));
        }
        let (id, end) = match Self::read_id(buf, n + 1) {
            Some(found) => found,
            None => return Ok(None),
        };
        let tag = level == LogicLevel::Four && state == STATE_X;
        self.emit_scalar(id, level, state, tag)?;
        Ok(Some(end))
    }

    fn emit_scalar(&mut self, id: u64, level: LogicLevel, state: u8, tag: bool) -> Result<()> {
        let time = self.current;
        let writers = self.index.lookup(id);
        if writers.is_empty() {
            debug!("no writer for identifier {id}");
        }
        for &wid in writers {
            match self.record.as_mut().expect("initialized").writer(wid) {
                crate::record::SampleWriter::Logic(w) => {
                    let preceding = if w.width > 1 { STATE_0 } else { state };
                    w.write_bit(time, tag, level, preceding, state)?;
                }
                crate::record::SampleWriter::Event(w) => w.write(time, tag)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_vector(&mut self, buf: &[u8], n: usize, chunk_offset: u64) -> Result<Option<usize>> {
        self.require_initialized(buf, n, chunk_offset)?;
        if !self.emitting() {
            return Ok(self.skip_change(buf, n));
        }

        self.states.clear();
        let mut level = LogicLevel::Two;
        let mut tag = false;
        let mut i = n + 1;
        loop {
            if i >= buf.len() {
                return Ok(None);
            }
            if self.states.len() >= MAX_VECTOR_STATES {
                break;
            }
            let sel = TEXT_TOKENS[buf[i] as usize];
            match sel & 0xf0 {
                TOKEN_CHANGE2 => self.states.push(sel & 0x0f),
                TOKEN_CHANGE4 => {
                    self.states.push(sel & 0x0f);
                    if level < LogicLevel::Four {
                        level = LogicLevel::Four;
                    }
                    if sel & 0x0f == STATE_X {
                        tag = true;
                    }
                }
                TOKEN_CHANGE16 => {
                    self.states.push(sel & 0x0f);
                    level = LogicLevel::Sixteen;
                }
                TOKEN_WS => {
                    i += 1;
                    break;
                }
                _ => {
                    return Err(DecodeError::new(
                        ErrorKind::InvalidToken,
                        "invalid logic state in vector change",
                    )
                    .with_offset(chunk_offset + i as u64)
                    .with_snippet(buf, i))
                }
            }
            i += 1;
        }

        // whitespace between the vector and its identifier
        while i < buf.len() && (buf[i] == b' ' || buf[i] == b'\t') {
            i += 1;
        }
        let (id, end) = match Self::read_id(buf, i) {
            Some(found) => found,
            None => return Ok(None),
        };
        if self.states.is_empty() {
            return Err(DecodeError::new(
                ErrorKind::InvalidToken,
                "vector change without states",
            )
            .with_offset(chunk_offset + n as u64)
            .with_snippet(buf, n));
        }

        let time = self.current;
        let writers = self.index.lookup(id);
        for &wid in writers {
            match self.record.as_mut().expect("initialized").writer(wid) {
                crate::record::SampleWriter::Logic(w) => {
                    let states = &self.states;
                    let width = w.width as usize;
                    let mut first = 0usize;
                    if states.len() > width {
                        first += states.len() - width;
                    }
                    // left-extension: a leading 1 on a short vector extends with 0
                    let preceding;
                    if states.len() < width && states[first] == tokens::STATE_1 {
                        preceding = STATE_0;
                    } else {
                        preceding = states[first];
                        first += 1;
                    }
                    while first < states.len() && states[first] == preceding {
                        first += 1;
                    }
                    w.write_states(time, tag, level, preceding, &states[first..])?;
                }
                crate::record::SampleWriter::Event(w) => w.write(time, tag)?,
                _ => {}
            }
        }
        Ok(Some(end))
    }

    fn parse_real(&mut self, buf: &[u8], n: usize, chunk_offset: u64) -> Result<Option<usize>> {
        self.require_initialized(buf, n, chunk_offset)?;
        if !self.emitting() {
            return Ok(self.skip_change(buf, n));
        }
        let mut i = n + 1;
        while i < buf.len() && !tokens::is_whitespace(buf[i]) {
            i += 1;
        }
        if i >= buf.len() {
            return Ok(None);
        }
        let text = std::str::from_utf8(&buf[n + 1..i]).ok();
        let value: f64 = match text.and_then(|t| t.parse().ok()) {
            Some(value) => value,
            None => {
                return Err(DecodeError::new(
                    ErrorKind::InvalidNumeric,
                    "malformed real value change",
                )
                .with_offset(chunk_offset + n as u64)
                .with_snippet(buf, n))
            }
        };
        while i < buf.len() && (buf[i] == b' ' || buf[i] == b'\t') {
            i += 1;
        }
        let (id, end) = match Self::read_id(buf, i) {
            Some(found) => found,
            None => return Ok(None),
        };
        let time = self.current;
        let writers = self.index.lookup(id);
        for &wid in writers {
            if let crate::record::SampleWriter::Float(w) =
                self.record.as_mut().expect("initialized").writer(wid)
            {
                w.write(time, false, value)?;
            }
        }
        Ok(Some(end))
    }

    fn parse_string(&mut self, buf: &[u8], n: usize, chunk_offset: u64) -> Result<Option<usize>> {
        self.require_initialized(buf, n, chunk_offset)?;
        if !self.emitting() {
            return Ok(self.skip_change(buf, n));
        }
        let mut i = n + 1;
        while i < buf.len() && !tokens::is_whitespace(buf[i]) {
            i += 1;
        }
        if i >= buf.len() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&buf[n + 1..i]).into_owned();
        while i < buf.len() && (buf[i] == b' ' || buf[i] == b'\t') {
            i += 1;
        }
        let (id, end) = match Self::read_id(buf, i) {
            Some(found) => found,
            None => return Ok(None),
        };
        let time = self.current;
        let writers = self.index.lookup(id);
        for &wid in writers {
            if let crate::record::SampleWriter::Text(w) =
                self.record.as_mut().expect("initialized").writer(wid)
            {
                w.write(time, false, value.clone())?;
            }
        }
        Ok(Some(end))
    }

    // ------------------------------------------------------------------
    // header commands
    // ------------------------------------------------------------------

    fn parse_command(&mut self, buf: &[u8], n: usize, chunk_offset: u64) -> Result<Option<usize>> {
        let mut i = n + 1;
        while i < buf.len() && !tokens::is_whitespace(buf[i]) {
            i += 1;
        }
        if i >= buf.len() {
            return Ok(None);
        }
        let command = &buf[n + 1..i];
        match command {
            b"end" | b"dumpall" | b"dumpoff" | b"dumpon" => Ok(Some(i)),
            b"dumpvars" => {
                if !self.initialized {
                    info!("initializing record structure on $dumpvars");
                    self.initialize()?;
                    self.try_open();
                }
                Ok(Some(i))
            }
            b"comment" | b"date" | b"version" | b"enddefinitions" => {
                Ok(find_end_token(buf, i).map(|(_, next)| next))
            }
            b"upscope" => Ok(find_end_token(buf, i).map(|(_, next)| {
                if let Some(parent) = self.tree.parent(self.scope) {
                    self.scope = parent;
                }
                next
            })),
            b"scope" => {
                let (payload, next) = match find_end_token(buf, i) {
                    Some(found) => found,
                    None => return Ok(None),
                };
                // nesting below the root disables hierarchy resolution
                if self.scope != ScopeTree::ROOT {
                    self.hierarchy_enabled = false;
                }
                let mut parts = payload
                    .split(|b| tokens::is_whitespace(*b))
                    .filter(|t| !t.is_empty());
                let (_kind, name) = match (parts.next(), parts.next()) {
                    (Some(kind), Some(name)) => (kind, name),
                    _ => {
                        return Err(DecodeError::new(
                            ErrorKind::InvalidCommand,
                            "scope definition needs a kind and a name",
                        )
                        .with_offset(chunk_offset + n as u64)
                        .with_snippet(buf, n))
                    }
                };
                let name = String::from_utf8_lossy(name).into_owned();
                self.scope = self.tree.add_child(self.scope, &name);
                Ok(Some(next))
            }
            b"var" => {
                let (payload, next) = match find_end_token(buf, i) {
                    Some(found) => found,
                    None => return Ok(None),
                };
                let payload = payload.to_vec();
                self.parse_var(&payload, buf, n, chunk_offset)?;
                Ok(Some(next))
            }
            b"timescale" => {
                let (payload, next) = match find_end_token(buf, i) {
                    Some(found) => found,
                    None => return Ok(None),
                };
                let payload = payload.to_vec();
                self.parse_timescale(&payload, buf, n, chunk_offset)?;
                Ok(Some(next))
            }
            b"timezero" => {
                let (payload, next) = match find_end_token(buf, i) {
                    Some(found) => found,
                    None => return Ok(None),
                };
                let text = String::from_utf8_lossy(payload);
                self.time_zero = text.trim().parse().map_err(|_| {
                    DecodeError::new(ErrorKind::InvalidNumeric, "malformed $timezero offset")
                        .with_offset(chunk_offset + n as u64)
                        .with_snippet(buf, n)
                })?;
                Ok(Some(next))
            }
            other => Err(DecodeError::new(
                ErrorKind::InvalidCommand,
                format!("unknown command ${}", String::from_utf8_lossy(other)),
            )
            .with_offset(chunk_offset + n as u64)
            .with_snippet(buf, n)),
        }
    }

    fn parse_timescale(
        &mut self,
        payload: &[u8],
        buf: &[u8],
        n: usize,
        chunk_offset: u64,
    ) -> Result<()> {
        let text = payload
            .split(|b| tokens::is_whitespace(*b))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .concat();
        let digits = text.iter().take_while(|b| b.is_ascii_digit()).count();
        let base = TimeBase::parse(&text[..digits], &text[digits..]).ok_or_else(|| {
            DecodeError::new(ErrorKind::InvalidCommand, "malformed $timescale definition")
                .with_offset(chunk_offset + n as u64)
                .with_snippet(buf, n)
        })?;
        self.time_base = base;
        info!("domain base set to {base}");
        Ok(())
    }

    fn parse_var(
        &mut self,
        payload: &[u8],
        buf: &[u8],
        n: usize,
        chunk_offset: u64,
    ) -> Result<()> {
        let fail = |kind: ErrorKind, message: &str| {
            DecodeError::new(kind, message.to_string())
                .with_offset(chunk_offset + n as u64)
                .with_snippet(buf, n)
        };

        let fields: Vec<&[u8]> = payload
            .split(|b| tokens::is_whitespace(*b))
            .filter(|t| !t.is_empty())
            .collect();
        if fields.len() < 4 {
            return Err(fail(
                ErrorKind::InvalidCommand,
                "variable definition needs type, width, identifier and name",
            ));
        }
        let type_desc = String::from_utf8_lossy(fields[0]).into_owned();
        let kind = match fields[0] {
            b"event" => DataKind::Event,
            b"real" => DataKind::Float,
            b"string" => DataKind::Text,
            _ => DataKind::Logic,
        };
        let width = if kind == DataKind::Logic {
            std::str::from_utf8(fields[1])
                .ok()
                .and_then(|t| t.parse::<u32>().ok())
                .ok_or_else(|| fail(ErrorKind::InvalidNumeric, "malformed variable width"))?
        } else {
            0
        };
        let id_token = fields[2].to_vec();
        let name = fields[3..]
            .iter()
            .map(|t| String::from_utf8_lossy(t))
            .collect::<Vec<_>>()
            .join(" ");

        let mut var = VarRecord::new(name, kind, width, self.scope, type_desc);
        var.check_range_constraints()
            .map_err(|e| DecodeError { offset: Some(chunk_offset + n as u64), ..e })?;

        if let Some(&first) = self.ids.get(&id_token) {
            // shared identifier: both variables alias one dataset
            let other = &mut self.vars[first];
            if other.kind != var.kind || other.width != var.width {
                return Err(fail(
                    ErrorKind::InvariantViolation,
                    "shared identifiers must have the same width",
                ));
            }
            other.shared = true;
            var.shared = true;
        } else {
            self.ids.insert(id_token.clone(), self.vars.len());
        }
        self.var_handles.push(token_numeric(&id_token));
        self.vars.push(var);
        Ok(())
    }
}

/// Numeric form of an identifier token: base-100 digits of byte − 0x20.
fn token_numeric(token: &[u8]) -> u64 {
    let mut index = 0u64;
    for b in token {
        index = index.wrapping_mul(100).wrapping_add((*b - 0x20) as u64);
    }
    index
}

/// Finds the literal `$end` token from `from` on. Returns the payload in
/// front of it and the position just past the token, or `None` when the
/// buffer ends first.
fn find_end_token(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let mut j = from;
    while j + 4 <= buf.len() {
        if buf[j] == b'$' && &buf[j + 1..j + 4] == b"end" {
            return Some((&buf[from..j], j + 4));
        }
        j += 1;
    }
    None
}
