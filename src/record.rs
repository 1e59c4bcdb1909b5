// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! The in-memory record model the decoders fill: domain base, scope tree,
//! signals and their sample writers.

use crate::error::{DecodeError, Result};
use crate::tokens::LogicLevel;
use log::info;

/// Time units of the domain base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    FemtoSeconds,
    PicoSeconds,
    NanoSeconds,
    MicroSeconds,
    MilliSeconds,
    Seconds,
}

impl TimeUnit {
    pub fn to_exponent(&self) -> i32 {
        match self {
            TimeUnit::FemtoSeconds => -15,
            TimeUnit::PicoSeconds => -12,
            TimeUnit::NanoSeconds => -9,
            TimeUnit::MicroSeconds => -6,
            TimeUnit::MilliSeconds => -3,
            TimeUnit::Seconds => 0,
        }
    }

    fn from_bytes(name: &[u8]) -> Option<TimeUnit> {
        match name {
            b"fs" => Some(TimeUnit::FemtoSeconds),
            b"ps" => Some(TimeUnit::PicoSeconds),
            b"ns" => Some(TimeUnit::NanoSeconds),
            b"us" => Some(TimeUnit::MicroSeconds),
            b"ms" => Some(TimeUnit::MilliSeconds),
            b"s" => Some(TimeUnit::Seconds),
            _ => None,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            TimeUnit::FemtoSeconds => "fs",
            TimeUnit::PicoSeconds => "ps",
            TimeUnit::NanoSeconds => "ns",
            TimeUnit::MicroSeconds => "us",
            TimeUnit::MilliSeconds => "ms",
            TimeUnit::Seconds => "s",
        }
    }
}

/// The domain base shared by all timestamps of a record: a factor of 1, 10
/// or 100 times a time unit. Set exactly once before any sample is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub factor: u32,
    pub unit: TimeUnit,
}

impl Default for TimeBase {
    fn default() -> Self {
        TimeBase { factor: 1, unit: TimeUnit::NanoSeconds }
    }
}

impl TimeBase {
    pub fn new(factor: u32, unit: TimeUnit) -> Self {
        debug_assert!(matches!(factor, 1 | 10 | 100));
        TimeBase { factor, unit }
    }

    /// Exponent of one domain unit in seconds.
    pub fn exponent(&self) -> i32 {
        let factor_exp = match self.factor {
            100 => 2,
            10 => 1,
            _ => 0,
        };
        self.unit.to_exponent() + factor_exp
    }

    /// Parses the `$timescale` parameter: a factor of 1, 10 or 100 followed
    /// by a unit, with optional whitespace in between.
    pub fn parse(factor: &[u8], unit: &[u8]) -> Option<TimeBase> {
        let factor = match factor {
            b"1" => 1,
            b"10" => 10,
            b"100" => 100,
            _ => return None,
        };
        Some(TimeBase::new(factor, TimeUnit::from_bytes(unit)?))
    }

    /// Builds a base from a power-of-ten exponent (binary trace timescale).
    /// An exponent between unit steps selects the 10x or 100x factor.
    pub fn from_exponent(exponent: i32) -> Option<TimeBase> {
        let clamped = exponent.clamp(-15, 0);
        if clamped != exponent {
            return None;
        }
        let unit_exp = exponent.div_euclid(3) * 3;
        let unit = match unit_exp {
            -15 => TimeUnit::FemtoSeconds,
            -12 => TimeUnit::PicoSeconds,
            -9 => TimeUnit::NanoSeconds,
            -6 => TimeUnit::MicroSeconds,
            -3 => TimeUnit::MilliSeconds,
            _ => TimeUnit::Seconds,
        };
        let factor = match exponent - unit_exp {
            2 => 100,
            1 => 10,
            _ => 1,
        };
        Some(TimeBase { factor, unit })
    }

    /// Parses a configuration value expressed in domain units: a plain
    /// number, or a number with a unit suffix which is rescaled into this
    /// base. Returns `None` for an empty or malformed value.
    pub fn parse_value(&self, text: &str) -> Option<i64> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let split = text
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(text.len());
        let (number, suffix) = text.split_at(split);
        let value: f64 = number.parse().ok()?;
        let suffix = suffix.trim();
        if suffix.is_empty() {
            return Some(value.round() as i64);
        }
        let unit = TimeUnit::from_bytes(suffix.as_bytes())?;
        let scale = 10f64.powi(unit.to_exponent() - self.exponent());
        Some((value * scale).round() as i64)
    }
}

impl std::fmt::Display for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.factor, self.unit.suffix())
    }
}

pub type ScopeId = usize;
pub type SignalId = usize;
pub type WriterId = usize;

/// A named node of the scope tree. Parent links never change after creation.
#[derive(Debug)]
pub struct ScopeNode {
    pub name: String,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    pub signals: Vec<SignalId>,
}

/// Arena-backed scope tree; node 0 is the root.
#[derive(Debug)]
pub struct ScopeTree {
    nodes: Vec<ScopeNode>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        ScopeTree {
            nodes: vec![ScopeNode {
                name: String::new(),
                parent: None,
                children: Vec::new(),
                signals: Vec::new(),
            }],
        }
    }
}

impl ScopeTree {
    pub const ROOT: ScopeId = 0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: ScopeId) -> &ScopeNode {
        &self.nodes[id]
    }

    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.nodes[id].parent
    }

    pub fn child_by_name(&self, parent: ScopeId, name: &str) -> Option<ScopeId> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|c| self.nodes[*c].name == name)
    }

    /// Returns the existing child of that name or creates a new one.
    pub fn add_child(&mut self, parent: ScopeId, name: &str) -> ScopeId {
        if let Some(existing) = self.child_by_name(parent, name) {
            return existing;
        }
        let id = self.nodes.len();
        self.nodes.push(ScopeNode {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            signals: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn full_name(&self, id: ScopeId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            if c != Self::ROOT {
                parts.push(self.nodes[c].name.as_str());
            }
            cursor = self.nodes[c].parent;
        }
        parts.reverse();
        parts.join(".")
    }

    fn attach_signal(&mut self, scope: ScopeId, signal: SignalId) {
        self.nodes[scope].signals.push(signal);
    }

    fn has_signals_below(&self, id: ScopeId) -> bool {
        if !self.nodes[id].signals.is_empty() {
            return true;
        }
        self.nodes[id]
            .children
            .iter()
            .any(|c| self.has_signals_below(*c))
    }
}

/// Data type of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Logic,
    Float,
    Text,
    Event,
}

/// One logic sample: every bit carries a state code, expanded to the
/// signal's width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicSample {
    pub time: i64,
    pub tag: bool,
    pub level: LogicLevel,
    pub states: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatSample {
    pub time: i64,
    pub tag: bool,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSample {
    pub time: i64,
    pub tag: bool,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSample {
    pub time: i64,
    pub tag: bool,
}

fn check_monotonic(last: &mut Option<i64>, time: i64) -> Result<()> {
    if let Some(previous) = *last {
        if time < previous {
            return Err(DecodeError::invariant(format!(
                "timestamp {time} is before the previously written {previous}"
            )));
        }
    }
    *last = Some(time);
    Ok(())
}

#[derive(Debug, Default)]
pub struct LogicWriter {
    pub width: u32,
    last_time: Option<i64>,
    pub samples: Vec<LogicSample>,
}

impl LogicWriter {
    /// Writes a single-bit change. For signals wider than one bit the state
    /// lands in the lowest bit and `preceding` fills the rest.
    pub fn write_bit(
        &mut self,
        time: i64,
        tag: bool,
        level: LogicLevel,
        preceding: u8,
        state: u8,
    ) -> Result<()> {
        check_monotonic(&mut self.last_time, time)?;
        let width = self.width.max(1) as usize;
        let mut states = vec![preceding; width];
        states[width - 1] = state;
        self.samples.push(LogicSample { time, tag, level, states });
        Ok(())
    }

    /// Writes a vector change given as a preceding fill state plus the
    /// differing tail. The tail is right-aligned; over-wide tails keep their
    /// low bits.
    pub fn write_states(
        &mut self,
        time: i64,
        tag: bool,
        level: LogicLevel,
        preceding: u8,
        tail: &[u8],
    ) -> Result<()> {
        check_monotonic(&mut self.last_time, time)?;
        let width = self.width.max(1) as usize;
        let mut states = vec![preceding; width];
        let keep = tail.len().min(width);
        states[width - keep..].copy_from_slice(&tail[tail.len() - keep..]);
        self.samples.push(LogicSample { time, tag, level, states });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FloatWriter {
    last_time: Option<i64>,
    pub samples: Vec<FloatSample>,
}

impl FloatWriter {
    pub fn write(&mut self, time: i64, tag: bool, value: f64) -> Result<()> {
        check_monotonic(&mut self.last_time, time)?;
        self.samples.push(FloatSample { time, tag, value });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TextWriter {
    last_time: Option<i64>,
    pub samples: Vec<TextSample>,
}

impl TextWriter {
    pub fn write(&mut self, time: i64, tag: bool, value: String) -> Result<()> {
        check_monotonic(&mut self.last_time, time)?;
        self.samples.push(TextSample { time, tag, value });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EventWriter {
    last_time: Option<i64>,
    pub samples: Vec<EventSample>,
}

impl EventWriter {
    pub fn write(&mut self, time: i64, tag: bool) -> Result<()> {
        check_monotonic(&mut self.last_time, time)?;
        self.samples.push(EventSample { time, tag });
        Ok(())
    }
}

/// Sample sink bound to one signal. A tagged variant instead of dynamic
/// dispatch: emission selects the arm at the call site.
#[derive(Debug)]
pub enum SampleWriter {
    Logic(LogicWriter),
    Float(FloatWriter),
    Text(TextWriter),
    Event(EventWriter),
}

impl SampleWriter {
    pub fn for_kind(kind: DataKind, width: u32) -> SampleWriter {
        match kind {
            DataKind::Logic => SampleWriter::Logic(LogicWriter {
                width,
                ..LogicWriter::default()
            }),
            DataKind::Float => SampleWriter::Float(FloatWriter::default()),
            DataKind::Text => SampleWriter::Text(TextWriter::default()),
            DataKind::Event => SampleWriter::Event(EventWriter::default()),
        }
    }

    pub fn as_logic(&self) -> Option<&LogicWriter> {
        match self {
            SampleWriter::Logic(w) => Some(w),
            _ => None,
        }
    }

    pub fn sample_count(&self) -> usize {
        match self {
            SampleWriter::Logic(w) => w.samples.len(),
            SampleWriter::Float(w) => w.samples.len(),
            SampleWriter::Text(w) => w.samples.len(),
            SampleWriter::Event(w) => w.samples.len(),
        }
    }
}

/// Metadata of one created signal.
#[derive(Debug)]
pub struct SignalMeta {
    pub name: String,
    pub scope: ScopeId,
    pub kind: DataKind,
    pub width: u32,
    pub type_desc: String,
    pub writer: WriterId,
}

/// The top-level container of the scope tree and the signal-writer set.
/// Mutable during decoding; sealed by `close` with the final timestamp.
#[derive(Debug)]
pub struct Record {
    pub name: String,
    pub base: TimeBase,
    pub tree: ScopeTree,
    pub signals: Vec<SignalMeta>,
    pub writers: Vec<SampleWriter>,
    opened_at: Option<i64>,
    closed_at: Option<i64>,
}

impl Record {
    pub fn new(name: impl Into<String>, base: TimeBase, tree: ScopeTree) -> Self {
        Record {
            name: name.into(),
            base,
            tree,
            signals: Vec::new(),
            writers: Vec::new(),
            opened_at: None,
            closed_at: None,
        }
    }

    pub fn add_signal(
        &mut self,
        name: impl Into<String>,
        scope: ScopeId,
        kind: DataKind,
        width: u32,
        type_desc: impl Into<String>,
    ) -> SignalId {
        let writer = self.writers.len();
        self.writers.push(SampleWriter::for_kind(kind, width));
        let id = self.signals.len();
        self.signals.push(SignalMeta {
            name: name.into(),
            scope,
            kind,
            width,
            type_desc: type_desc.into(),
            writer,
        });
        self.tree.attach_signal(scope, id);
        id
    }

    pub fn open(&mut self, time: i64) {
        if self.opened_at.is_none() {
            self.opened_at = Some(time);
            info!("record opened at {time}");
        }
    }

    pub fn close(&mut self, time: i64) {
        if self.closed_at.is_none() {
            self.closed_at = Some(time);
            info!("record closed at {time}");
        }
    }

    pub fn is_opened(&self) -> bool {
        self.opened_at.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    pub fn opened_at(&self) -> Option<i64> {
        self.opened_at
    }

    pub fn closed_at(&self) -> Option<i64> {
        self.closed_at
    }

    pub fn writer(&mut self, id: WriterId) -> &mut SampleWriter {
        &mut self.writers[id]
    }

    /// Full hierarchical name of a signal.
    pub fn signal_full_name(&self, id: SignalId) -> String {
        let meta = &self.signals[id];
        let scope_name = self.tree.full_name(meta.scope);
        if scope_name.is_empty() {
            meta.name.clone()
        } else {
            format!("{scope_name}.{}", meta.name)
        }
    }

    pub fn find_signal(&self, full_name: &str) -> Option<SignalId> {
        (0..self.signals.len()).find(|id| self.signal_full_name(*id) == full_name)
    }

    /// Detaches scopes that have no signals anywhere below them.
    pub fn prune_empty_scopes(&mut self) {
        let mut keep: Vec<Vec<ScopeId>> = Vec::with_capacity(self.tree.nodes.len());
        for node in &self.tree.nodes {
            let kept = node
                .children
                .iter()
                .copied()
                .filter(|c| self.tree.has_signals_below(*c))
                .collect();
            keep.push(kept);
        }
        for (node, kept) in self.tree.nodes.iter_mut().zip(keep) {
            node.children = kept;
        }
    }

    /// Splits signal names on `pattern` and moves each signal into the
    /// scope chain formed by the leading parts.
    pub fn resolve_hierarchy(&mut self, pattern: &regex::Regex) {
        for id in 0..self.signals.len() {
            let name = self.signals[id].name.clone();
            let parts: Vec<&str> = pattern.split(&name).filter(|p| !p.is_empty()).collect();
            if parts.len() < 2 {
                continue;
            }
            let mut scope = self.signals[id].scope;
            for part in &parts[..parts.len() - 1] {
                scope = self.tree.add_child(scope, part);
            }
            let old_scope = self.signals[id].scope;
            self.tree.nodes[old_scope].signals.retain(|s| *s != id);
            self.tree.attach_signal(scope, id);
            self.signals[id].scope = scope;
            self.signals[id].name = parts[parts.len() - 1].to_string();
        }
    }
}
