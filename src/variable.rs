// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Pre-creation variable records and the registration helpers that turn them
//! into signals and writers: vector grouping, include/exclude filtering and
//! bit-range extraction from declared names.

use crate::error::{DecodeError, Result};
use crate::record::{DataKind, Record, ScopeId, SignalId, WriterId};
use log::{debug, info};

/// Bit-range suffix of a declared name: `[n]` carries only the high index,
/// `[n:m]` both, swapped so that high >= low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRange {
    pub high: i64,
    pub low: Option<i64>,
}

/// A variable as declared in the dump, before signal creation.
#[derive(Debug, Clone)]
pub struct VarRecord {
    pub name: String,
    pub kind: DataKind,
    /// Declared bit width; logic only, 0 allowed for variable-length text.
    pub width: u32,
    pub range: Option<BitRange>,
    /// Base name in front of the bit-range suffix, when one exists.
    pub index_base: Option<String>,
    pub scope: ScopeId,
    pub shared: bool,
    pub type_desc: String,
    /// Vector group this variable was assigned to, if any.
    pub group: Option<String>,
}

impl VarRecord {
    pub fn new(
        name: impl Into<String>,
        kind: DataKind,
        width: u32,
        scope: ScopeId,
        type_desc: impl Into<String>,
    ) -> Self {
        let (name, index_base, range) = split_bit_range(&name.into());
        VarRecord {
            name,
            kind,
            width,
            range,
            index_base,
            scope,
            shared: false,
            type_desc: type_desc.into(),
            group: None,
        }
    }

    /// Real and text variables must not carry bit-range indices.
    pub fn check_range_constraints(&self) -> Result<()> {
        if self.range.is_some() && matches!(self.kind, DataKind::Float | DataKind::Text) {
            return Err(DecodeError::invariant(format!(
                "{} data cannot have vector indices: {}",
                if self.kind == DataKind::Float { "real" } else { "string" },
                self.name
            )));
        }
        Ok(())
    }
}

/// Splits a declared name into the cleaned name (whitespace in front of `[`
/// removed), the base name in front of a trailing bit-range, and the range
/// itself. The cleaned name keeps the suffix.
pub fn split_bit_range(raw: &str) -> (String, Option<String>, Option<BitRange>) {
    let mut name = String::with_capacity(raw.len());
    let mut pending_ws = false;
    for c in raw.trim().chars() {
        if c.is_whitespace() {
            pending_ws = true;
            continue;
        }
        if pending_ws && c != '[' {
            name.push(' ');
        }
        pending_ws = false;
        name.push(c);
    }

    let open = match name.rfind('[') {
        Some(p) if p > 0 => p,
        _ => return (name, None, None),
    };
    let close = match name[open..].find(']') {
        Some(p) => open + p,
        None => return (name, None, None),
    };
    let body = &name[open + 1..close];
    let range = match body.split_once(':') {
        Some((high, low)) => match (high.trim().parse::<i64>(), low.trim().parse::<i64>()) {
            (Ok(h), Ok(l)) => {
                // swap to enforce high >= low
                let (high, low) = if l > h { (l, h) } else { (h, l) };
                Some(BitRange { high, low: Some(low) })
            }
            _ => None,
        },
        None => body.trim().parse::<i64>().ok().map(|h| BitRange { high: h, low: None }),
    };
    match range {
        Some(range) => {
            let base = name[..open].trim_end().to_string();
            (name, Some(base), Some(range))
        }
        None => (name, None, None),
    }
}

/// Marks runs of compatible single-bit variables sharing a base name as
/// members of a vector group. Only used when vector resolution is enabled.
pub fn identify_groups(vars: &mut [VarRecord], vector_resolution: bool) {
    if !vector_resolution {
        return;
    }
    let mut run_start = 0;
    while run_start < vars.len() {
        let base = match group_base(&vars[run_start]) {
            Some(base) => base.to_string(),
            None => {
                run_start += 1;
                continue;
            }
        };
        let mut run_end = run_start + 1;
        while run_end < vars.len()
            && vars[run_end].scope == vars[run_start].scope
            && group_base(&vars[run_end]) == Some(base.as_str())
        {
            run_end += 1;
        }
        if run_end - run_start > 1 {
            debug!("vector group {base}: {} members", run_end - run_start);
            for var in &mut vars[run_start..run_end] {
                var.group = Some(base.clone());
            }
        }
        run_start = run_end;
    }
}

fn group_base(var: &VarRecord) -> Option<&str> {
    if var.kind != DataKind::Logic || var.width != 1 {
        return None;
    }
    var.index_base.as_deref()
}

/// A filter expression: a union of regex and literal patterns, tested
/// against a variable's hierarchical name.
#[derive(Debug, Default)]
pub struct FilterList {
    items: Vec<Filter>,
}

#[derive(Debug)]
enum Filter {
    Regex(regex::Regex),
    Literal(String),
}

impl FilterList {
    /// Builds a list from a comma-separated pattern string. Every pattern
    /// that compiles becomes a regex, the rest match as literal substrings.
    pub fn parse(text: Option<&str>) -> FilterList {
        let mut items = Vec::new();
        for pattern in text.unwrap_or("").split(',') {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            match regex::Regex::new(pattern) {
                Ok(re) => items.push(Filter::Regex(re)),
                Err(_) => items.push(Filter::Literal(pattern.to_string())),
            }
        }
        FilterList { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.items.iter().any(|f| match f {
            Filter::Regex(re) => re.is_match(name),
            Filter::Literal(lit) => name.contains(lit.as_str()),
        })
    }
}

/// Creates one signal per accepted variable. Inclusion requires a match on
/// `include` (when non-empty) and no match on `exclude`. Returns the created
/// signal per variable, `None` for filtered ones.
pub fn create_signals(
    record: &mut Record,
    vars: &[VarRecord],
    include: &FilterList,
    exclude: &FilterList,
) -> Vec<Option<SignalId>> {
    let mut created = 0usize;
    let out = vars
        .iter()
        .map(|var| {
            let scope_name = record.tree.full_name(var.scope);
            let full = if scope_name.is_empty() {
                var.name.clone()
            } else {
                format!("{scope_name}.{}", var.name)
            };
            if !include.is_empty() && !include.matches(&full) {
                debug!("signal {full} not included");
                return None;
            }
            if exclude.matches(&full) {
                debug!("signal {full} excluded");
                return None;
            }
            created += 1;
            Some(record.add_signal(
                var.name.clone(),
                var.scope,
                var.kind,
                var.width,
                var.type_desc.clone(),
            ))
        })
        .collect();
    info!("created {created} of {} signals", vars.len());
    out
}

/// Produces the writer bound to each created signal, in variable order.
pub fn create_writers(record: &Record, signals: &[Option<SignalId>]) -> Vec<Option<WriterId>> {
    signals
        .iter()
        .map(|s| s.map(|id| record.signals[id].writer))
        .collect()
}
