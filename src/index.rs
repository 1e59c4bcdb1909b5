// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Identifier index: maps a numeric handle to the sample writers bound to
//! it. Registration computes the min/max numeric form over all handles; a
//! direct-mapped array is used when the span stays below a safety bound,
//! otherwise lookups stay on the hash map.

use crate::record::WriterId;
use log::info;
use rustc_hash::FxHashMap;

/// Above this key span the dense array is not worth its memory.
const MAX_DENSE_SPAN: u64 = 16 * 1024 * 1024;

#[derive(Default)]
pub struct IdIndex {
    dense: Option<Dense>,
    map: FxHashMap<u64, Vec<WriterId>>,
}

struct Dense {
    base: u64,
    slots: Vec<Vec<WriterId>>,
}

impl IdIndex {
    /// Builds the index from `(handle, writer)` pairs. A handle may carry
    /// several writers (shared identifiers alias one dataset to multiple
    /// signals). The chosen strategy is logged once per decode.
    pub fn build(entries: impl IntoIterator<Item = (u64, WriterId)>) -> Self {
        let mut map: FxHashMap<u64, Vec<WriterId>> = FxHashMap::default();
        for (key, writer) in entries {
            map.entry(key).or_default().push(writer);
        }
        if map.is_empty() {
            return IdIndex::default();
        }

        let min = *map.keys().min().unwrap();
        let max = *map.keys().max().unwrap();
        let span = max - min + 1;
        let dense = if span <= MAX_DENSE_SPAN {
            info!(
                "identifier index: direct-mapped array of {span} slots for {} handles",
                map.len()
            );
            let mut slots = vec![Vec::new(); span as usize];
            for (key, writers) in &map {
                slots[(key - min) as usize] = writers.clone();
            }
            Some(Dense { base: min, slots })
        } else {
            info!(
                "identifier index: hash map for {} handles (span {span} exceeds bound)",
                map.len()
            );
            None
        };
        IdIndex { dense, map }
    }

    /// Writers registered for `key`; empty when the handle is unknown. The
    /// array is tried first, the map is the fallback.
    #[inline]
    pub fn lookup(&self, key: u64) -> &[WriterId] {
        if let Some(dense) = &self.dense {
            if let Some(slot) = key
                .checked_sub(dense.base)
                .and_then(|i| dense.slots.get(i as usize))
            {
                return slot;
            }
        }
        self.map.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_lookup() {
        let index = IdIndex::build([(5u64, 0usize), (7, 1), (9, 2), (7, 3)]);
        assert!(index.dense.is_some());
        assert_eq!(index.lookup(5), &[0]);
        assert_eq!(index.lookup(7), &[1, 3]);
        assert_eq!(index.lookup(6), &[] as &[WriterId]);
        assert_eq!(index.lookup(100), &[] as &[WriterId]);
    }

    #[test]
    fn test_sparse_falls_back_to_map() {
        let index = IdIndex::build([(0u64, 0usize), (u64::MAX / 2, 1)]);
        assert!(index.dense.is_none());
        assert_eq!(index.lookup(u64::MAX / 2), &[1]);
        assert_eq!(index.lookup(1), &[] as &[WriterId]);
    }

    #[test]
    fn test_empty() {
        let index = IdIndex::build(std::iter::empty());
        assert_eq!(index.lookup(0), &[] as &[WriterId]);
    }
}
