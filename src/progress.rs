// Copyright 2025 the waverec authors
// released under BSD 3-Clause License

//! Progress and cancellation port. The decoders bump the byte counter at
//! their suspension points (input refills, block boundaries) and poll the
//! cancellation flag there; everything is shareable across threads so a UI
//! can watch a decode it did not start.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Progress {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    bytes: AtomicU64,
    current_time: AtomicI64,
    cancelled: AtomicBool,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a best-effort abandon. Data already emitted stays visible.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn add_bytes(&self, count: u64) {
        self.inner.bytes.fetch_add(count, Ordering::SeqCst);
    }

    /// Bytes the decoder has consumed so far.
    pub fn bytes(&self) -> u64 {
        self.inner.bytes.load(Ordering::SeqCst)
    }

    /// "Current timestamp advanced" notification from the decoder.
    pub(crate) fn set_current_time(&self, time: i64) {
        self.inner.current_time.store(time, Ordering::SeqCst);
    }

    pub fn current_time(&self) -> i64 {
        self.inner.current_time.load(Ordering::SeqCst)
    }
}
