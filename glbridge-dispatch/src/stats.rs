//! Dispatch counters.
//!
//! Updated with relaxed atomics on the submit and render paths, read via
//! [`AtomicDispatchStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of the dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Deferred commands accepted for execution.
    pub submitted: u64,
    /// Commands whose native call succeeded.
    pub executed: u64,
    /// Commands whose native call failed.
    pub failed: u64,
    /// Commands resolved with `ContextLost` without executing.
    pub cancelled: u64,
    /// Immediate calls answered from cached state.
    pub immediate: u64,
    pub frames_presented: u64,
    pub contexts_created: u64,
    pub contexts_destroyed: u64,
    pub live_contexts: usize,
}

#[derive(Debug, Default)]
pub(crate) struct AtomicDispatchStats {
    pub submitted: AtomicU64,
    pub executed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub immediate: AtomicU64,
    pub frames_presented: AtomicU64,
    pub contexts_created: AtomicU64,
    pub contexts_destroyed: AtomicU64,
}

impl AtomicDispatchStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, live_contexts: usize) -> DispatchStats {
        DispatchStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            immediate: self.immediate.load(Ordering::Relaxed),
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            contexts_created: self.contexts_created.load(Ordering::Relaxed),
            contexts_destroyed: self.contexts_destroyed.load(Ordering::Relaxed),
            live_contexts,
        }
    }
}
