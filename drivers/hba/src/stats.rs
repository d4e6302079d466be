//! Adapter counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated without the adapter lock
#[derive(Debug, Default)]
pub(crate) struct AdapterStats {
    pub submitted: AtomicU64,
    pub dispatched: AtomicU64,
    pub immediate: AtomicU64,
    pub chunks: AtomicU64,
    pub completed: AtomicU64,
    pub aborted: AtomicU64,
    pub resets: AtomicU64,
    pub issue_busy: AtomicU64,
    pub spurious: AtomicU64,
}

impl AdapterStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            immediate: self.immediate.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            issue_busy: self.issue_busy.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the adapter counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests accepted by `submit`
    pub submitted: u64,
    /// Hardware commands started
    pub dispatched: u64,
    /// Requests answered without hardware
    pub immediate: u64,
    /// Breakup continuations issued
    pub chunks: u64,
    /// Caller completions delivered
    pub completed: u64,
    /// Successful aborts
    pub aborted: u64,
    /// Successful resets
    pub resets: u64,
    /// Issuer busy timeouts
    pub issue_busy: u64,
    /// Status entries for idle or unknown slots
    pub spurious: u64,
}
