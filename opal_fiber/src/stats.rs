//! Subsystem counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for stack and continuation activity.
///
/// Updated with relaxed atomics on the hot paths; read for diagnostics
/// only, so cross-counter snapshots need not be mutually consistent.
#[derive(Debug, Default)]
pub struct FiberStats {
    /// Stack segments allocated from fresh memory.
    pub stacks_allocated: AtomicU64,
    /// Stack segments satisfied from the size-class cache.
    pub stacks_reused: AtomicU64,
    /// Stack segments returned to the size-class cache.
    pub stacks_cached: AtomicU64,
    /// Stack segments released back to the system.
    pub stacks_released: AtomicU64,
    /// Successful stack growths.
    pub grows: AtomicU64,
    /// Growth attempts that hit the size ceiling or exhausted memory.
    pub grow_failures: AtomicU64,
    /// Continuations resumed (take won the race).
    pub takes: AtomicU64,
    /// Take attempts that lost the race and observed empty.
    pub take_conflicts: AtomicU64,
}

impl FiberStats {
    /// Fresh zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of one counter.
    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
