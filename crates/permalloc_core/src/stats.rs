//! Allocator statistics.
//!
//! All counters are atomic and can be read while operations are in progress.
//! They describe the current process only and are not persisted.

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocator counters.
#[derive(Debug, Default)]
pub struct AllocatorStats {
    allocations: AtomicU64,
    deallocations: AtomicU64,
    bytes_allocated: AtomicU64,
    bytes_deallocated: AtomicU64,
    constructs: AtomicU64,
    destroys: AtomicU64,
    flushes: AtomicU64,
    snapshots: AtomicU64,
    errors: AtomicU64,
}

impl AllocatorStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allocation(&self, bytes: u64) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_deallocation(&self, bytes: u64) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_deallocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_construct(&self) {
        self.constructs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_destroy(&self) {
        self.destroys.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot(&self) {
        self.snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of successful allocations.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Returns the number of successful deallocations.
    pub fn deallocations(&self) -> u64 {
        self.deallocations.load(Ordering::Relaxed)
    }

    /// Returns the bytes handed out, after rounding to size classes.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Returns the bytes given back, after rounding to size classes.
    pub fn bytes_deallocated(&self) -> u64 {
        self.bytes_deallocated.load(Ordering::Relaxed)
    }

    /// Returns the number of registered-object constructions.
    pub fn constructs(&self) -> u64 {
        self.constructs.load(Ordering::Relaxed)
    }

    /// Returns the number of registered-object destructions.
    pub fn destroys(&self) -> u64 {
        self.destroys.load(Ordering::Relaxed)
    }

    /// Returns the number of explicit flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Returns the number of snapshots taken.
    pub fn snapshots(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
    }

    /// Returns the number of failed operations.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations(),
            deallocations: self.deallocations(),
            bytes_allocated: self.bytes_allocated(),
            bytes_deallocated: self.bytes_deallocated(),
            constructs: self.constructs(),
            destroys: self.destroys(),
            flushes: self.flushes(),
            snapshots: self.snapshots(),
            errors: self.errors(),
        }
    }
}

/// A point-in-time copy of [`AllocatorStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Successful allocations.
    pub allocations: u64,
    /// Successful deallocations.
    pub deallocations: u64,
    /// Bytes handed out.
    pub bytes_allocated: u64,
    /// Bytes given back.
    pub bytes_deallocated: u64,
    /// Registered-object constructions.
    pub constructs: u64,
    /// Registered-object destructions.
    pub destroys: u64,
    /// Explicit flushes.
    pub flushes: u64,
    /// Snapshots taken.
    pub snapshots: u64,
    /// Failed operations.
    pub errors: u64,
}

impl StatsSnapshot {
    /// Bytes currently live according to the counters.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated.saturating_sub(self.bytes_deallocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = AllocatorStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_operations() {
        let stats = AllocatorStats::new();
        stats.record_allocation(32);
        stats.record_allocation(64);
        stats.record_deallocation(32);
        stats.record_construct();

        let snap = stats.snapshot();
        assert_eq!(snap.allocations, 2);
        assert_eq!(snap.deallocations, 1);
        assert_eq!(snap.live_bytes(), 64);
        assert_eq!(snap.constructs, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(AllocatorStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_allocation(16);
                        s.record_error();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.allocations(), 800);
        assert_eq!(stats.bytes_allocated(), 800 * 16);
        assert_eq!(stats.errors(), 800);
    }
}
