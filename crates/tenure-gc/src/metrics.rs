//! GC metrics and statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Kind of collection a [`GcMetrics`] record describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Concurrent cycle that completed without degenerating.
    Concurrent = 1,
    /// Stop-the-world completion of an interrupted cycle.
    Degenerated = 2,
    /// Stop-the-world compacting collection.
    Full = 3,
}

/// Statistics from one collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Kind of collection.
    pub collection_type: CollectionType,
    /// Wall time from first pause to cleanup.
    pub duration: Duration,
    /// Total time spent in stop-the-world pauses.
    pub pause_time: Duration,
    /// Heap bytes in use before the cycle.
    pub used_before: usize,
    /// Heap bytes in use after the cycle.
    pub used_after: usize,
    /// Regions in the collection set.
    pub cset_regions: usize,
    /// Regions reclaimed without evacuation.
    pub immediate_regions: usize,
    /// Bytes copied by evacuation within a generation.
    pub bytes_evacuated: usize,
    /// Bytes copied from young into old.
    pub bytes_promoted: usize,
    /// Promotions that fell back to young evacuation.
    pub promotion_failures: usize,
    /// Whether the heuristics asked for class unloading this cycle.
    pub unload_classes: bool,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collection_type: CollectionType::None,
            duration: Duration::ZERO,
            pause_time: Duration::ZERO,
            used_before: 0,
            used_after: 0,
            cset_regions: 0,
            immediate_regions: 0,
            bytes_evacuated: 0,
            bytes_promoted: 0,
            promotion_failures: 0,
            unload_classes: false,
        }
    }

    /// Bytes released by the cycle.
    #[must_use]
    pub const fn bytes_reclaimed(&self) -> usize {
        self.used_before.saturating_sub(self.used_after)
    }
}

/// Heap occupancy captured before and after a stop-the-world cycle.
///
/// A degenerated cycle that does not free enough memory is futile and gets
/// escalated to a full GC.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    capacity: usize,
    used_before: usize,
    used_after: usize,
    free_before: usize,
    free_after: usize,
}

impl MetricsSnapshot {
    /// Record state at cycle start.
    #[must_use]
    pub const fn before(capacity: usize, used: usize, free: usize) -> Self {
        Self {
            capacity,
            used_before: used,
            used_after: used,
            free_before: free,
            free_after: free,
        }
    }

    /// Used bytes at cycle start.
    #[must_use]
    pub const fn used_before(&self) -> usize {
        self.used_before
    }

    /// Record state at cycle end.
    pub fn snap_after(&mut self, used: usize, free: usize) {
        self.used_after = used;
        self.free_after = free;
    }

    /// Whether the cycle freed enough to be worth continuing without a full
    /// GC. Free space must reach the critical threshold and the used size
    /// must have dropped by at least `min_progress_bytes`.
    #[must_use]
    pub fn is_good_progress(&self, critical_free_percent: usize, min_progress_bytes: usize) -> bool {
        let free_expected = self.capacity / 100 * critical_free_percent;
        if self.free_after < free_expected {
            return false;
        }
        let progress = self.used_before.saturating_sub(self.used_after);
        if progress >= min_progress_bytes {
            return true;
        }
        self.free_after.saturating_sub(self.free_before) >= min_progress_bytes
    }
}

/// Ring buffer size for GC history.
const HISTORY_SIZE: usize = 64;

/// Cumulative statistics for one heap.
#[derive(Debug)]
pub struct GlobalMetrics {
    concurrent: AtomicUsize,
    degenerated: AtomicUsize,
    full: AtomicUsize,
    upgrades_to_full: AtomicUsize,
    cancellations: AtomicUsize,
    evac_ooms: AtomicUsize,
    promotion_failures: AtomicUsize,
    bytes_evacuated: AtomicUsize,
    bytes_promoted: AtomicUsize,
    alloc_failures: AtomicUsize,
    pause_ns: AtomicU64,
    history: Mutex<VecDeque<GcMetrics>>,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create a new `GlobalMetrics` with all counters initialized to zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            concurrent: AtomicUsize::new(0),
            degenerated: AtomicUsize::new(0),
            full: AtomicUsize::new(0),
            upgrades_to_full: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
            evac_ooms: AtomicUsize::new(0),
            promotion_failures: AtomicUsize::new(0),
            bytes_evacuated: AtomicUsize::new(0),
            bytes_promoted: AtomicUsize::new(0),
            alloc_failures: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_SIZE)),
        }
    }

    pub(crate) fn record_cycle(&self, metrics: GcMetrics) {
        let counter = match metrics.collection_type {
            CollectionType::Concurrent => &self.concurrent,
            CollectionType::Degenerated => &self.degenerated,
            CollectionType::Full => &self.full,
            CollectionType::None => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_evacuated
            .fetch_add(metrics.bytes_evacuated, Ordering::Relaxed);
        self.bytes_promoted
            .fetch_add(metrics.bytes_promoted, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            u64::try_from(metrics.pause_time.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        let mut history = self.history.lock();
        if history.len() == HISTORY_SIZE {
            history.pop_front();
        }
        history.push_back(metrics);
    }

    pub(crate) fn record_upgrade_to_full(&self) {
        self.upgrades_to_full.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evac_oom(&self) {
        self.evac_ooms.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_promotion_failure(&self) {
        self.promotion_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_alloc_failure(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Concurrent cycles completed.
    #[inline]
    #[must_use]
    pub fn concurrent_cycles(&self) -> usize {
        self.concurrent.load(Ordering::Relaxed)
    }

    /// Degenerated cycles completed.
    #[inline]
    #[must_use]
    pub fn degenerated_cycles(&self) -> usize {
        self.degenerated.load(Ordering::Relaxed)
    }

    /// Full collections completed.
    #[inline]
    #[must_use]
    pub fn full_cycles(&self) -> usize {
        self.full.load(Ordering::Relaxed)
    }

    /// Total collections of any kind.
    #[inline]
    #[must_use]
    pub fn total_cycles(&self) -> usize {
        self.concurrent_cycles() + self.degenerated_cycles() + self.full_cycles()
    }

    /// Degenerated cycles that escalated to full GC.
    #[inline]
    #[must_use]
    pub fn upgrades_to_full(&self) -> usize {
        self.upgrades_to_full.load(Ordering::Relaxed)
    }

    /// Successful cancellation requests.
    #[inline]
    #[must_use]
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::Relaxed)
    }

    /// Evacuation OOM events.
    #[inline]
    #[must_use]
    pub fn evac_ooms(&self) -> usize {
        self.evac_ooms.load(Ordering::Relaxed)
    }

    /// Promotions that fell back to young.
    #[inline]
    #[must_use]
    pub fn promotion_failures(&self) -> usize {
        self.promotion_failures.load(Ordering::Relaxed)
    }

    /// Bytes copied within a generation.
    #[inline]
    #[must_use]
    pub fn bytes_evacuated(&self) -> usize {
        self.bytes_evacuated.load(Ordering::Relaxed)
    }

    /// Bytes promoted into old.
    #[inline]
    #[must_use]
    pub fn bytes_promoted(&self) -> usize {
        self.bytes_promoted.load(Ordering::Relaxed)
    }

    /// Mutator allocation failures that requested a collection.
    #[inline]
    #[must_use]
    pub fn alloc_failures(&self) -> usize {
        self.alloc_failures.load(Ordering::Relaxed)
    }

    /// Accumulated pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Most recent cycle, if any.
    #[must_use]
    pub fn last_cycle(&self) -> Option<GcMetrics> {
        self.history.lock().back().copied()
    }

    /// Up to the last 64 cycles, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<GcMetrics> {
        self.history.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_cycle_counts_by_kind() {
        let m = GlobalMetrics::new();
        let mut cycle = GcMetrics::new();
        cycle.collection_type = CollectionType::Degenerated;
        cycle.bytes_promoted = 128;
        m.record_cycle(cycle);
        cycle.collection_type = CollectionType::Full;
        m.record_cycle(cycle);
        m.record_cycle(GcMetrics::new());

        assert_eq!(m.degenerated_cycles(), 1);
        assert_eq!(m.full_cycles(), 1);
        assert_eq!(m.total_cycles(), 2);
        assert_eq!(m.bytes_promoted(), 256);
        assert_eq!(m.last_cycle().unwrap().collection_type, CollectionType::Full);
    }

    #[test]
    fn test_history_is_bounded() {
        let m = GlobalMetrics::new();
        let mut cycle = GcMetrics::new();
        cycle.collection_type = CollectionType::Concurrent;
        for i in 0..(HISTORY_SIZE + 10) {
            cycle.used_before = i;
            m.record_cycle(cycle);
        }
        let history = m.history();
        assert_eq!(history.len(), HISTORY_SIZE);
        assert_eq!(history[0].used_before, 10);
    }

    #[test]
    fn test_good_progress() {
        let mut snap = MetricsSnapshot::before(100 * 1024, 90 * 1024, 10 * 1024);
        snap.snap_after(50 * 1024, 50 * 1024);
        assert!(snap.is_good_progress(1, 4096));

        let mut snap = MetricsSnapshot::before(100 * 1024, 90 * 1024, 10 * 1024);
        snap.snap_after(90 * 1024, 10 * 1024);
        assert!(!snap.is_good_progress(1, 4096));

        let mut snap = MetricsSnapshot::before(100 * 1024, 100 * 1024, 0);
        snap.snap_after(99 * 1024, 512);
        assert!(!snap.is_good_progress(1, 512));
    }
}
