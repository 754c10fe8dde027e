//! The collection set: regions chosen for evacuation this cycle.
//!
//! Built at final mark under the heap lock and read concurrently through
//! the membership map (barrier fast path) and the claim cursor
//! (evacuation workers).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

/// Membership map plus an ordered region list with a claim cursor.
#[derive(Debug)]
pub struct CollectionSet {
    map: Box<[AtomicBool]>,
    regions: RwLock<Vec<usize>>,
    cursor: AtomicUsize,
    young_live_bytes: AtomicUsize,
    old_live_bytes: AtomicUsize,
    old_regions: AtomicUsize,
}

impl CollectionSet {
    /// Empty set over `region_count` regions.
    #[must_use]
    pub fn new(region_count: usize) -> Self {
        Self {
            map: (0..region_count).map(|_| AtomicBool::new(false)).collect(),
            regions: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            young_live_bytes: AtomicUsize::new(0),
            old_live_bytes: AtomicUsize::new(0),
            old_regions: AtomicUsize::new(0),
        }
    }

    /// Whether region `index` is in the set.
    #[inline]
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.map[index].load(Ordering::Acquire)
    }

    /// Adds a region with its estimated live bytes.
    pub(crate) fn add(&self, index: usize, live_bytes: usize, old: bool) {
        debug_assert!(!self.contains(index));
        self.map[index].store(true, Ordering::Release);
        self.regions.write().push(index);
        if old {
            self.old_live_bytes.fetch_add(live_bytes, Ordering::Relaxed);
            self.old_regions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.young_live_bytes.fetch_add(live_bytes, Ordering::Relaxed);
        }
    }

    /// Empties the set.
    pub(crate) fn clear(&self) {
        let mut regions = self.regions.write();
        for &index in regions.iter() {
            self.map[index].store(false, Ordering::Release);
        }
        regions.clear();
        self.cursor.store(0, Ordering::Release);
        self.young_live_bytes.store(0, Ordering::Relaxed);
        self.old_live_bytes.store(0, Ordering::Relaxed);
        self.old_regions.store(0, Ordering::Relaxed);
    }

    /// Claims the next unclaimed region.
    pub fn claim_next(&self) -> Option<usize> {
        let regions = self.regions.read();
        let i = self.cursor.fetch_add(1, Ordering::AcqRel);
        regions.get(i).copied()
    }

    /// Rewinds the claim cursor so the set can be walked again.
    pub(crate) fn reset_cursor(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    /// Regions in selection order.
    #[must_use]
    pub fn regions(&self) -> Vec<usize> {
        self.regions.read().clone()
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated live bytes of young regions in the set.
    #[must_use]
    pub fn young_live_bytes(&self) -> usize {
        self.young_live_bytes.load(Ordering::Relaxed)
    }

    /// Estimated live bytes of old regions in the set.
    #[must_use]
    pub fn old_live_bytes(&self) -> usize {
        self.old_live_bytes.load(Ordering::Relaxed)
    }

    /// Whether the set holds old regions (a mixed collection).
    #[must_use]
    pub fn has_old_regions(&self) -> bool {
        self.old_regions.load(Ordering::Relaxed) > 0
    }
}
