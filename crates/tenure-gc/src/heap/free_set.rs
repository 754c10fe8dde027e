//! Free set: which regions each allocator may take space from.
//!
//! Guarded by the heap lock. Mutators allocate from the `Mutator`
//! partition, lowest index first. Evacuation allocates from the collector
//! partitions, highest index first, so copies and fresh allocations stay
//! apart. When a collector partition runs dry it may take over an empty
//! region from the partition to its left in the fallback order.

use crate::heap::region::{Affiliation, HeapRegion};

/// Partition a region currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Not available for allocation.
    NotFree,
    /// Mutator (young) allocation.
    Mutator,
    /// Young evacuation.
    Collector,
    /// Old evacuation and promotion.
    OldCollector,
}

/// Region membership in allocation partitions.
#[derive(Debug)]
pub struct FreeSet {
    membership: Vec<Partition>,
}

impl FreeSet {
    /// Every region starts outside the free set.
    #[must_use]
    pub fn new(region_count: usize) -> Self {
        Self {
            membership: vec![Partition::NotFree; region_count],
        }
    }

    /// Partition of region `index`.
    #[inline]
    #[must_use]
    pub fn partition(&self, index: usize) -> Partition {
        self.membership[index]
    }

    /// Moves region `index` to `partition`.
    #[inline]
    pub fn set_partition(&mut self, index: usize, partition: Partition) {
        self.membership[index] = partition;
    }

    /// Regions of `partition` in ascending order.
    pub fn iter(&self, partition: Partition) -> impl DoubleEndedIterator<Item = usize> + '_ {
        self.membership
            .iter()
            .enumerate()
            .filter(move |(_, &p)| p == partition)
            .map(|(i, _)| i)
    }

    /// Number of regions in `partition`.
    #[must_use]
    pub fn count(&self, partition: Partition) -> usize {
        self.iter(partition).count()
    }

    /// Free bytes in `partition`.
    #[must_use]
    pub fn available(&self, partition: Partition, regions: &[HeapRegion]) -> usize {
        self.iter(partition).map(|i| regions[i].free()).sum()
    }

    /// Recomputes membership from region state.
    ///
    /// Regions with at least `min_free_bytes` of room stay with the
    /// partition of their generation. Empty regions are handed out from the
    /// right: first `old_reserve_regions` to the old collector, then
    /// `young_reserve_regions` to the collector, the rest to mutators.
    pub fn rebuild(
        &mut self,
        regions: &[HeapRegion],
        young_reserve_regions: usize,
        old_reserve_regions: usize,
        min_free_bytes: usize,
    ) {
        let mut empties = Vec::new();
        for region in regions {
            let index = region.index();
            let partition = if region.is_empty() && !region.is_affiliated() {
                empties.push(index);
                Partition::NotFree
            } else if region.is_regular() && !region.is_pinned() && region.free() >= min_free_bytes {
                match region.affiliation() {
                    Affiliation::Old => Partition::OldCollector,
                    _ => Partition::Mutator,
                }
            } else {
                Partition::NotFree
            };
            self.membership[index] = partition;
        }

        let mut old_left = old_reserve_regions;
        let mut young_left = young_reserve_regions;
        for &index in empties.iter().rev() {
            self.membership[index] = if old_left > 0 {
                old_left -= 1;
                Partition::OldCollector
            } else if young_left > 0 {
                young_left -= 1;
                Partition::Collector
            } else {
                Partition::Mutator
            };
        }
    }

    /// Removes every region from the free set.
    pub fn clear(&mut self) {
        self.membership.fill(Partition::NotFree);
    }
}
