//! Collection-set heuristics.
//!
//! The collector core only asks heuristics two things: which regions to
//! evacuate and whether to start a cycle. Everything else here is
//! bookkeeping the heuristics may use to adapt.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::GcConfig;
use crate::heap::region::Affiliation;

/// What the collector knows about a region after marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionData {
    /// Region index.
    pub index: usize,
    /// Owning generation.
    pub affiliation: Affiliation,
    /// Estimated live bytes, including objects allocated during marking.
    pub live_bytes: usize,
    /// Reclaimable bytes.
    pub garbage: usize,
    /// Region size in bytes.
    pub capacity: usize,
    /// Region age in cycles.
    pub age: u8,
}

/// Evacuation budget a collection set must fit in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectionSetBudget {
    /// Bytes reserved for young evacuation.
    pub young_reserve: usize,
    /// Bytes reserved for old evacuation.
    pub old_reserve: usize,
    /// Multiplier applied to live bytes to account for LAB waste.
    pub waste: f64,
    /// Garbage already reclaimed without evacuation.
    pub immediate_garbage: usize,
    /// Garbage across all candidates plus immediate garbage.
    pub total_garbage: usize,
}

impl CollectionSetBudget {
    /// Bytes of reserve evacuating `live_bytes` consumes.
    #[must_use]
    pub fn cost(&self, live_bytes: usize) -> usize {
        (live_bytes as f64 * self.waste).ceil() as usize
    }
}

/// Usage figures for a trigger decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationStats {
    /// Maximum capacity in bytes.
    pub capacity: usize,
    /// Used bytes.
    pub used: usize,
    /// Bytes still available for mutator allocation.
    pub available: usize,
}

/// Policy hooks consulted by the collector.
pub trait Heuristics: Send + Sync + fmt::Debug {
    /// Appends the chosen regions to `selected`. The choice must fit in
    /// `budget`: the summed cost of young picks within `young_reserve` and
    /// of old picks within `old_reserve`.
    fn choose_collection_set(
        &self,
        candidates: &[RegionData],
        budget: &CollectionSetBudget,
        selected: &mut Vec<usize>,
    );

    /// Whether a cycle should start now.
    fn should_start_gc(&self, stats: &GenerationStats) -> bool;

    /// Whether class unloading should run this cycle. This collector has no
    /// classes to unload; the hook exists for policy parity.
    fn can_unload_classes(&self) -> bool {
        false
    }

    /// A concurrent cycle completed.
    fn record_success_concurrent(&self) {}

    /// A degenerated cycle completed.
    fn record_success_degenerated(&self) {}

    /// A full collection completed.
    fn record_success_full(&self) {}

    /// A degenerated cycle had to be upgraded to a full collection.
    fn record_degenerated_upgrade_to_full(&self) {}
}

/// Threshold-based heuristics: regions whose garbage exceeds a fixed share
/// of the region are taken, most garbage first, while the budget lasts.
#[derive(Debug)]
pub struct StaticHeuristics {
    garbage_threshold_percent: usize,
    min_free_threshold_percent: usize,
    immediate_threshold_percent: usize,
    concurrent: AtomicUsize,
    degenerated: AtomicUsize,
    full: AtomicUsize,
    upgrades: AtomicUsize,
}

impl Default for StaticHeuristics {
    fn default() -> Self {
        Self::new(&GcConfig::default())
    }
}

impl StaticHeuristics {
    /// Heuristics using the thresholds of `config`.
    #[must_use]
    pub const fn new(config: &GcConfig) -> Self {
        Self {
            garbage_threshold_percent: config.garbage_threshold_percent,
            min_free_threshold_percent: config.min_free_threshold_percent,
            immediate_threshold_percent: config.immediate_threshold_percent,
            concurrent: AtomicUsize::new(0),
            degenerated: AtomicUsize::new(0),
            full: AtomicUsize::new(0),
            upgrades: AtomicUsize::new(0),
        }
    }

    /// Same heuristics with a different garbage threshold.
    #[must_use]
    pub const fn with_garbage_threshold(mut self, percent: usize) -> Self {
        self.garbage_threshold_percent = percent;
        self
    }

    /// Concurrent cycles recorded.
    #[must_use]
    pub fn concurrent_successes(&self) -> usize {
        self.concurrent.load(Ordering::Relaxed)
    }

    /// Degenerated-to-full upgrades recorded.
    #[must_use]
    pub fn upgrades_to_full(&self) -> usize {
        self.upgrades.load(Ordering::Relaxed)
    }
}

impl Heuristics for StaticHeuristics {
    fn choose_collection_set(
        &self,
        candidates: &[RegionData],
        budget: &CollectionSetBudget,
        selected: &mut Vec<usize>,
    ) {
        if budget.total_garbage > 0
            && budget.immediate_garbage * 100 / budget.total_garbage > self.immediate_threshold_percent
        {
            return;
        }

        let mut sorted: Vec<&RegionData> = candidates
            .iter()
            .filter(|r| r.garbage * 100 > r.capacity * self.garbage_threshold_percent)
            .collect();
        sorted.sort_by(|a, b| b.garbage.cmp(&a.garbage).then(a.index.cmp(&b.index)));

        let (mut young_cost, mut old_cost) = (0usize, 0usize);
        for region in sorted {
            let cost = budget.cost(region.live_bytes);
            let (spent, limit) = match region.affiliation {
                Affiliation::Old => (&mut old_cost, budget.old_reserve),
                _ => (&mut young_cost, budget.young_reserve),
            };
            if *spent + cost <= limit {
                *spent += cost;
                selected.push(region.index);
            }
        }
    }

    fn should_start_gc(&self, stats: &GenerationStats) -> bool {
        stats.available * 100 < stats.capacity * self.min_free_threshold_percent
    }

    fn record_success_concurrent(&self) {
        self.concurrent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success_degenerated(&self) {
        self.degenerated.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success_full(&self) {
        self.full.fetch_add(1, Ordering::Relaxed);
    }

    fn record_degenerated_upgrade_to_full(&self) {
        self.upgrades.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: usize = 1 << 18;

    fn region(index: usize, affiliation: Affiliation, live: usize) -> RegionData {
        RegionData {
            index,
            affiliation,
            live_bytes: live,
            garbage: REGION - live,
            capacity: REGION,
            age: 0,
        }
    }

    fn budget(young: usize, old: usize) -> CollectionSetBudget {
        CollectionSetBudget {
            young_reserve: young,
            old_reserve: old,
            waste: 1.0,
            immediate_garbage: 0,
            total_garbage: 1,
        }
    }

    #[test]
    fn test_picks_most_garbage_first_within_budget() {
        let h = StaticHeuristics::default();
        let candidates = [
            region(0, Affiliation::Young, REGION / 2),
            region(1, Affiliation::Young, REGION / 8),
            region(2, Affiliation::Young, REGION / 4),
        ];
        let mut selected = Vec::new();
        h.choose_collection_set(&candidates, &budget(REGION / 8 + REGION / 4, 0), &mut selected);
        assert_eq!(selected, vec![1, 2]);
    }

    #[test]
    fn test_skips_regions_below_threshold() {
        let h = StaticHeuristics::default();
        let candidates = [region(0, Affiliation::Young, REGION - REGION / 10)];
        let mut selected = Vec::new();
        h.choose_collection_set(&candidates, &budget(usize::MAX, 0), &mut selected);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_old_regions_use_old_reserve() {
        let h = StaticHeuristics::default();
        let candidates = [
            region(0, Affiliation::Old, 100),
            region(1, Affiliation::Young, 100),
        ];
        let mut selected = Vec::new();
        h.choose_collection_set(&candidates, &budget(100, 0), &mut selected);
        assert_eq!(selected, vec![1]);
    }

    #[test]
    fn test_large_immediate_garbage_skips_evacuation() {
        let h = StaticHeuristics::default();
        let candidates = [region(0, Affiliation::Young, 0)];
        let mut selected = Vec::new();
        let b = CollectionSetBudget {
            immediate_garbage: 95,
            total_garbage: 100,
            ..budget(usize::MAX, 0)
        };
        h.choose_collection_set(&candidates, &b, &mut selected);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_trigger() {
        let h = StaticHeuristics::default();
        assert!(h.should_start_gc(&GenerationStats {
            capacity: 1000,
            used: 950,
            available: 50
        }));
        assert!(!h.should_start_gc(&GenerationStats {
            capacity: 1000,
            used: 500,
            available: 500
        }));
    }
}
