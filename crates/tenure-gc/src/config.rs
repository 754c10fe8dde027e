//! Collector configuration.
//!
//! `GcConfig` carries every tunable the collector consumes. Values are read
//! at heap construction (region sizing, reserves, LAB sizing) and by the
//! heuristics when a cycle is planned. Defaults follow the constants below.

use std::str::FromStr;
use std::time::Duration;

use crate::error::GcError;

/// Default heap size in bytes.
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024 * 1024;
/// Smallest region size honored by region sizing.
pub const MIN_REGION_SIZE: usize = 256 * 1024;
/// Absolute floor for region size: one card cluster (64 cards of 512 bytes).
pub const REGION_SIZE_FLOOR: usize = 32 * 1024;
/// Largest region size honored by region sizing.
pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;
/// Number of regions the sizing logic aims for.
pub const TARGET_NUM_REGIONS: usize = 2048;
/// Upper bound on worker threads picked by default.
pub const MAX_DEFAULT_WORKERS: usize = 8;
/// Largest header age.
pub const MAX_AGE: u8 = 15;

/// Collector operating mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum GcMode {
    /// Snapshot-at-the-beginning concurrent marking over a single generation.
    #[default]
    Satb,
    /// Incremental-update concurrent marking over a single generation.
    Iu,
    /// No concurrent phases; every collection is stop-the-world.
    Passive,
    /// Young and old generations with a card-table remembered set.
    Generational,
}

impl GcMode {
    /// Returns `true` when the heap is split into young and old generations.
    #[must_use]
    pub const fn is_generational(self) -> bool {
        matches!(self, Self::Generational)
    }

    /// Returns `true` when cycles run concurrently with mutators.
    #[must_use]
    pub const fn is_concurrent(self) -> bool {
        !matches!(self, Self::Passive)
    }

    /// Name as accepted by [`FromStr`].
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Satb => "satb",
            Self::Iu => "iu",
            Self::Passive => "passive",
            Self::Generational => "generational",
        }
    }
}

impl FromStr for GcMode {
    type Err = GcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "satb" => Ok(Self::Satb),
            "iu" => Ok(Self::Iu),
            "passive" => Ok(Self::Passive),
            "generational" => Ok(Self::Generational),
            other => Err(GcError::InvalidMode(other.to_string())),
        }
    }
}

/// Tunables for a heap instance.
///
/// # Example
///
/// ```
/// use tenure_gc::{GcConfig, GcMode};
///
/// let config = GcConfig::default()
///     .with_heap_size(16 << 20)
///     .with_mode(GcMode::Generational)
///     .with_parallel_workers(2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Maximum heap size in bytes; rounded up to a whole number of regions.
    pub heap_size: usize,
    /// Lower clamp for the computed region size.
    pub min_region_size: usize,
    /// Upper clamp for the computed region size.
    pub max_region_size: usize,
    /// Desired region count.
    pub target_num_regions: usize,
    /// Objects larger than this percentage of a region are humongous.
    pub humongous_threshold_percent: usize,
    /// Operating mode.
    pub mode: GcMode,
    /// Number of parallel GC workers.
    pub parallel_workers: usize,
    /// Regions with more garbage than this percentage are cset candidates.
    pub garbage_threshold_percent: usize,
    /// Old regions with more garbage than this become mixed candidates.
    pub old_garbage_threshold_percent: usize,
    /// Regions with less garbage than this are never collected.
    pub ignore_garbage_threshold_percent: usize,
    /// A cycle is wanted when free space drops below this percentage.
    pub min_free_threshold_percent: usize,
    /// Skip evacuation when immediate garbage exceeds this percentage.
    pub immediate_threshold_percent: usize,
    /// Percentage of young capacity reserved for evacuation.
    pub evac_reserve_percent: usize,
    /// Multiplier for expected evacuation waste (non-generational).
    pub evac_waste: f64,
    /// Multiplier for expected evacuation waste (generational).
    pub generational_evac_waste: f64,
    /// Percentage of old capacity reserved for old evacuation.
    pub old_evac_reserve_percent: usize,
    /// Cap of old evacuation relative to the total evacuation budget.
    pub old_evac_ratio_percent: usize,
    /// Share of heap capacity owned by the young generation.
    pub young_capacity_percent: usize,
    /// Maximum LAB size as a multiple of the minimum LAB size.
    pub max_evac_lab_ratio: usize,
    /// Minimum LAB size in words.
    pub min_lab_words: usize,
    /// Consecutive degenerated cycles before escalating to full GC.
    pub full_gc_threshold: usize,
    /// Mark-queue pops between cancellation checks.
    pub mark_loop_stride: usize,
    /// Arrays longer than twice this are marked in chunks.
    pub obj_array_marking_stride: usize,
    /// Entries per thread-local SATB buffer.
    pub satb_buffer_size: usize,
    /// Every this many cycles is an aging cycle.
    pub aging_cycle_period: usize,
    /// Combined region and header age at which objects are promoted.
    pub tenuring_threshold: u8,
    /// Whether aged young objects are promoted into old.
    pub promote_tenured_objects: bool,
    /// Free space percentage a degenerated cycle must reach to count as progress.
    pub critical_free_threshold_percent: usize,
    /// Whether empty regions are uncommitted after `uncommit_delay`.
    pub uncommit: bool,
    /// How long a region must stay empty before it is uncommitted.
    pub uncommit_delay: Duration,
    /// Touch every page when a region is committed.
    pub always_pretouch: bool,
    /// Run the heap verifier around pauses.
    pub verify: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            min_region_size: MIN_REGION_SIZE,
            max_region_size: MAX_REGION_SIZE,
            target_num_regions: TARGET_NUM_REGIONS,
            humongous_threshold_percent: 100,
            mode: GcMode::Satb,
            parallel_workers: default_workers(),
            garbage_threshold_percent: 25,
            old_garbage_threshold_percent: 25,
            ignore_garbage_threshold_percent: 5,
            min_free_threshold_percent: 10,
            immediate_threshold_percent: 90,
            evac_reserve_percent: 5,
            evac_waste: 1.2,
            generational_evac_waste: 2.0,
            old_evac_reserve_percent: 2,
            old_evac_ratio_percent: 12,
            young_capacity_percent: 75,
            max_evac_lab_ratio: 16,
            min_lab_words: 256,
            full_gc_threshold: 3,
            mark_loop_stride: 1000,
            obj_array_marking_stride: 2048,
            satb_buffer_size: 1024,
            aging_cycle_period: 1,
            tenuring_threshold: 7,
            promote_tenured_objects: true,
            critical_free_threshold_percent: 1,
            uncommit: false,
            uncommit_delay: Duration::from_secs(300),
            always_pretouch: false,
            verify: false,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map_or(1, std::num::NonZero::get)
        .min(MAX_DEFAULT_WORKERS)
}

impl GcConfig {
    /// Set the maximum heap size.
    #[must_use]
    pub const fn with_heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = bytes;
        self
    }

    /// Set the operating mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: GcMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the number of parallel workers.
    #[must_use]
    pub const fn with_parallel_workers(mut self, n: usize) -> Self {
        self.parallel_workers = n;
        self
    }

    /// Set both region size clamps.
    #[must_use]
    pub const fn with_region_size_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_region_size = min;
        self.max_region_size = max;
        self
    }

    /// Set the desired region count.
    #[must_use]
    pub const fn with_target_regions(mut self, n: usize) -> Self {
        self.target_num_regions = n;
        self
    }

    /// Set the young evacuation reserve percentage.
    #[must_use]
    pub const fn with_evac_reserve_percent(mut self, pct: usize) -> Self {
        self.evac_reserve_percent = pct;
        self
    }

    /// Set the old evacuation reserve percentage.
    #[must_use]
    pub const fn with_old_evac_reserve_percent(mut self, pct: usize) -> Self {
        self.old_evac_reserve_percent = pct;
        self
    }

    /// Set the young generation's share of the heap.
    #[must_use]
    pub const fn with_young_capacity_percent(mut self, pct: usize) -> Self {
        self.young_capacity_percent = pct;
        self
    }

    /// Set the garbage threshold for cset candidates.
    #[must_use]
    pub const fn with_garbage_threshold_percent(mut self, pct: usize) -> Self {
        self.garbage_threshold_percent = pct;
        self
    }

    /// Set the tenuring threshold.
    #[must_use]
    pub const fn with_tenuring_threshold(mut self, age: u8) -> Self {
        self.tenuring_threshold = age;
        self
    }

    /// Set the consecutive degenerated cycle limit.
    #[must_use]
    pub const fn with_full_gc_threshold(mut self, n: usize) -> Self {
        self.full_gc_threshold = n;
        self
    }

    /// Set the minimum LAB size in words.
    #[must_use]
    pub const fn with_min_lab_words(mut self, words: usize) -> Self {
        self.min_lab_words = words;
        self
    }

    /// Enable or disable uncommit of idle empty regions.
    #[must_use]
    pub const fn with_uncommit(mut self, enabled: bool, delay: Duration) -> Self {
        self.uncommit = enabled;
        self.uncommit_delay = delay;
        self
    }

    /// Enable the heap verifier.
    #[must_use]
    pub const fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Number of workers actually used (at least one).
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.parallel_workers.max(1)
    }

    /// Waste multiplier for the current mode.
    #[must_use]
    pub const fn waste_factor(&self) -> f64 {
        if self.mode.is_generational() {
            self.generational_evac_waste
        } else {
            self.evac_waste
        }
    }

    /// Checks the configuration for inconsistent values.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), GcError> {
        if self.heap_size == 0 {
            return Err(GcError::InvalidConfig("heap_size must be non-zero"));
        }
        if self.min_region_size < REGION_SIZE_FLOOR {
            return Err(GcError::InvalidConfig(
                "min_region_size must be at least one card cluster",
            ));
        }
        if self.min_region_size > self.max_region_size {
            return Err(GcError::InvalidConfig(
                "min_region_size exceeds max_region_size",
            ));
        }
        if self.target_num_regions == 0 {
            return Err(GcError::InvalidConfig("target_num_regions must be non-zero"));
        }
        if !(1..=100).contains(&self.humongous_threshold_percent) {
            return Err(GcError::InvalidConfig(
                "humongous_threshold_percent must be in 1..=100",
            ));
        }
        let percents = [
            self.garbage_threshold_percent,
            self.old_garbage_threshold_percent,
            self.ignore_garbage_threshold_percent,
            self.min_free_threshold_percent,
            self.immediate_threshold_percent,
            self.evac_reserve_percent,
            self.old_evac_reserve_percent,
            self.critical_free_threshold_percent,
        ];
        if percents.iter().any(|p| *p > 100) {
            return Err(GcError::InvalidConfig("percentages must not exceed 100"));
        }
        if self.old_evac_ratio_percent >= 100 {
            return Err(GcError::InvalidConfig(
                "old_evac_ratio_percent must be below 100",
            ));
        }
        if self.mode.is_generational() && !(1..100).contains(&self.young_capacity_percent) {
            return Err(GcError::InvalidConfig(
                "young_capacity_percent must be in 1..100",
            ));
        }
        if self.evac_waste < 1.0 || self.generational_evac_waste < 1.0 {
            return Err(GcError::InvalidConfig("evacuation waste must be at least 1.0"));
        }
        if self.min_lab_words < 2 || self.max_evac_lab_ratio == 0 {
            return Err(GcError::InvalidConfig("LAB sizing is degenerate"));
        }
        if self.tenuring_threshold > MAX_AGE + 1 {
            return Err(GcError::InvalidConfig("tenuring_threshold exceeds max age"));
        }
        if self.mark_loop_stride == 0 || self.satb_buffer_size == 0 {
            return Err(GcError::InvalidConfig("strides and buffer sizes must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("generational".parse::<GcMode>().unwrap(), GcMode::Generational);
        assert_eq!(" IU ".parse::<GcMode>().unwrap(), GcMode::Iu);
        assert!(matches!(
            "aggressive".parse::<GcMode>(),
            Err(GcError::InvalidMode(m)) if m == "aggressive"
        ));
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in [GcMode::Satb, GcMode::Iu, GcMode::Passive, GcMode::Generational] {
            assert_eq!(mode.name().parse::<GcMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = GcConfig::default().with_region_size_bounds(4096, 4096);
        assert!(bad.validate().is_err());

        let mut bad = GcConfig::default();
        bad.evac_reserve_percent = 150;
        assert!(bad.validate().is_err());

        let bad = GcConfig::default()
            .with_mode(GcMode::Generational)
            .with_young_capacity_percent(100);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_waste_factor_follows_mode() {
        let c = GcConfig::default();
        assert!((c.waste_factor() - 1.2).abs() < f64::EPSILON);
        let c = c.with_mode(GcMode::Generational);
        assert!((c.waste_factor() - 2.0).abs() < f64::EPSILON);
    }
}
