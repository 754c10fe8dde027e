//! Region sizing.

use crate::config::GcConfig;
use crate::error::GcError;
use crate::heap::object::{LOG_WORD_SIZE, MIN_OBJ_ALIGN_WORDS, WORD_SIZE};

/// A heap needs at least this many regions.
pub const MIN_NUM_REGIONS: usize = 10;

/// Geometry derived from the configuration once at heap construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    /// Region size in bytes, a power of two.
    pub region_size_bytes: usize,
    /// log2 of `region_size_bytes`.
    pub region_size_bytes_shift: u32,
    /// Region size in words.
    pub region_size_words: usize,
    /// Number of regions.
    pub region_count: usize,
    /// Heap size in bytes (`region_count * region_size_bytes`).
    pub heap_size: usize,
    /// Objects of at least this many words are humongous.
    pub humongous_threshold_words: usize,
    /// Largest TLAB/GCLAB/PLAB in words.
    pub max_lab_words: usize,
}

const fn align_down(v: usize, a: usize) -> usize {
    v & !(a - 1)
}

const fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

impl RegionLayout {
    /// Computes region geometry: heap size over target region count,
    /// clamped to the configured bounds, page aligned and rounded down to a
    /// power of two.
    ///
    /// # Errors
    ///
    /// Fails when the heap cannot hold [`MIN_NUM_REGIONS`] regions of the
    /// minimum size.
    pub fn setup(config: &GcConfig) -> Result<Self, GcError> {
        let page = sys_alloc::allocation_granularity();
        let min_region = config.min_region_size.max(page);
        if min_region > config.heap_size / MIN_NUM_REGIONS {
            return Err(GcError::InvalidConfig(
                "heap too small for the minimum number of regions",
            ));
        }

        let mut region_size = config.heap_size / config.target_num_regions;
        region_size = region_size.max(min_region).min(config.max_region_size);
        region_size = align_up(region_size, page);
        let shift = usize::BITS - 1 - region_size.leading_zeros();
        let region_size_bytes = 1usize << shift;

        let heap_size = align_up(config.heap_size, region_size_bytes);
        let region_count = heap_size / region_size_bytes;
        let region_size_words = region_size_bytes >> LOG_WORD_SIZE;

        let humongous_threshold_words = align_down(
            region_size_words * config.humongous_threshold_percent / 100,
            MIN_OBJ_ALIGN_WORDS,
        );
        let max_lab_words = align_down(
            (region_size_words / 8).min(humongous_threshold_words),
            MIN_OBJ_ALIGN_WORDS,
        );

        Ok(Self {
            region_size_bytes,
            region_size_bytes_shift: shift,
            region_size_words,
            region_count,
            heap_size,
            humongous_threshold_words,
            max_lab_words,
        })
    }

    /// Index of the region containing `offset` bytes from the heap base.
    #[inline]
    #[must_use]
    pub const fn region_index_for_offset(&self, offset: usize) -> usize {
        offset >> self.region_size_bytes_shift
    }

    /// Number of regions needed to hold `words` words.
    #[inline]
    #[must_use]
    pub const fn regions_for_words(&self, words: usize) -> usize {
        (words * WORD_SIZE).div_ceil(self.region_size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REGION_SIZE_FLOOR;

    #[test]
    fn test_default_layout() {
        let layout = RegionLayout::setup(&GcConfig::default()).unwrap();
        assert_eq!(layout.region_size_bytes, 256 * 1024);
        assert_eq!(layout.region_count, 256);
        assert!(layout.region_size_bytes.is_power_of_two());
        assert_eq!(layout.max_lab_words, layout.region_size_words / 8);
    }

    #[test]
    fn test_small_heap_with_small_regions() {
        let config = GcConfig::default()
            .with_heap_size(4 << 20)
            .with_region_size_bounds(REGION_SIZE_FLOOR.max(sys_alloc::allocation_granularity()), 1 << 20)
            .with_target_regions(64);
        let layout = RegionLayout::setup(&config).unwrap();
        assert_eq!(layout.region_size_bytes * layout.region_count, layout.heap_size);
        assert!(layout.region_count >= MIN_NUM_REGIONS);
        assert_eq!(layout.regions_for_words(layout.region_size_words + 1), 2);
    }

    #[test]
    fn test_rejects_tiny_heap() {
        let config = GcConfig::default().with_heap_size(1 << 20);
        assert!(RegionLayout::setup(&config).is_err());
    }
}
