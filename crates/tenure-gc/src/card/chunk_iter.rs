//! Work distribution for remembered-set scanning.
//!
//! The heap is cut into chunks handed out through one atomic cursor. The
//! first group of chunks is region sized; each following group uses chunks
//! half as large, so the tail of the scan is fine grained and workers
//! finish close together even when some regions are far costlier to scan.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::card::table::{CARDS_PER_CLUSTER, CARD_SIZE_WORDS};

/// Smallest chunk: one card cluster.
pub const SMALLEST_CHUNK_WORDS: usize = CARD_SIZE_WORDS * CARDS_PER_CLUSTER;
/// Upper bound on chunk-size groups.
pub const MAXIMUM_GROUPS: usize = 16;

/// One unit of scanning work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionChunk {
    /// Region index.
    pub region: usize,
    /// Word offset of the chunk within the region.
    pub offset_words: usize,
    /// Chunk length in words.
    pub size_words: usize,
}

/// Lock-free iterator over region chunks of shrinking size.
#[derive(Debug)]
pub struct RegionChunkIterator {
    region_words: usize,
    group_size: usize,
    num_groups: usize,
    total_chunks: usize,
    chunk_words: [usize; MAXIMUM_GROUPS],
    group_offset: [usize; MAXIMUM_GROUPS],
    group_first_chunk: [usize; MAXIMUM_GROUPS],
    index: AtomicUsize,
}

impl RegionChunkIterator {
    /// Plans chunks for `region_count` regions of `region_words` words,
    /// with groups of `4 * workers` chunks.
    #[must_use]
    pub fn new(region_count: usize, region_words: usize, workers: usize) -> Self {
        let group_size = 4 * workers.max(1);
        let total_words = region_count * region_words;
        let smallest = SMALLEST_CHUNK_WORDS.min(region_words);

        let mut chunk_words = [0; MAXIMUM_GROUPS];
        let mut group_offset = [0; MAXIMUM_GROUPS];
        let mut group_first_chunk = [0; MAXIMUM_GROUPS];
        let mut chunk = region_words;
        let mut covered = 0;
        let mut chunks = 0;
        let mut groups = 0;

        while covered < total_words && groups < MAXIMUM_GROUPS {
            let remaining = total_words - covered;
            let last_group = groups + 1 == MAXIMUM_GROUPS || chunk / 2 < smallest;
            let count = if last_group {
                remaining.div_ceil(chunk)
            } else {
                group_size.min(remaining.div_ceil(chunk))
            };
            chunk_words[groups] = chunk;
            group_offset[groups] = covered;
            group_first_chunk[groups] = chunks;
            covered += (count * chunk).min(remaining);
            chunks += count;
            groups += 1;
            if chunk / 2 >= smallest {
                chunk /= 2;
            }
        }

        Self {
            region_words,
            group_size,
            num_groups: groups,
            total_chunks: chunks,
            chunk_words,
            group_offset,
            group_first_chunk,
            index: AtomicUsize::new(0),
        }
    }

    /// Chunks per group (except possibly the last).
    #[must_use]
    pub const fn group_size(&self) -> usize {
        self.group_size
    }

    /// Number of chunk-size groups.
    #[must_use]
    pub const fn num_groups(&self) -> usize {
        self.num_groups
    }

    /// Total chunks.
    #[must_use]
    pub const fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Claims the next chunk. Safe to call from many threads.
    pub fn next(&self) -> Option<RegionChunk> {
        let i = self.index.fetch_add(1, Ordering::Relaxed);
        if i >= self.total_chunks {
            return None;
        }
        let group = (0..self.num_groups)
            .rev()
            .find(|g| self.group_first_chunk[*g] <= i)
            .unwrap_or(0);
        let chunk = self.chunk_words[group];
        let offset = self.group_offset[group] + (i - self.group_first_chunk[group]) * chunk;
        let region = offset / self.region_words;
        let offset_words = offset % self.region_words;
        Some(RegionChunk {
            region,
            offset_words,
            size_words: chunk.min(self.region_words - offset_words),
        })
    }

    /// Whether unclaimed chunks remain. Not reliable under concurrency.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.index.load(Ordering::Relaxed) < self.total_chunks
    }

    /// Rewinds to the first chunk.
    pub fn reset(&self) {
        self.index.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn covered_words(iter: &RegionChunkIterator) -> Vec<RegionChunk> {
        std::iter::from_fn(|| iter.next()).collect()
    }

    #[test]
    fn test_chunks_tile_the_heap_exactly() {
        let region_words = 32 * 1024;
        let iter = RegionChunkIterator::new(40, region_words, 2);
        let chunks = covered_words(&iter);
        assert_eq!(chunks.len(), iter.total_chunks());

        let mut seen = HashSet::new();
        let mut total = 0;
        for c in &chunks {
            assert!(c.offset_words + c.size_words <= region_words);
            assert!(c.size_words >= SMALLEST_CHUNK_WORDS);
            for w in (c.offset_words..c.offset_words + c.size_words).step_by(SMALLEST_CHUNK_WORDS) {
                assert!(seen.insert((c.region, w)), "overlapping chunk {c:?}");
            }
            total += c.size_words;
        }
        assert_eq!(total, 40 * region_words);
    }

    #[test]
    fn test_chunk_sizes_shrink() {
        let iter = RegionChunkIterator::new(64, 64 * 1024, 1);
        let chunks = covered_words(&iter);
        assert_eq!(chunks[0].size_words, 64 * 1024);
        assert!(chunks.last().unwrap().size_words < 64 * 1024);
        assert!(chunks.windows(2).all(|w| w[0].size_words >= w[1].size_words));
        assert!(iter.num_groups() <= MAXIMUM_GROUPS);
    }

    #[test]
    fn test_concurrent_claims_are_disjoint() {
        let iter = RegionChunkIterator::new(32, 32 * 1024, 4);
        let claimed = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while let Some(c) = iter.next() {
                        claimed.lock().unwrap().push((c.region, c.offset_words));
                    }
                });
            }
        });
        let claimed = claimed.into_inner().unwrap();
        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(unique.len(), claimed.len());
        assert_eq!(claimed.len(), iter.total_chunks());
    }

    #[test]
    fn test_reset() {
        let iter = RegionChunkIterator::new(2, SMALLEST_CHUNK_WORDS, 1);
        while iter.next().is_some() {}
        assert!(!iter.has_next());
        iter.reset();
        assert!(iter.has_next());
    }
}
