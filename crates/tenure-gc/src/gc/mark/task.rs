//! Reference-array chunking.
//!
//! Large reference arrays are split into power-of-two chunks so a single
//! array never pins one worker for long and idle workers have something to
//! steal. Chunk `c` at power `p` covers elements `[(c - 1) << p, c << p)`.
//!
//! The splitting is kept free of queue types: callers receive each chunk
//! through a closure and get back the range they must scan themselves.

use std::ops::Range;

/// One array chunk: elements `[(chunk - 1) << pow, chunk << pow)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayChunk {
    /// 1-based chunk number.
    pub chunk: usize,
    /// log2 of the chunk length.
    pub pow: u32,
}

impl ArrayChunk {
    /// The element range covered by this chunk.
    #[must_use]
    pub const fn range(self) -> Range<usize> {
        let size = 1usize << self.pow;
        (self.chunk - 1) * size..self.chunk * size
    }
}

/// Splits a freshly popped array of `len` elements.
///
/// Arrays of at most `2 * stride` elements are not split. Otherwise the
/// array is covered by a power-of-two span; the left halves that start
/// inside the array are handed to `push` and the irregular tail is returned
/// for the caller to scan directly.
pub fn split_array_start(
    len: usize,
    stride: usize,
    max_chunk: usize,
    mut push: impl FnMut(ArrayChunk),
) -> Range<usize> {
    if len <= 2 * stride {
        return 0..len;
    }

    let mut pow = usize::BITS - 1 - len.leading_zeros();
    if !len.is_power_of_two() {
        pow += 1;
    }

    let mut last_idx = 0;
    let mut chunk = 1;
    while (1usize << pow) > stride && chunk * 2 < max_chunk {
        pow -= 1;
        let left_chunk = chunk * 2 - 1;
        let right_chunk = chunk * 2;
        let left_chunk_end = left_chunk << pow;
        if left_chunk_end < len {
            push(ArrayChunk {
                chunk: left_chunk,
                pow,
            });
            chunk = right_chunk;
            last_idx = left_chunk_end;
        } else {
            chunk = left_chunk;
        }
    }

    last_idx..len
}

/// Splits a popped chunk further while it is larger than `stride`, handing
/// the left halves to `push`. Returns the range left for the caller.
///
/// The range never exceeds the array because only chunks that start inside
/// the array are ever pushed, and pushed chunks are always full.
pub fn split_array_chunk(
    chunk: ArrayChunk,
    stride: usize,
    max_chunk: usize,
    mut push: impl FnMut(ArrayChunk),
) -> Range<usize> {
    let ArrayChunk { mut chunk, mut pow } = chunk;
    while (1usize << pow) > stride && chunk * 2 < max_chunk {
        pow -= 1;
        chunk *= 2;
        push(ArrayChunk {
            chunk: chunk - 1,
            pow,
        });
    }
    ArrayChunk { chunk, pow }.range()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_CHUNK: usize = 1023;

    /// Expands a starting array the way the marker would, returning every
    /// element index scanned.
    fn scan_all(len: usize, stride: usize) -> Vec<usize> {
        let mut pending = Vec::new();
        let mut scanned: Vec<usize> =
            split_array_start(len, stride, MAX_CHUNK, |c| pending.push(c)).collect();
        while let Some(chunk) = pending.pop() {
            let direct = split_array_chunk(chunk, stride, MAX_CHUNK, |c| pending.push(c));
            assert!(direct.end <= len, "chunk {chunk:?} overruns {len}");
            scanned.extend(direct);
        }
        scanned.sort_unstable();
        scanned
    }

    #[test]
    fn test_small_array_is_scanned_directly() {
        let mut pushed = 0;
        let range = split_array_start(100, 64, MAX_CHUNK, |_| pushed += 1);
        assert_eq!(range, 0..100);
        assert_eq!(pushed, 0);
    }

    #[test]
    fn test_every_element_scanned_exactly_once() {
        for len in [129, 1000, 4096, 4097, 10_000, 65_537] {
            let scanned = scan_all(len, 64);
            assert_eq!(scanned, (0..len).collect::<Vec<_>>(), "len {len}");
        }
    }

    #[test]
    fn test_chunk_ranges() {
        assert_eq!(ArrayChunk { chunk: 1, pow: 4 }.range(), 0..16);
        assert_eq!(ArrayChunk { chunk: 3, pow: 4 }.range(), 32..48);
    }

    #[test]
    fn test_chunk_split_respects_stride() {
        let mut pushed = Vec::new();
        let direct = split_array_chunk(ArrayChunk { chunk: 1, pow: 10 }, 128, MAX_CHUNK, |c| {
            pushed.push(c);
        });
        assert_eq!(direct.len(), 128);
        let covered: usize = pushed.iter().map(|c| c.range().len()).sum();
        assert_eq!(covered + direct.len(), 1024);
    }

    #[test]
    fn test_chunk_numbers_stay_below_limit() {
        let mut max_seen = 0;
        let mut pending = Vec::new();
        split_array_start(1 << 20, 1, 16, |c| pending.push(c));
        while let Some(c) = pending.pop() {
            max_seen = max_seen.max(c.chunk);
            split_array_chunk(c, 1, 16, |c| pending.push(c));
        }
        assert!(max_seen < 16);
    }
}
