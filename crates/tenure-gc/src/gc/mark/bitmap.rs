//! Heap-wide mark bitmap.
//!
//! One bit per object-alignment unit (two words), so every possible object
//! start has its own bit.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::heap::object::{MIN_OBJ_ALIGN_WORDS, WORD_SIZE};

/// Bytes covered by one bit.
pub const BYTES_PER_BIT: usize = MIN_OBJ_ALIGN_WORDS * WORD_SIZE;
const LOG_BYTES_PER_BIT: u32 = BYTES_PER_BIT.trailing_zeros();

/// A bitmap recording marked object starts over `[base, base + bytes)`.
///
/// # Example
///
/// ```
/// use tenure_gc::gc::mark::MarkBitmap;
///
/// let bitmap = MarkBitmap::new(0x1000, 4096);
/// assert!(bitmap.mark(0x1010));
/// assert!(!bitmap.mark(0x1010));
/// assert!(bitmap.is_marked(0x1010));
/// assert_eq!(bitmap.next_marked(0x1000, 0x2000), Some(0x1010));
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    base: usize,
    bits: Box<[AtomicU64]>,
}

impl MarkBitmap {
    /// Create a clear bitmap covering `bytes` bytes from `base`.
    #[must_use]
    pub fn new(base: usize, bytes: usize) -> Self {
        let nbits = bytes >> LOG_BYTES_PER_BIT;
        Self {
            base,
            bits: (0..nbits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    const fn bit_index(&self, addr: usize) -> usize {
        (addr - self.base) >> LOG_BYTES_PER_BIT
    }

    #[inline]
    const fn addr_of(&self, bit: usize) -> usize {
        self.base + (bit << LOG_BYTES_PER_BIT)
    }

    /// Sets the bit for `addr`; returns `true` if this call set it.
    #[inline]
    pub fn mark(&self, addr: usize) -> bool {
        let bit = self.bit_index(addr);
        let mask = 1u64 << (bit % 64);
        let prev = self.bits[bit / 64].fetch_or(mask, Ordering::Relaxed);
        prev & mask == 0
    }

    /// Whether the bit for `addr` is set.
    #[inline]
    #[must_use]
    pub fn is_marked(&self, addr: usize) -> bool {
        let bit = self.bit_index(addr);
        (self.bits[bit / 64].load(Ordering::Relaxed) >> (bit % 64)) & 1 != 0
    }

    /// Clears all bits for `[from, to)`. Both ends must be 64-bit-word
    /// aligned in bit space, which holds for region boundaries.
    pub fn clear_range(&self, from: usize, to: usize) {
        let (first, last) = (self.bit_index(from), self.bit_index(to));
        debug_assert!(first % 64 == 0 && last % 64 == 0);
        for word in &self.bits[first / 64..last / 64] {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Whether no bit is set in `[from, to)`.
    #[must_use]
    pub fn is_clear_range(&self, from: usize, to: usize) -> bool {
        self.next_marked(from, to).is_none()
    }

    /// Lowest marked address in `[from, limit)`.
    #[must_use]
    pub fn next_marked(&self, from: usize, limit: usize) -> Option<usize> {
        if from >= limit {
            return None;
        }
        let mut bit = self.bit_index(from);
        let end = self.bit_index(limit);
        while bit < end {
            let word = self.bits[bit / 64].load(Ordering::Relaxed) >> (bit % 64);
            if word != 0 {
                let found = bit + word.trailing_zeros() as usize;
                return (found < end).then(|| self.addr_of(found));
            }
            bit = (bit / 64 + 1) * 64;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const BASE: usize = 0x4000_0000;

    #[test]
    fn test_mark_bitmap_concurrent_mark() {
        let bitmap = Arc::new(MarkBitmap::new(BASE, 512 * BYTES_PER_BIT));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let bitmap = Arc::clone(&bitmap);
            handles.push(thread::spawn(move || {
                let mut won = 0;
                for j in 0..512 {
                    if bitmap.mark(BASE + j * BYTES_PER_BIT) {
                        won += 1;
                    }
                }
                won
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 512);
    }

    #[test]
    fn test_mark_is_idempotent() {
        let bitmap = MarkBitmap::new(BASE, 4096);
        assert!(bitmap.mark(BASE));
        assert!(!bitmap.mark(BASE));
        assert!(bitmap.is_marked(BASE));
        assert!(!bitmap.is_marked(BASE + BYTES_PER_BIT));
    }

    #[test]
    fn test_next_marked_crosses_words() {
        let bitmap = MarkBitmap::new(BASE, 64 * 1024);
        let far = BASE + 300 * BYTES_PER_BIT;
        bitmap.mark(far);
        assert_eq!(bitmap.next_marked(BASE, BASE + 64 * 1024), Some(far));
        assert_eq!(bitmap.next_marked(far + BYTES_PER_BIT, BASE + 64 * 1024), None);
        assert_eq!(bitmap.next_marked(BASE, far), None);
    }

    #[test]
    fn test_clear_range() {
        let bitmap = MarkBitmap::new(BASE, 64 * 1024);
        bitmap.mark(BASE + 1024);
        bitmap.mark(BASE + 32 * 1024);
        bitmap.clear_range(BASE, BASE + 32 * 1024);
        assert!(!bitmap.is_marked(BASE + 1024));
        assert!(bitmap.is_marked(BASE + 32 * 1024));
        assert!(bitmap.is_clear_range(BASE, BASE + 32 * 1024));
    }
}
