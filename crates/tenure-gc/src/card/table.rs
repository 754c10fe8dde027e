//! Double-buffered card table.
//!
//! Mutator barriers dirty the write table. At init mark the write table is
//! copied into the read table and cleared, so remembered-set scanning reads
//! a stable snapshot while mutators keep dirtying the live table.

use std::sync::atomic::{AtomicU8, Ordering};

/// log2 of the card size in bytes.
pub const CARD_SHIFT: u32 = 9;
/// Bytes covered by one card.
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;
/// Words covered by one card.
pub const CARD_SIZE_WORDS: usize = CARD_SIZE / crate::heap::object::WORD_SIZE;
/// Cards per cluster; chunks handed to workers are whole clusters.
pub const CARDS_PER_CLUSTER: usize = 64;

const CLEAN: u8 = 0;
const DIRTY: u8 = 1;

/// Read and write card tables covering the whole heap.
#[derive(Debug)]
pub struct CardTable {
    base: usize,
    read: Box<[AtomicU8]>,
    write: Box<[AtomicU8]>,
}

impl CardTable {
    /// Creates clean tables covering `[base, base + heap_bytes)`.
    #[must_use]
    pub fn new(base: usize, heap_bytes: usize) -> Self {
        let cards = heap_bytes.div_ceil(CARD_SIZE);
        Self {
            base,
            read: (0..cards).map(|_| AtomicU8::new(CLEAN)).collect(),
            write: (0..cards).map(|_| AtomicU8::new(CLEAN)).collect(),
        }
    }

    /// Number of cards.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.read.len()
    }

    /// Returns `true` if the table covers no memory.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
    }

    /// Card index covering `addr`.
    #[inline]
    #[must_use]
    pub const fn card_index(&self, addr: usize) -> usize {
        (addr - self.base) >> CARD_SHIFT
    }

    /// First address covered by `card`.
    #[inline]
    #[must_use]
    pub const fn card_start(&self, card: usize) -> usize {
        self.base + (card << CARD_SHIFT)
    }

    /// Mutator-side dirtying. Relaxed: a lost race only over-approximates.
    #[inline]
    pub fn dirty_write(&self, addr: usize) {
        let card = &self.write[self.card_index(addr)];
        if card.load(Ordering::Relaxed) != DIRTY {
            card.store(DIRTY, Ordering::Relaxed);
        }
    }

    /// Dirties every write-table card overlapping `[addr, addr + bytes)`.
    pub fn dirty_write_range(&self, addr: usize, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let first = self.card_index(addr);
        let last = self.card_index(addr + bytes - 1);
        for card in &self.write[first..=last] {
            card.store(DIRTY, Ordering::Relaxed);
        }
    }

    /// Dirties every read- and write-table card overlapping the range.
    pub fn dirty_both_range(&self, addr: usize, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let first = self.card_index(addr);
        let last = self.card_index(addr + bytes - 1);
        for card in first..=last {
            self.read[card].store(DIRTY, Ordering::Relaxed);
            self.write[card].store(DIRTY, Ordering::Relaxed);
        }
    }

    /// Card dirty in the read snapshot.
    #[inline]
    #[must_use]
    pub fn is_read_dirty(&self, card: usize) -> bool {
        self.read[card].load(Ordering::Relaxed) == DIRTY
    }

    /// Card dirty in the live write table.
    #[inline]
    #[must_use]
    pub fn is_write_dirty(&self, card: usize) -> bool {
        self.write[card].load(Ordering::Relaxed) == DIRTY
    }

    /// Card dirty in either table.
    #[inline]
    #[must_use]
    pub fn is_either_dirty(&self, card: usize) -> bool {
        self.is_read_dirty(card) || self.is_write_dirty(card)
    }

    /// `read := write; write := clean` over `[from, to)`. Pause only.
    pub fn swap_range(&self, from: usize, to: usize) {
        let (first, last) = (self.card_index(from), self.card_index(to));
        for card in first..last {
            let w = self.write[card].swap(CLEAN, Ordering::Relaxed);
            self.read[card].store(w, Ordering::Relaxed);
        }
    }

    /// `read |= write` over `[from, to)`; the write table is kept.
    pub fn merge_write_into_read(&self, from: usize, to: usize) {
        let (first, last) = (self.card_index(from), self.card_index(to));
        for card in first..last {
            if self.write[card].load(Ordering::Relaxed) == DIRTY {
                self.read[card].store(DIRTY, Ordering::Relaxed);
            }
        }
    }

    /// Cleans both tables over `[from, to)`.
    pub fn clear_range(&self, from: usize, to: usize) {
        let (first, last) = (self.card_index(from), self.card_index(to));
        for card in first..last {
            self.read[card].store(CLEAN, Ordering::Relaxed);
            self.write[card].store(CLEAN, Ordering::Relaxed);
        }
    }

    /// Number of cards dirty in either table over `[from, to)`.
    #[must_use]
    pub fn count_dirty(&self, from: usize, to: usize) -> usize {
        let (first, last) = (self.card_index(from), self.card_index(to));
        (first..last).filter(|c| self.is_either_dirty(*c)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x1000_0000;

    #[test]
    fn test_dirty_and_swap() {
        let table = CardTable::new(BASE, 64 * CARD_SIZE);
        table.dirty_write(BASE + 3 * CARD_SIZE + 8);
        let card = table.card_index(BASE + 3 * CARD_SIZE);
        assert!(table.is_write_dirty(card));
        assert!(!table.is_read_dirty(card));

        table.swap_range(BASE, BASE + 64 * CARD_SIZE);
        assert!(table.is_read_dirty(card));
        assert!(!table.is_write_dirty(card));
        assert!(table.is_either_dirty(card));
    }

    #[test]
    fn test_range_dirtying_covers_partial_cards() {
        let table = CardTable::new(BASE, 64 * CARD_SIZE);
        table.dirty_write_range(BASE + CARD_SIZE - 8, 16);
        assert!(table.is_write_dirty(0));
        assert!(table.is_write_dirty(1));
        assert!(!table.is_write_dirty(2));
        assert_eq!(table.count_dirty(BASE, BASE + 64 * CARD_SIZE), 2);
    }

    #[test]
    fn test_merge_keeps_write_table() {
        let table = CardTable::new(BASE, 8 * CARD_SIZE);
        table.dirty_write(BASE);
        table.merge_write_into_read(BASE, BASE + 8 * CARD_SIZE);
        assert!(table.is_read_dirty(0));
        assert!(table.is_write_dirty(0));
        table.clear_range(BASE, BASE + 8 * CARD_SIZE);
        assert!(!table.is_either_dirty(0));
    }
}
