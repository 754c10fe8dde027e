//! Object-start side table ("crossing map").
//!
//! One entry per card: the word offsets of the first and last object that
//! begin inside the card, plus a has-object flag. Registration is a CAS
//! loop. Coalescing and clearing run with the card range owned by one
//! thread (heap lock or a pause). PLABs cover whole cards, so lock-free
//! registration by evacuating workers never shares an entry with the
//! heap-lock holder.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::card::table::{CARD_SHIFT, CARD_SIZE};
use crate::heap::object::LOG_WORD_SIZE;

const OFFSET_MASK: u16 = 0x3f;
const HAS_OBJECT: u16 = 0x80;
const LAST_SHIFT: u16 = 8;

#[inline]
const fn encode(first: u16, last: u16) -> u16 {
    HAS_OBJECT | first | (last << LAST_SHIFT)
}

/// Per-card first/last object start offsets.
#[derive(Debug)]
pub struct ObjectStartTable {
    base: usize,
    entries: Box<[AtomicU16]>,
}

impl ObjectStartTable {
    /// Creates an empty table covering `[base, base + heap_bytes)`.
    #[must_use]
    pub fn new(base: usize, heap_bytes: usize) -> Self {
        let cards = heap_bytes.div_ceil(CARD_SIZE);
        Self {
            base,
            entries: (0..cards).map(|_| AtomicU16::new(0)).collect(),
        }
    }

    #[inline]
    const fn card_of(&self, addr: usize) -> usize {
        (addr - self.base) >> CARD_SHIFT
    }

    #[inline]
    const fn offset_in_card(addr: usize) -> u16 {
        ((addr & (CARD_SIZE - 1)) >> LOG_WORD_SIZE) as u16
    }

    #[inline]
    fn load(&self, card: usize) -> u16 {
        self.entries[card].load(Ordering::Relaxed)
    }

    #[inline]
    fn store(&self, card: usize, v: u16) {
        self.entries[card].store(v, Ordering::Relaxed);
    }

    /// Whether some object begins in `card`.
    #[inline]
    #[must_use]
    pub fn starts_object(&self, card: usize) -> bool {
        self.load(card) & HAS_OBJECT != 0
    }

    /// Word offset of the first object starting in `card`.
    #[inline]
    #[must_use]
    pub fn first_start(&self, card: usize) -> usize {
        (self.load(card) & OFFSET_MASK) as usize
    }

    /// Word offset of the last object starting in `card`.
    #[inline]
    #[must_use]
    pub fn last_start(&self, card: usize) -> usize {
        ((self.load(card) >> LAST_SHIFT) & OFFSET_MASK) as usize
    }

    /// Records an object beginning at `addr`. Safe to race with other
    /// registrations on the same card.
    pub fn register_object(&self, addr: usize) {
        let card = self.card_of(addr);
        let offset = Self::offset_in_card(addr);
        let _ = self.entries[card].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |entry| {
            if entry & HAS_OBJECT == 0 {
                return Some(encode(offset, offset));
            }
            let first = (entry & OFFSET_MASK).min(offset);
            let last = ((entry >> LAST_SHIFT) & OFFSET_MASK).max(offset);
            Some(encode(first, last))
        });
    }

    /// Records that `[addr, addr + bytes)` now holds one object starting at
    /// `addr`, erasing the starts of the objects it replaced. An object is
    /// assumed to begin at `addr + bytes` if any start followed it.
    pub fn coalesce_objects(&self, addr: usize, bytes: usize) {
        debug_assert!(bytes > 0);
        let start_card = self.card_of(addr);
        let offset = Self::offset_in_card(addr);
        let entry = self.load(start_card);
        let first = if entry & HAS_OBJECT == 0 {
            offset
        } else {
            (entry & OFFSET_MASK).min(offset)
        };
        self.store(start_card, encode(first, offset));

        let follow = addr + bytes;
        let last_card = self.card_of(follow - 1);
        for card in start_card + 1..=last_card {
            let covered_to_end = card < last_card || follow & (CARD_SIZE - 1) == 0;
            if covered_to_end {
                self.store(card, 0);
                continue;
            }
            let entry = self.load(card);
            let follow_offset = Self::offset_in_card(follow);
            if entry & HAS_OBJECT != 0 && (entry >> LAST_SHIFT) & OFFSET_MASK >= follow_offset {
                let last = (entry >> LAST_SHIFT) & OFFSET_MASK;
                self.store(card, encode(follow_offset, last));
            } else {
                self.store(card, 0);
            }
        }
    }

    /// Forgets every start in `[from, to)`.
    pub fn clear_range(&self, from: usize, to: usize) {
        let (first, last) = (self.card_of(from), self.card_of(to));
        for card in first..last {
            self.store(card, 0);
        }
    }

    /// Address of an object that starts at or before `addr`, searching no
    /// further back than `floor` (the region bottom). Callers walk forward
    /// from the result to reach the object covering `addr`.
    #[must_use]
    pub fn block_start_hint(&self, addr: usize, floor: usize) -> Option<usize> {
        let floor_card = self.card_of(floor);
        let mut card = self.card_of(addr);
        let card_base = |c: usize| self.base + (c << CARD_SHIFT);

        let entry = self.load(card);
        if entry & HAS_OBJECT != 0 {
            let first = card_base(card) + (((entry & OFFSET_MASK) as usize) << LOG_WORD_SIZE);
            if first <= addr {
                return Some(first);
            }
        }
        while card > floor_card {
            card -= 1;
            let entry = self.load(card);
            if entry & HAS_OBJECT != 0 {
                let last = ((entry >> LAST_SHIFT) & OFFSET_MASK) as usize;
                return Some(card_base(card) + (last << LOG_WORD_SIZE));
            }
        }
        None
    }
}
