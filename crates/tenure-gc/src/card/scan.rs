//! Remembered-set scanning over dirty cards of old regions.

use std::sync::atomic::AtomicUsize;

use crate::card::object_starts::ObjectStartTable;
use crate::card::table::CardTable;
use crate::heap::object::{ObjRef, HEADER_WORDS, WORD_SIZE};

/// Which card table decides dirtiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardSnapshot {
    /// The read table captured at the last swap (marking).
    Read,
    /// Either table (reference updating, which must also see cards dirtied
    /// by mutators since the swap).
    Either,
}

/// Card table plus object-start table for the old generation.
#[derive(Debug)]
pub struct RememberedSet {
    cards: CardTable,
    starts: ObjectStartTable,
}

impl RememberedSet {
    /// Creates clean tables covering the heap.
    #[must_use]
    pub fn new(base: usize, heap_bytes: usize) -> Self {
        Self {
            cards: CardTable::new(base, heap_bytes),
            starts: ObjectStartTable::new(base, heap_bytes),
        }
    }

    /// The card table.
    #[inline]
    #[must_use]
    pub const fn cards(&self) -> &CardTable {
        &self.cards
    }

    /// The object-start table.
    #[inline]
    #[must_use]
    pub const fn starts(&self) -> &ObjectStartTable {
        &self.starts
    }

    /// Whether `card` counts as dirty under `snapshot`.
    #[inline]
    #[must_use]
    pub fn is_dirty(&self, card: usize, snapshot: CardSnapshot) -> bool {
        match snapshot {
            CardSnapshot::Read => self.cards.is_read_dirty(card),
            CardSnapshot::Either => self.cards.is_either_dirty(card),
        }
    }

    /// Visits every reference slot that lies on a dirty card inside
    /// `[from, to)` of the region starting at `bottom`.
    ///
    /// Each slot is visited once, by the scan whose range holds the slot;
    /// objects that begin before a dirty run are found through the
    /// object-start table and only their slots inside the run are visited.
    /// Fillers and objects rejected by `is_live` are skipped.
    pub fn scan_dirty(
        &self,
        bottom: usize,
        from: usize,
        to: usize,
        snapshot: CardSnapshot,
        is_live: impl Fn(ObjRef) -> bool,
        mut visit: impl FnMut(ObjRef, usize, &'static AtomicUsize),
    ) -> usize {
        if from >= to {
            return 0;
        }
        let mut scanned = 0;
        let mut card = self.cards.card_index(from);
        let last = self.cards.card_index(to - 1);
        while card <= last {
            if !self.is_dirty(card, snapshot) {
                card += 1;
                continue;
            }
            let run_start = card;
            while card <= last && self.is_dirty(card, snapshot) {
                card += 1;
            }
            let lo = self.cards.card_start(run_start).max(from);
            let hi = self.cards.card_start(card).min(to);
            scanned += card - run_start;

            let Some(mut cursor) = self.starts.block_start_hint(lo, bottom) else {
                continue;
            };
            while cursor < hi {
                let Some(obj) = ObjRef::from_raw(cursor) else {
                    break;
                };
                let layout = obj.layout();
                let end = cursor + layout.size_words() * WORD_SIZE;
                if end > lo && !layout.is_filler() && is_live(obj) {
                    let (first, limit) = slot_window(cursor, layout.ref_count(), lo, hi);
                    obj.slots_in(first, limit, |addr, slot| visit(obj, addr, slot));
                }
                cursor = end;
            }
        }
        scanned
    }
}

/// Slot indices of an object at `obj` with `refs` slots whose addresses
/// fall inside `[lo, hi)`.
#[inline]
fn slot_window(obj: usize, refs: usize, lo: usize, hi: usize) -> (usize, usize) {
    let base = obj + HEADER_WORDS * WORD_SIZE;
    let first = if lo > base {
        (lo - base).div_ceil(WORD_SIZE).min(refs)
    } else {
        0
    };
    let limit = if hi > base {
        (hi - base).div_ceil(WORD_SIZE).min(refs)
    } else {
        0
    };
    (first, limit.max(first))
}
