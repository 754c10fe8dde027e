//! Local allocation buffers.
//!
//! A LAB is a bump-pointer window carved out of one region. Mutators use
//! TLABs; evacuating threads use a GCLAB for young copies and a PLAB for
//! old copies. Retiring a LAB fills the unused tail so the region stays
//! parseable.

use crate::heap::object::{fill_with_filler, MIN_OBJ_ALIGN_WORDS, WORD_SIZE};

/// What a LAB is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabKind {
    /// Mutator allocation.
    Tlab,
    /// Young evacuation.
    Gclab,
    /// Old evacuation and promotion.
    Plab,
}

/// A bump-pointer allocation window.
#[derive(Debug)]
pub struct Lab {
    kind: LabKind,
    start: usize,
    top: usize,
    end: usize,
    /// Size in words to request at the next refill.
    desired_words: usize,
    /// PLAB only: the promotion budget was expended for this buffer.
    allows_promotion: bool,
    /// PLAB only: words promoted from young into this buffer.
    promoted_words: usize,
}

/// What retiring a LAB left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetiredLab {
    /// Start of the buffer.
    pub start: usize,
    /// Buffer size in words.
    pub words: usize,
    /// Words filled as waste.
    pub waste_words: usize,
    /// Start of the filler, if one was written.
    pub filler: Option<usize>,
    /// The buffer's promotion budget had been expended.
    pub allowed_promotion: bool,
    /// Words promoted into it.
    pub promoted_words: usize,
}

impl Lab {
    /// Empty LAB that will first ask for `initial_words`.
    #[must_use]
    pub const fn new(kind: LabKind, initial_words: usize) -> Self {
        Self {
            kind,
            start: 0,
            top: 0,
            end: 0,
            desired_words: initial_words,
            allows_promotion: false,
            promoted_words: 0,
        }
    }

    /// Kind of buffer.
    #[must_use]
    pub const fn kind(&self) -> LabKind {
        self.kind
    }

    /// Whether no buffer is installed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Words left.
    #[must_use]
    pub const fn free_words(&self) -> usize {
        (self.end - self.top) / WORD_SIZE
    }

    /// Size the next refill asks for.
    #[must_use]
    pub const fn desired_words(&self) -> usize {
        self.desired_words
    }

    /// Whether promotions may be copied into this PLAB.
    #[must_use]
    pub const fn allows_promotion(&self) -> bool {
        self.allows_promotion
    }

    /// Installs a fresh buffer `[start, start + words)`.
    pub fn install(&mut self, start: usize, words: usize, allows_promotion: bool) {
        debug_assert!(self.is_empty(), "retire before installing");
        self.start = start;
        self.top = start;
        self.end = start + words * WORD_SIZE;
        self.allows_promotion = allows_promotion;
        self.promoted_words = 0;
    }

    /// Bump-allocates `words`.
    #[inline]
    pub fn allocate(&mut self, words: usize) -> Option<usize> {
        let bytes = words * WORD_SIZE;
        if self.end - self.top < bytes {
            return None;
        }
        let addr = self.top;
        self.top += bytes;
        Some(addr)
    }

    /// Rewinds the most recent allocation. Returns `false` if `addr` was not
    /// the last allocation.
    pub fn undo(&mut self, addr: usize, words: usize) -> bool {
        if addr + words * WORD_SIZE == self.top && addr >= self.start {
            self.top = addr;
            true
        } else {
            false
        }
    }

    /// Records a promotion copied into this PLAB.
    pub fn record_promotion(&mut self, words: usize) {
        debug_assert_eq!(self.kind, LabKind::Plab);
        self.promoted_words += words;
    }

    /// Forgets a promotion whose copy was undone.
    pub fn unrecord_promotion(&mut self, words: usize) {
        self.promoted_words -= words;
    }

    /// Grows the next refill size geometrically, capped at `max_words`.
    pub fn grow(&mut self, max_words: usize) {
        self.desired_words = (self.desired_words * 2).min(max_words).max(MIN_OBJ_ALIGN_WORDS);
    }

    /// Resets the refill size.
    pub fn reset_size(&mut self, words: usize) {
        self.desired_words = words;
    }

    /// Fills the unused tail and detaches the buffer.
    pub fn retire(&mut self) -> RetiredLab {
        if self.is_empty() {
            return RetiredLab::default();
        }
        let waste_words = self.free_words();
        let filler = (waste_words > 0).then(|| {
            // SAFETY: `[top, end)` belongs to this LAB and is unused. LAB
            // sizes are object-aligned, so the tail can hold a filler.
            unsafe { fill_with_filler(self.top, waste_words) };
            self.top
        });
        let retired = RetiredLab {
            start: self.start,
            words: (self.end - self.start) / WORD_SIZE,
            waste_words,
            filler,
            allowed_promotion: self.allows_promotion,
            promoted_words: self.promoted_words,
        };
        self.start = 0;
        self.top = 0;
        self.end = 0;
        self.allows_promotion = false;
        self.promoted_words = 0;
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::object::{Layout, ObjRef};

    #[test]
    fn test_bump_undo_retire() {
        let buf = vec![0u64; 64];
        let start = buf.as_ptr() as usize;
        let mut lab = Lab::new(LabKind::Gclab, 64);
        assert!(lab.is_empty());
        lab.install(start, 64, false);

        let a = lab.allocate(8).unwrap();
        let b = lab.allocate(8).unwrap();
        assert_eq!(b, a + 64);
        assert!(!lab.undo(a, 8));
        assert!(lab.undo(b, 8));
        assert_eq!(lab.free_words(), 56);
        assert!(lab.allocate(57).is_none());

        let retired = lab.retire();
        assert_eq!(retired.waste_words, 56);
        assert_eq!(retired.filler, Some(start + 64));
        let filler = ObjRef::from_raw(start + 64).unwrap();
        assert_eq!(filler.layout(), Layout::Filler { words: 56 });
        assert!(lab.is_empty());
        drop(buf);
    }

    #[test]
    fn test_growth_is_capped() {
        let mut lab = Lab::new(LabKind::Plab, 256);
        lab.grow(1000);
        assert_eq!(lab.desired_words(), 512);
        lab.grow(1000);
        assert_eq!(lab.desired_words(), 1000);
        lab.reset_size(256);
        assert_eq!(lab.desired_words(), 256);
    }
}
