//! Heap regions.
//!
//! ```text
//!  EmptyUncommitted <--> EmptyCommitted ---> Regular <---> Pinned
//!                              |   ^            |             |
//!                              |   |            v             v
//!                              |   |           Cset <----> CsetPinned
//!                              |   |            |
//!                              |   +-- Trash <--+
//!                              |         ^
//!                              +--> HumongousStart <--> PinnedHumongousStart
//!                              +--> HumongousCont
//! ```
//!
//! State and affiliation are atomics so the barrier fast paths can read
//! them without the heap lock; every mutation happens under the heap lock
//! or inside a pause.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::config::MAX_AGE;
use crate::heap::object::{WORD_SIZE, LOG_WORD_SIZE};

/// Region lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionState {
    /// Reserved address space with no backing memory.
    EmptyUncommitted = 0,
    /// Committed and free.
    EmptyCommitted = 1,
    /// Holds ordinary objects.
    Regular = 2,
    /// First region of a humongous object.
    HumongousStart = 3,
    /// Continuation of a humongous object.
    HumongousCont = 4,
    /// Humongous start with a pinned object.
    PinnedHumongousStart = 5,
    /// Selected for evacuation.
    Cset = 6,
    /// Regular region with pinned objects.
    Pinned = 7,
    /// Collection-set region that got pinned.
    CsetPinned = 8,
    /// Reclaimable; recycled at cleanup.
    Trash = 9,
}

impl RegionState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::EmptyUncommitted,
            1 => Self::EmptyCommitted,
            2 => Self::Regular,
            3 => Self::HumongousStart,
            4 => Self::HumongousCont,
            5 => Self::PinnedHumongousStart,
            6 => Self::Cset,
            7 => Self::Pinned,
            8 => Self::CsetPinned,
            _ => Self::Trash,
        }
    }

    /// Whether `self -> to` is a legal move.
    #[must_use]
    pub const fn is_valid_transition(self, to: Self) -> bool {
        use RegionState::{
            Cset, CsetPinned, EmptyCommitted, EmptyUncommitted, HumongousCont, HumongousStart,
            Pinned, PinnedHumongousStart, Regular, Trash,
        };
        matches!(
            (self, to),
            (EmptyUncommitted, EmptyCommitted)
                | (EmptyUncommitted | EmptyCommitted, Regular | HumongousStart | HumongousCont)
                | (EmptyCommitted, EmptyUncommitted)
                | (Regular, Cset | Pinned | Trash)
                | (Pinned, Regular)
                | (Cset, CsetPinned | Trash | Regular)
                | (CsetPinned, Cset | Pinned)
                | (HumongousStart, PinnedHumongousStart | Trash)
                | (PinnedHumongousStart, HumongousStart)
                | (HumongousCont, Trash)
                | (Trash, EmptyCommitted)
        )
    }
}

/// Generation a region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Affiliation {
    /// Not owned by any generation.
    Free = 0,
    /// Young generation.
    Young = 1,
    /// Old generation.
    Old = 2,
}

impl Affiliation {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Young,
            2 => Self::Old,
            _ => Self::Free,
        }
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Young => "young",
            Self::Old => "old",
        }
    }
}

/// One fixed-size slice of the heap.
#[derive(Debug)]
pub struct HeapRegion {
    index: usize,
    bottom: usize,
    end: usize,
    top: AtomicUsize,
    state: AtomicU8,
    affiliation: AtomicU8,
    live_words: AtomicUsize,
    pin_count: AtomicUsize,
    age: AtomicU8,
    update_watermark: AtomicUsize,
    empty_since_ms: AtomicU64,
}

impl HeapRegion {
    pub(crate) fn new(index: usize, bottom: usize, size_bytes: usize) -> Self {
        Self {
            index,
            bottom,
            end: bottom + size_bytes,
            top: AtomicUsize::new(bottom),
            state: AtomicU8::new(RegionState::EmptyUncommitted as u8),
            affiliation: AtomicU8::new(Affiliation::Free as u8),
            live_words: AtomicUsize::new(0),
            pin_count: AtomicUsize::new(0),
            age: AtomicU8::new(0),
            update_watermark: AtomicUsize::new(bottom),
            empty_since_ms: AtomicU64::new(0),
        }
    }

    /// Position in the region table.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// First address.
    #[inline]
    #[must_use]
    pub const fn bottom(&self) -> usize {
        self.bottom
    }

    /// One past the last address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Allocation pointer.
    #[inline]
    #[must_use]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub(crate) fn set_top(&self, top: usize) {
        debug_assert!(self.bottom <= top && top <= self.end);
        self.top.store(top, Ordering::Release);
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, to: RegionState) {
        let from = self.state();
        debug_assert!(
            from == to || from.is_valid_transition(to),
            "region {}: illegal transition {from:?} -> {to:?}",
            self.index
        );
        self.state.store(to as u8, Ordering::Release);
    }

    /// Owning generation.
    #[inline]
    #[must_use]
    pub fn affiliation(&self) -> Affiliation {
        Affiliation::from_u8(self.affiliation.load(Ordering::Acquire))
    }

    pub(crate) fn set_affiliation(&self, affiliation: Affiliation) {
        self.affiliation.store(affiliation as u8, Ordering::Release);
    }

    /// Region capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.end - self.bottom
    }

    /// Bytes below `top`.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    /// Bytes above `top`.
    #[inline]
    #[must_use]
    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    /// Live bytes recorded by the last marking.
    #[inline]
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_words.load(Ordering::Relaxed) * WORD_SIZE
    }

    /// Used bytes not accounted as live.
    #[inline]
    #[must_use]
    pub fn garbage(&self) -> usize {
        self.used().saturating_sub(self.live_bytes())
    }

    pub(crate) fn increase_live_words(&self, words: usize) {
        self.live_words.fetch_add(words, Ordering::Relaxed);
    }

    pub(crate) fn set_live_words(&self, words: usize) {
        self.live_words.store(words, Ordering::Relaxed);
    }

    pub(crate) fn clear_live(&self) {
        self.live_words.store(0, Ordering::Relaxed);
    }

    /// Region-level tenure counter.
    #[inline]
    #[must_use]
    pub fn age(&self) -> u8 {
        self.age.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_age(&self) {
        let age = self.age();
        if age < MAX_AGE {
            self.age.store(age + 1, Ordering::Relaxed);
        }
    }

    pub(crate) fn reset_age(&self) {
        self.age.store(0, Ordering::Relaxed);
    }

    /// Boundary below which references have been rewritten.
    #[inline]
    #[must_use]
    pub fn update_watermark(&self) -> usize {
        self.update_watermark.load(Ordering::Acquire)
    }

    pub(crate) fn set_update_watermark(&self, watermark: usize) {
        debug_assert!(self.bottom <= watermark && watermark <= self.top());
        self.update_watermark.store(watermark, Ordering::Release);
    }

    /// Outstanding pins.
    #[inline]
    #[must_use]
    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::Acquire)
    }

    pub(crate) fn record_pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced unpin in region {}", self.index);
    }

    pub(crate) fn empty_since_ms(&self) -> u64 {
        self.empty_since_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn set_empty_since_ms(&self, ms: u64) {
        self.empty_since_ms.store(ms, Ordering::Relaxed);
    }

    /// Whether `addr` lies in `[bottom, end)`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        self.bottom <= addr && addr < self.end
    }

    /// Word offset of `addr` from `bottom`.
    #[inline]
    pub(crate) const fn word_offset(&self, addr: usize) -> usize {
        (addr - self.bottom) >> LOG_WORD_SIZE
    }

    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state() != RegionState::EmptyUncommitted
    }

    /// Free region, committed or not.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(
            self.state(),
            RegionState::EmptyCommitted | RegionState::EmptyUncommitted
        )
    }

    /// Holds objects (not empty, not trash).
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_empty() && !self.is_trash()
    }

    #[inline]
    #[must_use]
    pub fn is_trash(&self) -> bool {
        self.state() == RegionState::Trash
    }

    #[inline]
    #[must_use]
    pub fn is_regular(&self) -> bool {
        matches!(self.state(), RegionState::Regular | RegionState::Pinned)
    }

    #[inline]
    #[must_use]
    pub fn is_humongous_start(&self) -> bool {
        matches!(
            self.state(),
            RegionState::HumongousStart | RegionState::PinnedHumongousStart
        )
    }

    #[inline]
    #[must_use]
    pub fn is_humongous_continuation(&self) -> bool {
        self.state() == RegionState::HumongousCont
    }

    #[inline]
    #[must_use]
    pub fn is_humongous(&self) -> bool {
        self.is_humongous_start() || self.is_humongous_continuation()
    }

    #[inline]
    #[must_use]
    pub fn is_cset(&self) -> bool {
        matches!(self.state(), RegionState::Cset | RegionState::CsetPinned)
    }

    /// Region state says pinned.
    #[inline]
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        matches!(
            self.state(),
            RegionState::Pinned | RegionState::CsetPinned | RegionState::PinnedHumongousStart
        )
    }

    #[inline]
    #[must_use]
    pub fn is_young(&self) -> bool {
        self.affiliation() == Affiliation::Young
    }

    #[inline]
    #[must_use]
    pub fn is_old(&self) -> bool {
        self.affiliation() == Affiliation::Old
    }

    #[inline]
    #[must_use]
    pub fn is_affiliated(&self) -> bool {
        self.affiliation() != Affiliation::Free
    }

    /// Bump allocation of `words` words; caller holds the heap lock.
    pub(crate) fn allocate(&self, words: usize) -> Option<usize> {
        let top = self.top.load(Ordering::Relaxed);
        let new_top = top.checked_add(words * WORD_SIZE)?;
        if new_top > self.end {
            return None;
        }
        self.top.store(new_top, Ordering::Release);
        Some(top)
    }

    /// Re-aligns pin state with the pin counter. Called at safepoints.
    pub(crate) fn sync_pinned_status(&self) {
        let pinned = self.pin_count() > 0;
        let next = match (self.state(), pinned) {
            (RegionState::Regular, true) => RegionState::Pinned,
            (RegionState::Pinned, false) => RegionState::Regular,
            (RegionState::Cset, true) => RegionState::CsetPinned,
            (RegionState::CsetPinned, false) => RegionState::Cset,
            (RegionState::HumongousStart, true) => RegionState::PinnedHumongousStart,
            (RegionState::PinnedHumongousStart, false) => RegionState::HumongousStart,
            _ => return,
        };
        self.set_state(next);
    }

    /// Resets a trashed region to a free committed one.
    pub(crate) fn recycle(&self, now_ms: u64) {
        self.set_state(RegionState::EmptyCommitted);
        self.top.store(self.bottom, Ordering::Release);
        self.update_watermark.store(self.bottom, Ordering::Release);
        self.clear_live();
        self.reset_age();
        self.set_affiliation(Affiliation::Free);
        self.empty_since_ms.store(now_ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> HeapRegion {
        HeapRegion::new(3, 0x10_0000, 0x1_0000)
    }

    #[test]
    fn test_bump_allocation() {
        let r = region();
        r.set_state(RegionState::EmptyCommitted);
        r.set_state(RegionState::Regular);
        assert_eq!(r.allocate(4), Some(0x10_0000));
        assert_eq!(r.used(), 32);
        assert_eq!(r.allocate(0x1_0000 / 8), None);
        assert_eq!(r.free(), 0x1_0000 - 32);
    }

    #[test]
    fn test_transition_table() {
        use RegionState::*;
        assert!(Regular.is_valid_transition(Cset));
        assert!(Cset.is_valid_transition(Trash));
        assert!(Trash.is_valid_transition(EmptyCommitted));
        assert!(!Trash.is_valid_transition(Regular));
        assert!(!HumongousCont.is_valid_transition(Cset));
        assert!(!EmptyCommitted.is_valid_transition(Cset));
    }

    #[test]
    fn test_pin_sync() {
        let r = region();
        r.set_state(RegionState::EmptyCommitted);
        r.set_state(RegionState::Regular);
        r.record_pin();
        r.sync_pinned_status();
        assert_eq!(r.state(), RegionState::Pinned);
        assert!(r.is_pinned());
        r.record_unpin();
        r.sync_pinned_status();
        assert_eq!(r.state(), RegionState::Regular);
    }

    #[test]
    fn test_recycle_resets_everything() {
        let r = region();
        r.set_state(RegionState::EmptyCommitted);
        r.set_state(RegionState::Regular);
        r.set_affiliation(Affiliation::Old);
        r.allocate(16);
        r.increase_live_words(8);
        r.increment_age();
        r.set_state(RegionState::Trash);
        r.recycle(42);
        assert_eq!(r.state(), RegionState::EmptyCommitted);
        assert_eq!(r.affiliation(), Affiliation::Free);
        assert_eq!(r.used(), 0);
        assert_eq!(r.live_bytes(), 0);
        assert_eq!(r.age(), 0);
        assert_eq!(r.empty_since_ms(), 42);
    }

    #[test]
    fn test_age_saturates() {
        let r = region();
        for _ in 0..40 {
            r.increment_age();
        }
        assert_eq!(r.age(), MAX_AGE);
    }
}
