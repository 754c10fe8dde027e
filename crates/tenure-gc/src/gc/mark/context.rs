//! Marking context: the mark bitmap plus per-region top-at-mark-start.
//!
//! Young and old marking share one bitmap. A region belongs to exactly one
//! generation, so each marking only clears and reads the bits of its own
//! regions. Objects at or above a region's TAMS were allocated after the
//! marking started and count as live without a bit.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::bitmap::MarkBitmap;
use crate::heap::object::{ObjRef, WORD_SIZE};
use crate::heap::region::HeapRegion;

/// Per-heap marking state.
#[derive(Debug)]
pub struct MarkingContext {
    bitmap: MarkBitmap,
    tams: Box<[AtomicUsize]>,
    base: usize,
    region_shift: u32,
    young_complete: AtomicBool,
    old_complete: AtomicBool,
}

impl MarkingContext {
    /// Context covering `region_count` regions of `1 << region_shift` bytes.
    #[must_use]
    pub fn new(base: usize, region_shift: u32, region_count: usize) -> Self {
        Self {
            bitmap: MarkBitmap::new(base, region_count << region_shift),
            tams: (0..region_count)
                .map(|i| AtomicUsize::new(base + (i << region_shift)))
                .collect(),
            base,
            region_shift,
            young_complete: AtomicBool::new(false),
            old_complete: AtomicBool::new(false),
        }
    }

    #[inline]
    const fn region_of(&self, addr: usize) -> usize {
        (addr - self.base) >> self.region_shift
    }

    /// The underlying bitmap.
    #[must_use]
    pub const fn bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    /// Top-at-mark-start of region `index`.
    #[inline]
    #[must_use]
    pub fn tams(&self, index: usize) -> usize {
        self.tams[index].load(Ordering::Acquire)
    }

    /// Records the current top as TAMS. Pause only.
    pub fn capture_tams(&self, region: &HeapRegion) {
        self.tams[region.index()].store(region.top(), Ordering::Release);
    }

    /// Resets TAMS to bottom so every object in the region counts as live.
    pub fn reset_tams(&self, region: &HeapRegion) {
        self.tams[region.index()].store(region.bottom(), Ordering::Release);
    }

    /// Clears the region's bits.
    pub fn clear_bitmap(&self, region: &HeapRegion) {
        self.bitmap.clear_range(region.bottom(), region.end());
    }

    /// Whether the region has no marks below TAMS.
    #[must_use]
    pub fn is_bitmap_clear(&self, region: &HeapRegion) -> bool {
        self.bitmap.is_clear_range(region.bottom(), region.end())
    }

    /// Whether `obj` is marked or was allocated after marking started.
    #[inline]
    #[must_use]
    pub fn is_marked(&self, obj: ObjRef) -> bool {
        let addr = obj.addr();
        addr >= self.tams(self.region_of(addr)) || self.bitmap.is_marked(addr)
    }

    /// Whether `obj` lies above its region's TAMS.
    #[inline]
    #[must_use]
    pub fn allocated_after_mark_start(&self, obj: ObjRef) -> bool {
        obj.addr() >= self.tams(self.region_of(obj.addr()))
    }

    /// Marks `obj`. Returns `true` only for the call that set the bit;
    /// objects above TAMS are never marked explicitly.
    #[inline]
    pub fn mark(&self, obj: ObjRef) -> bool {
        let addr = obj.addr();
        if addr >= self.tams(self.region_of(addr)) {
            return false;
        }
        self.bitmap.mark(addr)
    }

    /// Visits every live object of `region` that starts below `limit`:
    /// marked objects below TAMS, then every non-filler object between
    /// TAMS and `limit`. The area above TAMS must be parseable.
    pub fn for_each_live(&self, region: &HeapRegion, limit: usize, mut f: impl FnMut(ObjRef)) {
        let tams = self.tams(region.index()).min(limit);
        let mut cursor = region.bottom();
        while let Some(addr) = self.bitmap.next_marked(cursor, tams) {
            let Some(obj) = ObjRef::from_raw(addr) else {
                break;
            };
            cursor = obj.end();
            f(obj);
        }
        walk_objects(tams, limit, f);
    }

    /// Whether the young (or global) marking finished.
    #[must_use]
    pub fn is_young_complete(&self) -> bool {
        self.young_complete.load(Ordering::Acquire)
    }

    /// Whether the old marking finished and its bits are usable.
    #[must_use]
    pub fn is_old_complete(&self) -> bool {
        self.old_complete.load(Ordering::Acquire)
    }

    pub(crate) fn set_young_complete(&self, complete: bool) {
        self.young_complete.store(complete, Ordering::Release);
    }

    pub(crate) fn set_old_complete(&self, complete: bool) {
        self.old_complete.store(complete, Ordering::Release);
    }
}

/// Parses `[from, to)` object by object, skipping fillers.
pub(crate) fn walk_objects(from: usize, to: usize, mut f: impl FnMut(ObjRef)) {
    let mut cursor = from;
    while cursor < to {
        let Some(obj) = ObjRef::from_raw(cursor) else {
            break;
        };
        let layout = obj.layout();
        cursor += layout.size_words() * WORD_SIZE;
        if !layout.is_filler() {
            f(obj);
        }
    }
}
