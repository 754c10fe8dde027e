//! Old-generation marking, coalesce-and-fill and mixed-collection
//! candidates.
//!
//! Old marking is bootstrapped by a young cycle that pushes every old
//! object it reaches onto the old queues; the old queues are then drained
//! concurrently and may be preempted by young collections in between.

use crate::gc::heuristics::{CollectionSetBudget, RegionData};
use crate::gc::marker::Marker;
use crate::gc::state::GcStateBits;
use crate::heap::generation::{GenerationMode, OldState};
use crate::heap::object::{fill_with_filler, ObjRef, WORD_SIZE};
use crate::heap::region::{HeapRegion, RegionState};
use crate::heap::Heap;

impl Heap {
    /// Turns every run of dead objects in `region` into one filler.
    pub(crate) fn coalesce_and_fill(&self, region: &HeapRegion) {
        let top = region.top();
        let mut cursor = region.bottom();
        let mut dead_start = None;
        while cursor < top {
            let Some(obj) = ObjRef::from_raw(cursor) else {
                break;
            };
            let layout = obj.layout();
            let live = !layout.is_filler() && self.marking.is_marked(obj);
            match (live, dead_start) {
                (true, Some(start)) => {
                    self.fill_dead_run(start, cursor);
                    dead_start = None;
                }
                (false, None) => dead_start = Some(cursor),
                _ => {}
            }
            cursor = obj.end();
        }
        if let Some(start) = dead_start {
            self.fill_dead_run(start, cursor);
        }
    }

    fn fill_dead_run(&self, from: usize, to: usize) {
        let bytes = to - from;
        // SAFETY: `[from, to)` holds only dead objects and fillers of an
        // old region; no thread can reach them.
        unsafe { fill_with_filler(from, bytes / WORD_SIZE) };
        self.rset.starts().coalesce_objects(from, bytes);
    }

    /// Fills dead objects in every old region using the last complete old
    /// marking. Returns `false` when cancelled.
    pub(crate) fn coalesce_and_fill_old_regions(&self, cancellable: bool) -> bool {
        if !self.marking.is_old_complete() {
            return true;
        }
        for region in self.regions.iter() {
            if cancellable && self.cancel.is_cancelled() {
                return false;
            }
            if !(region.is_old() && region.is_regular()) {
                continue;
            }
            // A cancel request waits until the region is filled.
            if cancellable && !self.cancel.suspend() {
                return false;
            }
            self.coalesce_and_fill(region);
            if cancellable {
                self.cancel.resume();
            }
        }
        true
    }

    /// Resets old marking state and turns on the old SATB barrier. Pause
    /// only; the next young cycle bootstraps the old queues.
    pub(crate) fn prepare_old_marking(&self) {
        self.prepare_marking(GenerationMode::Old);
        self.old_gen.abandon();
        self.gc_state.set(GcStateBits::OLD_MARKING, true);
        self.old_gen.transition_to(OldState::Bootstrapping);
    }

    /// Drains the old queues. Returns `false` when preempted.
    pub(crate) fn concurrent_old_mark(&self) -> bool {
        Marker::new(self, GenerationMode::Old).mark(true)
    }

    /// Finishes old marking and picks mixed-collection candidates. Pause
    /// only.
    pub(crate) fn final_old_mark(&self) {
        self.flush_satb_buffers();
        let marker = Marker::new(self, GenerationMode::Old);
        marker.scan_roots();
        marker.mark(false);
        self.satb.abandon();
        self.gc_state.set(GcStateBits::OLD_MARKING, false);
        self.marking.set_old_complete(true);

        self.sync_pinned_region_status();
        let mut candidates = Vec::new();
        let mut immediate = 0;
        for region in self.regions.iter() {
            if !region.is_old() || region.is_pinned() {
                continue;
            }
            let live = self.live_estimate(region.index());
            if region.state() == RegionState::Regular && live == 0 {
                region.set_state(RegionState::Trash);
                immediate += 1;
                continue;
            }
            if region.is_regular() {
                candidates.push(RegionData {
                    index: region.index(),
                    affiliation: region.affiliation(),
                    live_bytes: live,
                    garbage: region.used().saturating_sub(live),
                    capacity: region.size_bytes(),
                    age: region.age(),
                });
            }
        }
        if immediate > 0 {
            self.recycle_trash();
        }

        let budget = CollectionSetBudget {
            young_reserve: 0,
            old_reserve: usize::MAX / 2,
            waste: 1.0,
            immediate_garbage: 0,
            total_garbage: 0,
        };
        let mut selected = Vec::new();
        self.old
            .heuristics()
            .choose_collection_set(&candidates, &budget, &mut selected);
        let next = if selected.is_empty() {
            OldState::Idle
        } else {
            OldState::Waiting
        };
        self.old_gen.set_candidates(selected);
        self.old_gen.transition_to(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, GcMode, REGION_SIZE_FLOOR};
    use crate::heap::alloc::AllocRequest;
    use crate::card::CARD_SIZE;
    use crate::heap::object::{init_object, ObjectShape};
    use crate::heap::region::Affiliation;
    use std::sync::atomic::Ordering;

    fn heap() -> Heap {
        let config = GcConfig::default()
            .with_heap_size(4 << 20)
            .with_region_size_bounds(REGION_SIZE_FLOOR.max(sys_alloc::allocation_granularity()), 1 << 20)
            .with_target_regions(32)
            .with_parallel_workers(2)
            .with_mode(GcMode::Generational);
        Heap::new(config).unwrap()
    }

    fn alloc_old(heap: &Heap, shape: ObjectShape) -> ObjRef {
        let mut req = AllocRequest::shared_gc(shape.size_words(), Affiliation::Old, false);
        let addr = heap.allocate_memory(&mut req).unwrap();
        // SAFETY: fresh allocation.
        unsafe { init_object(addr, shape) }
    }

    #[test]
    fn test_old_marking_fills_dead_objects_and_picks_candidates() {
        let heap = heap();
        let live = alloc_old(&heap, ObjectShape::instance(1, 0));
        // Dead objects take over half the region.
        let count = heap.region_layout().region_size_bytes * 6 / 10 / (128 * WORD_SIZE);
        let dead: Vec<ObjRef> = (0..count)
            .map(|_| alloc_old(&heap, ObjectShape::instance(0, 126)))
            .collect();
        let tail = alloc_old(&heap, ObjectShape::instance(0, 2));
        live.ref_slot(0).store(tail.addr(), Ordering::Relaxed);
        let _root = heap.roots.new_handle(live.addr());
        let region = heap.region_of(live);
        assert!(dead.iter().all(|d| heap.region_of(*d).index() == region.index()));

        heap.old_gen.transition_to(OldState::Filling);
        heap.prepare_old_marking();
        assert!(heap.gc_state().contains(GcStateBits::OLD_MARKING));
        heap.old_gen.transition_to(OldState::Marking);
        heap.final_old_mark();

        assert!(heap.marking.is_old_complete());
        assert!(!heap.gc_state().contains(GcStateBits::OLD_MARKING));
        assert_eq!(region.live_bytes(), live.size_bytes() + tail.size_bytes());
        assert_eq!(heap.old_gen.state(), OldState::Waiting);
        assert_eq!(heap.old_gen.candidates(), vec![region.index()]);

        heap.old_gen.transition_to(OldState::Filling);
        assert!(heap.coalesce_and_fill_old_regions(false));
        let filler = ObjRef::from_raw(live.end()).unwrap();
        assert!(filler.layout().is_filler());
        assert_eq!(filler.end(), tail.addr());

        let cards = heap.rset.cards();
        let inner = cards.card_index(dead[count / 2].addr()) + 1;
        assert!(cards.card_start(inner) + CARD_SIZE <= tail.addr());
        assert!(!heap.rset.starts().starts_object(inner));
    }

    #[test]
    fn test_unreachable_old_region_is_reclaimed() {
        let heap = heap();
        let obj = alloc_old(&heap, ObjectShape::instance(0, 8));
        let index = heap.region_of(obj).index();
        heap.prepare_old_marking();
        heap.old_gen.transition_to(OldState::Marking);
        heap.final_old_mark();
        assert!(heap.regions()[index].is_empty());
        assert_eq!(heap.old().used(), 0);
        assert_eq!(heap.old_gen.state(), OldState::Idle);
    }

    #[test]
    fn test_cancel_stops_coalescing_between_regions() {
        let heap = heap();
        let live = alloc_old(&heap, ObjectShape::instance(0, 2));
        let dead = alloc_old(&heap, ObjectShape::instance(0, 126));
        let _tail = alloc_old(&heap, ObjectShape::instance(0, 2));
        let _root = heap.roots.new_handle(live.addr());
        heap.prepare_old_marking();
        heap.old_gen.transition_to(OldState::Marking);
        heap.final_old_mark();

        assert!(heap.cancel.try_cancel());
        assert!(!heap.coalesce_and_fill_old_regions(true));
        assert!(!ObjRef::from_raw(dead.addr()).unwrap().layout().is_filler());
        heap.cancel.clear();

        assert!(heap.coalesce_and_fill_old_regions(true));
        assert!(ObjRef::from_raw(dead.addr()).unwrap().layout().is_filler());
        // Every suspended section was resumed.
        assert!(heap.cancel.try_cancel());
        heap.cancel.clear();
    }
}
