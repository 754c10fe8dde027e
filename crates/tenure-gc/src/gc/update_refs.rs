//! Reference updating after evacuation.
//!
//! Every slot that still points into the collection set is rewritten to the
//! forwardee. Regions are walked up to the update watermark captured when
//! the phase began; objects allocated later can only hold to-space
//! references. Old regions are visited through dirty cards unless the
//! collection set holds old regions or the cycle is global, in which case
//! they are walked in full.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::card::{CardSnapshot, RegionChunkIterator};
use crate::heap::generation::GenerationMode;
use crate::heap::object::{ObjRef, WORD_SIZE};
use crate::heap::region::HeapRegion;
use crate::heap::Heap;

impl Heap {
    /// Makes the heap parseable and records how far each region must be
    /// walked. Pause only.
    pub(crate) fn prepare_update_refs(&self) {
        self.retire_labs(true, true);
        for region in self.regions.iter() {
            if region.is_active() && !region.is_cset() {
                region.set_update_watermark(region.top());
            }
        }
    }

    /// Rewrites `slot` if it points into the collection set. `holder_old`
    /// re-dirties the card of an old slot that ends up pointing young.
    #[inline]
    fn update_slot(&self, holder_old: bool, slot_addr: usize, slot: &AtomicUsize) {
        let raw = slot.load(Ordering::Acquire);
        let Some(obj) = ObjRef::from_raw(raw) else {
            return;
        };
        let target = if self.in_collection_set(raw) {
            let fwd = obj.resolve_forwarded();
            if fwd != obj {
                let _ = slot.compare_exchange(raw, fwd.addr(), Ordering::Release, Ordering::Relaxed);
            }
            fwd
        } else {
            obj
        };
        if holder_old && self.region_of(target).is_young() {
            self.rset.cards().dirty_write(slot_addr);
        }
    }

    fn update_object(&self, obj: ObjRef, holder_old: bool) {
        obj.slots(|addr, slot| self.update_slot(holder_old, addr, slot));
    }

    /// Updates live objects of one region below its watermark.
    fn update_region(&self, region: &HeapRegion) {
        let limit = region.update_watermark();
        let holder_old = region.is_old();
        if region.is_humongous_start() {
            if let Some(obj) = ObjRef::from_raw(region.bottom()) {
                if self.marking.is_marked(obj) {
                    self.update_object(obj, holder_old);
                }
            }
            return;
        }
        self.marking
            .for_each_live(region, limit, |obj| self.update_object(obj, holder_old));
    }

    /// Updates references held by every heap object of interest. Returns
    /// `false` when cancelled.
    pub(crate) fn update_heap_references(&self, mode: GenerationMode, cancellable: bool) -> bool {
        let walk_old = mode == GenerationMode::Global || self.cset.has_old_regions();
        let scan_cards = self.config.mode.is_generational() && !walk_old;
        let stable =
            self.old_gen.state().is_remembered_set_stable() && self.marking.is_old_complete();
        let next = AtomicUsize::new(0);
        let chunks = RegionChunkIterator::new(
            self.regions.len(),
            self.layout.region_size_words,
            self.workers.len(),
        );
        let cancelled = || cancellable && self.cancel.is_cancelled();

        self.workers.run(|_, _, _| {
            loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                if index >= self.regions.len() || cancelled() {
                    break;
                }
                let region = &self.regions[index];
                if !region.is_active() || region.is_cset() || region.is_humongous_continuation() {
                    continue;
                }
                if region.is_old() && !walk_old {
                    continue;
                }
                self.update_region(region);
            }
            if !scan_cards {
                return;
            }
            while let Some(chunk) = chunks.next() {
                if cancelled() {
                    break;
                }
                let region = &self.regions[chunk.region];
                if !region.is_old() || !region.is_regular() {
                    continue;
                }
                let from = region.bottom() + chunk.offset_words * WORD_SIZE;
                let to = (from + chunk.size_words * WORD_SIZE).min(region.update_watermark());
                self.rset.scan_dirty(
                    region.bottom(),
                    from,
                    to,
                    CardSnapshot::Either,
                    |obj| !stable || self.marking.is_marked(obj),
                    |_, addr, slot| self.update_slot(true, addr, slot),
                );
            }
        });
        !cancelled()
    }

    /// Rewrites root slots that point into the collection set. Pause only.
    pub(crate) fn update_root_references(&self) {
        self.roots_do(&mut |slot| self.update_slot(false, 0, slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, REGION_SIZE_FLOOR};
    use crate::gc::marker::Marker;
    use crate::gc::state::GcStateBits;
    use crate::heap::alloc::AllocRequest;
    use crate::heap::object::{init_object, ObjectShape};
    use crate::heap::region::RegionState;

    #[test]
    fn test_references_follow_forwarding() {
        let config = GcConfig::default()
            .with_heap_size(4 << 20)
            .with_region_size_bounds(REGION_SIZE_FLOOR.max(sys_alloc::allocation_granularity()), 1 << 20)
            .with_target_regions(32)
            .with_parallel_workers(2);
        let heap = Heap::new(config).unwrap();
        let alloc = |shape: ObjectShape| {
            let mut req = AllocRequest::shared(shape.size_words());
            let addr = heap.allocate_memory(&mut req).unwrap();
            // SAFETY: fresh allocation.
            unsafe { init_object(addr, shape) }
        };
        let target = alloc(ObjectShape::instance(0, 1));
        target.data_word(0).store(7, Ordering::Relaxed);
        let root = heap.roots.new_handle(target.addr());

        heap.prepare_marking(GenerationMode::Global);
        let marker = Marker::new(&heap, GenerationMode::Global);
        marker.scan_roots();
        assert!(marker.mark(false));

        let region = heap.region_of(target);
        region.set_state(RegionState::Cset);
        heap.cset.add(region.index(), target.size_bytes(), false);
        heap.rebuild_free_set();

        // Allocated after marking in a fresh region, so implicitly live.
        let holder = alloc(ObjectShape::ref_array(3));
        assert_ne!(heap.region_of(holder).index(), region.index());
        holder.ref_slot(2).store(target.addr(), Ordering::Relaxed);

        heap.gc_state
            .set(GcStateBits::HAS_FORWARDED | GcStateBits::EVACUATION, true);
        assert!(heap.evacuate_collection_set(false));
        let copy = target.resolve_forwarded();
        assert_ne!(copy, target);

        heap.prepare_update_refs();
        assert!(heap.update_heap_references(GenerationMode::Global, false));
        heap.update_root_references();
        assert_eq!(holder.ref_slot(2).load(Ordering::Relaxed), copy.addr());
        assert_eq!(root.slot().load(Ordering::Relaxed), copy.addr());
        assert_eq!(copy.data_word(0).load(Ordering::Relaxed), 7);
    }
}
