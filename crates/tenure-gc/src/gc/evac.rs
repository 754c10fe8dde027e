//! Evacuation: copying live objects out of collection-set regions.
//!
//! Any thread may copy an object, workers and mutators alike. Copies are
//! made into the copying thread's GCLAB (young) or PLAB (old) and published
//! by a CAS on the original's mark word; the loser of a race throws its
//! copy away and uses the winner's.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gc::oom::EvacScope;
use crate::gc::state::GcStateBits;
use crate::heap::alloc::AllocRequest;
use crate::heap::lab::Lab;
use crate::heap::object::{align_object_words, copy_words, fill_with_filler, MarkWord, ObjRef, WORD_SIZE};
use crate::heap::region::Affiliation;
use crate::heap::thread_local::{LocalState, ThreadContext};
use crate::heap::Heap;
use crate::tracing::{log_evac_oom, log_promotion_failure};

/// Promotion failures a thread logs per cycle; later ones are only counted.
const MAX_PROMOTION_FAILURE_REPORTS: u8 = 4;

/// Copy counters of the running cycle.
#[derive(Debug, Default)]
pub(crate) struct EvacStats {
    evacuated: AtomicUsize,
    promoted: AtomicUsize,
    promotion_failures: AtomicUsize,
}

impl EvacStats {
    fn record_copy(&self, bytes: usize, promoted: bool) {
        let counter = if promoted { &self.promoted } else { &self.evacuated };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns `(evacuated, promoted, promotion_failures)` and resets them.
    pub(crate) fn take(&self) -> (usize, usize, usize) {
        (
            self.evacuated.swap(0, Ordering::Relaxed),
            self.promoted.swap(0, Ordering::Relaxed),
            self.promotion_failures.swap(0, Ordering::Relaxed),
        )
    }
}

/// Where a copy was allocated.
#[derive(Debug, Clone, Copy)]
struct CopySlot {
    addr: usize,
    affiliation: Affiliation,
    in_lab: bool,
    promotion: bool,
}

impl Heap {
    fn max_evac_lab_words(&self) -> usize {
        (self.config.min_lab_words * self.config.max_evac_lab_ratio).min(self.layout.max_lab_words)
    }

    /// Retires `lab` and installs a fresh one able to hold `words`.
    fn refill_evac_lab(&self, lab: &mut Lab, affiliation: Affiliation, words: usize) -> bool {
        self.retire_lab(lab);
        lab.grow(self.max_evac_lab_words());
        let min = align_object_words(words.max(self.config.min_lab_words));
        let desired = lab.desired_words().max(min);
        let mut req = match affiliation {
            Affiliation::Old => AllocRequest::plab(min, desired),
            _ => AllocRequest::gclab(min, desired),
        };
        match self.allocate_memory(&mut req) {
            Some(start) => {
                lab.install(start, req.actual_words(), req.promotion_allowed());
                true
            }
            None => false,
        }
    }

    /// Finds room for a `words`-word copy in `affiliation`.
    fn allocate_copy(
        &self,
        affiliation: Affiliation,
        promotion: bool,
        words: usize,
        state: &mut LocalState,
    ) -> Option<CopySlot> {
        let lab = match affiliation {
            Affiliation::Old => &mut state.plab,
            _ => &mut state.gclab,
        };
        let lab_usable = |lab: &Lab| !promotion || lab.allows_promotion();
        let slot = |addr, in_lab| CopySlot {
            addr,
            affiliation,
            in_lab,
            promotion,
        };

        if lab_usable(lab) {
            if let Some(addr) = lab.allocate(words) {
                return Some(slot(addr, true));
            }
        }
        let small = words * 4 <= self.max_evac_lab_words();
        if small && (lab.is_empty() || lab.free_words() < self.config.min_lab_words) {
            if self.refill_evac_lab(lab, affiliation, words) && lab_usable(lab) {
                if let Some(addr) = lab.allocate(words) {
                    return Some(slot(addr, true));
                }
            }
        }
        let mut req = AllocRequest::shared_gc(words, affiliation, promotion);
        self.allocate_memory(&mut req).map(|addr| slot(addr, false))
    }

    fn report_promotion_failure(&self, words: usize, state: &mut LocalState) {
        self.evac_stats.promotion_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_promotion_failure();
        let epoch = self.gc_count();
        if state.report_epoch != epoch {
            state.report_epoch = epoch;
            state.promotion_failure_reports = 0;
        }
        if state.promotion_failure_reports < MAX_PROMOTION_FAILURE_REPORTS {
            state.promotion_failure_reports += 1;
            log_promotion_failure(words, self.budget.promoted_reserve(), self.budget.promoted_expended());
        }
    }

    /// Drops a copy that lost the forwarding race.
    fn discard_copy(&self, copy: CopySlot, words: usize, state: &mut LocalState) {
        let lab = match copy.affiliation {
            Affiliation::Old => &mut state.plab,
            _ => &mut state.gclab,
        };
        if copy.in_lab && lab.undo(copy.addr, words) {
            return;
        }
        // SAFETY: the copy was never published; its memory is ours.
        unsafe { fill_with_filler(copy.addr, words) };
        if copy.affiliation == Affiliation::Old {
            self.rset.starts().register_object(copy.addr);
        }
    }

    /// Copies `obj` out of the collection set and returns the copy that
    /// won. Must be called inside an evacuation scope. After an evacuation
    /// OOM the thread stops copying and gets the current forwardee, which
    /// may be `obj` itself.
    pub(crate) fn evacuate_object(&self, obj: ObjRef, ctx: &ThreadContext, state: &mut LocalState) -> ObjRef {
        let mark = obj.mark_word();
        if mark.is_forwarded() {
            return obj.resolve_forwarded();
        }
        if ctx.evac().is_oom_during_evac() {
            return obj.resolve_forwarded();
        }

        let words = obj.size_words();
        let from = self.region_of(obj);
        let source = from.affiliation();
        let promote = self.config.mode.is_generational()
            && source == Affiliation::Young
            && self.config.promote_tenured_objects
            && from.age().saturating_add(mark.age()) >= self.config.tenuring_threshold;

        let mut copy = None;
        if promote {
            copy = self.allocate_copy(Affiliation::Old, true, words, state);
            if copy.is_none() {
                self.report_promotion_failure(words, state);
            }
        }
        let copy = match copy.or_else(|| self.allocate_copy(source, false, words, state)) {
            Some(copy) => copy,
            None => {
                self.metrics.record_evac_oom();
                log_evac_oom(words);
                if self.cancel.try_cancel() {
                    self.metrics.record_cancellation();
                }
                self.oom.handle_out_of_memory(ctx.evac());
                return obj.resolve_forwarded();
            }
        };

        // SAFETY: `copy.addr` is fresh memory of `words` words owned by this
        // thread; nothing writes to a collection-set object while it is
        // being evacuated.
        unsafe { copy_words(obj.addr(), copy.addr, words) };
        let age_by = u8::from(
            copy.affiliation == Affiliation::Young && self.aging_cycle.load(Ordering::Relaxed),
        );
        let Some(to) = ObjRef::from_raw(copy.addr) else {
            return obj;
        };
        to.set_mark_word(mark.aged(age_by));

        match obj.cas_mark_word(mark, MarkWord::forwarded_to(copy.addr)) {
            Ok(()) => {
                let bytes = words * WORD_SIZE;
                if copy.affiliation == Affiliation::Old {
                    if copy.in_lab {
                        self.rset.starts().register_object(copy.addr);
                    }
                    self.rset.cards().dirty_both_range(copy.addr, bytes);
                    if copy.promotion && copy.in_lab {
                        state.plab.record_promotion(words);
                    }
                }
                // Promotions were charged when their space was handed out.
                match (copy.promotion, copy.affiliation) {
                    (true, _) => {}
                    (false, Affiliation::Old) => self.budget.expend_old_evac(bytes),
                    (false, _) => self.budget.expend_young_evac(bytes),
                }
                self.evac_stats.record_copy(bytes, copy.promotion);
                to
            }
            Err(current) => {
                self.discard_copy(copy, words, state);
                ObjRef::from_raw(current.forwardee()).unwrap_or(obj)
            }
        }
    }

    /// Load-reference barrier: resolves `raw` to its to-space copy,
    /// evacuating it first while evacuation is running.
    #[inline]
    pub(crate) fn load_reference_barrier(
        &self,
        raw: usize,
        ctx: &ThreadContext,
        state: &mut LocalState,
    ) -> usize {
        if raw == 0 || !self.gc_state.is(GcStateBits::HAS_FORWARDED) || !self.in_collection_set(raw) {
            return raw;
        }
        let Some(obj) = ObjRef::from_raw(raw) else {
            return raw;
        };
        let resolved = obj.resolve_forwarded();
        if resolved != obj || !self.gc_state.is(GcStateBits::EVACUATION) {
            return resolved.addr();
        }
        let _scope = EvacScope::enter(&self.oom, ctx.evac());
        self.evacuate_object(obj, ctx, state).addr()
    }

    /// Copies every live object of the collection set. Regions are claimed
    /// one at a time; objects already forwarded are skipped, so the pass can
    /// be repeated after an interruption. Returns `false` when cancelled or
    /// out of memory.
    pub(crate) fn evacuate_collection_set(&self, cancellable: bool) -> bool {
        self.cset.reset_cursor();
        self.workers.run(|_, ctx, state| {
            let _scope = EvacScope::enter(&self.oom, ctx.evac());
            let stop = || self.oom.is_oom() || (cancellable && self.cancel.is_cancelled());
            while let Some(index) = self.cset.claim_next() {
                if stop() {
                    break;
                }
                let region = &self.regions[index];
                let mut stopped = false;
                self.marking.for_each_live(region, region.top(), |obj| {
                    if stopped || stop() {
                        stopped = true;
                        return;
                    }
                    if !obj.is_forwarded() {
                        self.evacuate_object(obj, ctx, state);
                    }
                });
            }
        });
        !(self.oom.is_oom() || (cancellable && self.cancel.is_cancelled()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, GcMode, REGION_SIZE_FLOOR};
    use crate::heap::object::{init_object, ObjectShape};
    use crate::heap::region::RegionState;
    use crate::heap::thread_local::ThreadKind;

    fn heap(mode: GcMode) -> Heap {
        let config = GcConfig::default()
            .with_heap_size(4 << 20)
            .with_region_size_bounds(REGION_SIZE_FLOOR.max(sys_alloc::allocation_granularity()), 1 << 20)
            .with_target_regions(32)
            .with_parallel_workers(2)
            .with_mode(mode);
        Heap::new(config).unwrap()
    }

    /// Allocates `obj` and moves its region into the collection set with
    /// evacuation switched on.
    fn setup(heap: &Heap) -> ObjRef {
        let shape = ObjectShape::instance(1, 3);
        let mut req = AllocRequest::shared(shape.size_words());
        let addr = heap.allocate_memory(&mut req).unwrap();
        // SAFETY: fresh allocation.
        let obj = unsafe { init_object(addr, shape) };
        obj.data_word(0).store(0xfeed, Ordering::Relaxed);
        let region = heap.region_of(obj);
        region.set_state(RegionState::Cset);
        heap.cset.add(region.index(), obj.size_bytes(), false);
        heap.rebuild_free_set();
        heap.budget.set_young_evac_reserve(1 << 20);
        heap.gc_state
            .set(GcStateBits::HAS_FORWARDED | GcStateBits::EVACUATION, true);
        obj
    }

    #[test]
    fn test_evacuation_copies_and_forwards() {
        let heap = heap(GcMode::Satb);
        let obj = setup(&heap);
        let ctx = heap.threads.register(ThreadKind::Mutator);
        let mut state = ctx.lock();
        let _scope = EvacScope::enter(&heap.oom, ctx.evac());
        let copy = heap.evacuate_object(obj, &ctx, &mut state);
        assert_ne!(copy, obj);
        assert!(!heap.in_collection_set(copy.addr()));
        assert_eq!(obj.resolve_forwarded(), copy);
        assert_eq!(copy.data_word(0).load(Ordering::Relaxed), 0xfeed);
        assert!(!copy.is_forwarded());
        assert_eq!(heap.evacuate_object(obj, &ctx, &mut state), copy);
        assert_eq!(heap.evac_stats.take().0, obj.size_bytes());
    }

    #[test]
    fn test_load_reference_barrier_evacuates_once() {
        let heap = heap(GcMode::Satb);
        let obj = setup(&heap);
        let ctx = heap.threads.register(ThreadKind::Mutator);
        let mut state = ctx.lock();
        let first = heap.load_reference_barrier(obj.addr(), &ctx, &mut state);
        let second = heap.load_reference_barrier(obj.addr(), &ctx, &mut state);
        assert_eq!(first, second);
        assert_ne!(first, obj.addr());
        assert_eq!(heap.load_reference_barrier(first, &ctx, &mut state), first);
        assert_eq!(heap.load_reference_barrier(0, &ctx, &mut state), 0);
    }

    #[test]
    fn test_racing_copies_agree() {
        let heap = heap(GcMode::Satb);
        let obj = setup(&heap);
        let winners: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let ctx = heap.threads.register(ThreadKind::Mutator);
                        let mut state = ctx.lock();
                        let _scope = EvacScope::enter(&heap.oom, ctx.evac());
                        heap.evacuate_object(obj, &ctx, &mut state).addr()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(winners.iter().all(|&w| w == winners[0]));
        assert_eq!(obj.resolve_forwarded().addr(), winners[0]);
    }

    #[test]
    fn test_tenured_objects_are_promoted() {
        let heap = heap(GcMode::Generational);
        let obj = setup(&heap);
        obj.set_mark_word(MarkWord::with_age(heap.config.tenuring_threshold));
        heap.budget.set_promoted_reserve(1 << 20);
        let ctx = heap.threads.register(ThreadKind::Mutator);
        let mut state = ctx.lock();
        let _scope = EvacScope::enter(&heap.oom, ctx.evac());
        let copy = heap.evacuate_object(obj, &ctx, &mut state);
        assert!(heap.region_of(copy).is_old());
        assert!(heap.rset.cards().is_write_dirty(heap.rset.cards().card_index(copy.addr())));
        assert_eq!(heap.evac_stats.take().1, copy.size_bytes());
    }

    #[test]
    fn test_promotion_failure_falls_back_to_young() {
        let heap = heap(GcMode::Generational);
        let obj = setup(&heap);
        obj.set_mark_word(MarkWord::with_age(heap.config.tenuring_threshold));
        let ctx = heap.threads.register(ThreadKind::Mutator);
        let mut state = ctx.lock();
        let _scope = EvacScope::enter(&heap.oom, ctx.evac());
        let copy = heap.evacuate_object(obj, &ctx, &mut state);
        assert!(heap.region_of(copy).is_young());
        assert_eq!(heap.metrics.promotion_failures(), 1);
    }
}
