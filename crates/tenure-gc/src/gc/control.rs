//! Cycle control: the concurrent cycle, its pauses, and the policy that
//! decides when a cycle runs and what it turns into when it is cancelled.
//!
//! A concurrent cycle is a fixed sequence of steps:
//!
//! ```text
//! init mark -> concurrent mark -> final mark -> concurrent evacuation
//!     -> init update refs -> concurrent update refs -> final update refs
//! ```
//!
//! Pauses hold the safepoint lock for writing; concurrent steps run the
//! worker pool while mutators keep going. Any step may observe
//! cancellation, after which the rest of the cycle completes as a
//! degenerated cycle from the step's [`DegenPoint`].

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use crate::config::GcMode;
use crate::gc::degen::DegenPoint;
use crate::gc::heuristics::{CollectionSetBudget, GenerationStats, Heuristics, RegionData};
use crate::gc::marker::Marker;
use crate::gc::state::GcStateBits;
use crate::gc::verifier::{Verifier, VerifyOptions};
use crate::heap::free_set::Partition;
use crate::heap::generation::{GenerationMode, OldState};
use crate::heap::object::ObjRef;
use crate::heap::region::RegionState;
use crate::heap::Heap;
use crate::metrics::{CollectionType, GcMetrics, MetricsSnapshot};
use crate::tracing::{
    log_cancel, log_collection_set, log_phase_end, log_phase_start, next_gc_id, trace_gc_cycle,
    trace_phase, GcId, GcPhase, SpanGuard,
};

/// State owned by whoever holds the control lock.
#[derive(Debug, Default)]
pub struct ControlState {
    /// Degenerated cycles since the last concurrent or full one.
    pub(crate) consecutive_degenerated: usize,
    /// Marking cycles started, used to pace region aging.
    pub(crate) cycles: usize,
}

/// Bookkeeping shared by every kind of collection.
#[derive(Debug)]
pub(crate) struct CycleRecord {
    pub(crate) mode: GenerationMode,
    pub(crate) gc_id: GcId,
    started: Instant,
    pub(crate) pause_time: Duration,
    pub(crate) snapshot: MetricsSnapshot,
    pub(crate) cset_regions: usize,
    pub(crate) immediate_regions: usize,
    pub(crate) unload_classes: bool,
}

impl CycleRecord {
    pub(crate) fn new(heap: &Heap, mode: GenerationMode) -> Self {
        Self {
            mode,
            gc_id: next_gc_id(),
            started: Instant::now(),
            pause_time: Duration::ZERO,
            snapshot: MetricsSnapshot::before(heap.capacity(), heap.used(), heap.free()),
            cset_regions: 0,
            immediate_regions: 0,
            unload_classes: false,
        }
    }

    /// Records the finished collection and bumps the GC count.
    pub(crate) fn finish(self, heap: &Heap, kind: CollectionType) -> GcMetrics {
        let (evacuated, promoted, failures) = heap.evac_stats.take();
        let metrics = GcMetrics {
            collection_type: kind,
            duration: self.started.elapsed(),
            pause_time: self.pause_time,
            used_before: self.snapshot.used_before(),
            used_after: heap.used(),
            cset_regions: self.cset_regions,
            immediate_regions: self.immediate_regions,
            bytes_evacuated: evacuated,
            bytes_promoted: promoted,
            promotion_failures: failures,
            unload_classes: self.unload_classes,
        };
        heap.metrics.record_cycle(metrics);
        heap.gc_count.fetch_add(1, Ordering::AcqRel);
        metrics
    }
}

/// Step a concurrent cycle has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Step {
    Begun,
    InitMarked,
    Marked,
    FinalMarked,
    Evacuated,
    InitUpdated,
    Updated,
    Done,
}

/// A concurrent cycle driven one step at a time.
///
/// Each step returns `false` when the cycle was cancelled before or while
/// it ran; the cycle must then be completed with [`degenerate`]. Steps must
/// be called in order. Dropping an unfinished cycle degenerates it.
///
/// [`degenerate`]: ConcurrentCycle::degenerate
pub struct ConcurrentCycle<'h> {
    heap: &'h Heap,
    control: Option<MutexGuard<'h, ControlState>>,
    record: Option<CycleRecord>,
    point: DegenPoint,
    step: Step,
    _span: SpanGuard,
}

impl std::fmt::Debug for ConcurrentCycle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentCycle")
            .field("mode", &self.mode())
            .field("point", &self.point)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl<'h> ConcurrentCycle<'h> {
    fn new(heap: &'h Heap, control: MutexGuard<'h, ControlState>, mode: GenerationMode) -> Self {
        let record = CycleRecord::new(heap, mode);
        let span = trace_gc_cycle("concurrent", mode.name(), record.gc_id);
        Self {
            heap,
            control: Some(control),
            record: Some(record),
            point: DegenPoint::OutsideCycle,
            step: Step::Begun,
            _span: span,
        }
    }

    /// Generation this cycle collects.
    #[must_use]
    pub fn mode(&self) -> GenerationMode {
        self.record
            .as_ref()
            .map_or(GenerationMode::Global, |r| r.mode)
    }

    /// Where a degenerated cycle would resume if this one were cancelled now.
    #[must_use]
    pub const fn degen_point(&self) -> DegenPoint {
        self.point
    }

    fn advance(&mut self, from: Step, to: Step) {
        assert_eq!(self.step, from, "cycle steps called out of order");
        self.step = to;
    }

    fn parts(&mut self) -> (&'h Heap, &mut ControlState, &mut CycleRecord) {
        let control = self
            .control
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("cycle used after completion"));
        let record = self
            .record
            .as_mut()
            .unwrap_or_else(|| unreachable!("cycle used after completion"));
        (self.heap, control, record)
    }

    /// Pause: snapshots TAMS, swaps card tables and scans roots.
    pub fn init_mark(&mut self) -> bool {
        self.advance(Step::Begun, Step::InitMarked);
        let (heap, control, record) = self.parts();
        let mode = record.mode;
        record.unload_classes = heap.heuristics().can_unload_classes();
        let done = heap.pause(record, GcPhase::InitMark, |_| {
            if heap.cancel.is_cancelled() {
                return false;
            }
            heap.init_mark_work(control, mode);
            true
        });
        if done {
            self.point = DegenPoint::Roots;
        }
        done
    }

    /// Scans the remembered set, then traces from the roots found at init
    /// mark while mutators run.
    pub fn concurrent_mark(&mut self) -> bool {
        self.advance(Step::InitMarked, Step::Marked);
        let heap = self.heap;
        let mode = self.mode();
        let _span = trace_phase(GcPhase::ConcurrentMark);
        log_phase_start(GcPhase::ConcurrentMark, heap.used());
        let marker = Marker::new(heap, mode);
        if heap.config.mode.is_generational()
            && mode == GenerationMode::Young
            && !marker.scan_remembered_set(true)
        {
            return false;
        }
        self.point = DegenPoint::Mark;
        let done = marker.mark(true);
        log_phase_end(GcPhase::ConcurrentMark, heap.used());
        done
    }

    /// Pause: finishes marking and chooses the collection set.
    pub fn final_mark(&mut self) -> bool {
        self.advance(Step::Marked, Step::FinalMarked);
        let (heap, _, record) = self.parts();
        let done = heap.pause(record, GcPhase::FinalMark, |record| {
            if heap.cancel.is_cancelled() {
                return false;
            }
            heap.final_mark_work(record, false);
            true
        });
        if done {
            self.point = DegenPoint::Evac;
        }
        done
    }

    /// Copies live collection-set objects.
    pub fn concurrent_evacuate(&mut self) -> bool {
        self.advance(Step::FinalMarked, Step::Evacuated);
        let heap = self.heap;
        if heap.cset.is_empty() {
            return true;
        }
        let _span = trace_phase(GcPhase::ConcurrentEvacuation);
        log_phase_start(GcPhase::ConcurrentEvacuation, heap.used());
        let done = heap.evacuate_collection_set(true);
        log_phase_end(GcPhase::ConcurrentEvacuation, heap.used());
        done
    }

    /// Pause: retires LABs and captures update watermarks.
    pub fn init_update_refs(&mut self) -> bool {
        self.advance(Step::Evacuated, Step::InitUpdated);
        let (heap, _, record) = self.parts();
        if heap.cset.is_empty() {
            return !heap.cancel.is_cancelled();
        }
        let done = heap.pause(record, GcPhase::InitUpdateRefs, |_| {
            if heap.cancel.is_cancelled() {
                return false;
            }
            heap.init_update_refs_work();
            true
        });
        if done {
            self.point = DegenPoint::UpdateRefs;
        }
        done
    }

    /// Rewrites heap references to forwarded objects.
    pub fn concurrent_update_refs(&mut self) -> bool {
        self.advance(Step::InitUpdated, Step::Updated);
        let heap = self.heap;
        if heap.cset.is_empty() {
            return !heap.cancel.is_cancelled();
        }
        let _span = trace_phase(GcPhase::ConcurrentUpdateRefs);
        log_phase_start(GcPhase::ConcurrentUpdateRefs, heap.used());
        let done = heap.update_heap_references(self.mode(), true);
        log_phase_end(GcPhase::ConcurrentUpdateRefs, heap.used());
        done
    }

    /// Pause: updates roots, trashes the collection set and cleans up.
    pub fn final_update_refs(&mut self) -> bool {
        self.advance(Step::Updated, Step::Done);
        let (heap, _, record) = self.parts();
        let done = heap.pause(record, GcPhase::FinalUpdateRefs, |_| {
            if heap.cancel.is_cancelled() {
                return false;
            }
            heap.final_update_refs_work();
            true
        });
        if !done {
            self.step = Step::Updated;
        }
        done
    }

    /// Completes the cycle: records it as concurrent when every step ran,
    /// otherwise degenerates it.
    pub fn finish(mut self) -> GcMetrics {
        self.complete()
    }

    /// Completes the cycle stop-the-world from its current degeneration
    /// point.
    pub fn degenerate(mut self) -> GcMetrics {
        self.complete_degenerated()
    }

    /// Runs every remaining step, degenerating on cancellation. May be
    /// called after some steps were taken by hand.
    pub fn run(mut self) -> GcMetrics {
        let _ = self.run_steps();
        self.complete()
    }

    fn run_steps(&mut self) -> bool {
        loop {
            let done = match self.step {
                Step::Begun => self.init_mark(),
                Step::InitMarked => self.concurrent_mark(),
                Step::Marked => self.final_mark(),
                Step::FinalMarked => self.concurrent_evacuate(),
                Step::Evacuated => self.init_update_refs(),
                Step::InitUpdated => self.concurrent_update_refs(),
                Step::Updated => self.final_update_refs(),
                Step::Done => return true,
            };
            if !done {
                return false;
            }
        }
    }

    pub(crate) fn run_keeping_control(mut self) -> (GcMetrics, MutexGuard<'h, ControlState>) {
        let _ = self.run_steps();
        let metrics = self.complete();
        let control = self
            .control
            .take()
            .unwrap_or_else(|| unreachable!("control released twice"));
        (metrics, control)
    }

    fn complete(&mut self) -> GcMetrics {
        if self.step != Step::Done {
            return self.complete_degenerated();
        }
        let Some(record) = self.record.take() else {
            return GcMetrics::new();
        };
        let heap = self.heap;
        let control = self
            .control
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("control released before completion"));
        control.consecutive_degenerated = 0;
        heap.heuristics().record_success_concurrent();
        heap.cancel.clear();
        if heap.config.uncommit {
            heap.uncommit_empty_regions();
        }
        if heap.config.verify {
            let _pause = heap.safepoint.write();
            heap.verify_or_panic("concurrent");
        }
        record.finish(heap, CollectionType::Concurrent)
    }

    fn complete_degenerated(&mut self) -> GcMetrics {
        let Some(record) = self.record.take() else {
            return GcMetrics::new();
        };
        let heap = self.heap;
        let point = self.point;
        self.step = Step::Done;
        let control = self
            .control
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("control released before completion"));
        heap.degenerated_cycle(control, record, point)
    }
}

impl Drop for ConcurrentCycle<'_> {
    fn drop(&mut self) {
        if self.record.is_some() && self.control.is_some() {
            let _ = self.complete_degenerated();
        }
    }
}

impl Heap {
    /// Runs one collection of `mode` and blocks until it completes.
    ///
    /// In passive mode every collection is a degenerated cycle. Without
    /// generations every request collects the whole heap. In generational
    /// mode, [`GenerationMode::Old`] advances the old-generation cycle:
    /// it fills dead old objects, bootstraps old marking with a young
    /// cycle, then marks old concurrently. Old marking yields to
    /// allocation failures and resumes on the next old request. The
    /// returned metrics describe the young or degenerated cycle run along
    /// the way, if any.
    pub fn collect(&self, mode: GenerationMode) -> GcMetrics {
        let generational = self.config.mode.is_generational();
        let mode = if generational { mode } else { GenerationMode::Global };
        if mode == GenerationMode::Old {
            return self.collect_old();
        }
        let mut control = self.control.lock();
        if !self.config.mode.is_concurrent() {
            let record = CycleRecord::new(self, mode);
            return self.degenerated_cycle(&mut control, record, DegenPoint::OutsideCycle);
        }
        ConcurrentCycle::new(self, control, mode).run()
    }

    /// Runs a stop-the-world compacting collection of the whole heap.
    pub fn collect_full(&self) -> GcMetrics {
        let mut control = self.control.lock();
        let record = CycleRecord::new(self, GenerationMode::Global);
        self.full_collection(&mut control, record)
    }

    /// Starts a concurrent cycle that the caller steps through. Blocks
    /// while another cycle holds control.
    ///
    /// Without generations the cycle collects the whole heap. An old
    /// request starts a young cycle; old marking is driven by
    /// [`collect`](Self::collect).
    pub fn begin_cycle(&self, mode: GenerationMode) -> ConcurrentCycle<'_> {
        let mode = match (self.config.mode.is_generational(), mode) {
            (false, _) => GenerationMode::Global,
            (true, GenerationMode::Old) => GenerationMode::Young,
            (true, mode) => mode,
        };
        ConcurrentCycle::new(self, self.control.lock(), mode)
    }

    /// Whether the heuristics want a cycle to start now.
    pub fn should_start_gc(&self) -> bool {
        let young = &self.young;
        let stats = GenerationStats {
            capacity: young.max_capacity(),
            used: young.used(),
            available: self.free().min(young.available()),
        };
        self.heuristics().should_start_gc(&stats)
    }

    /// Heuristics of the young generation, or of the only generation.
    pub(crate) fn heuristics(&self) -> &dyn Heuristics {
        self.young.heuristics()
    }

    /// Called by a mutator whose allocation failed. Cancels the cycle in
    /// flight, or runs a stop-the-world collection when none ran since the
    /// failure. `attempt` counts failures of the same allocation.
    pub(crate) fn handle_alloc_failure(&self, attempt: usize) {
        self.metrics.record_alloc_failure();
        let seen = self.gc_count();
        let mut control = match self.control.try_lock() {
            Some(control) => control,
            None => {
                if self.cancel.try_cancel() {
                    self.metrics.record_cancellation();
                    log_cancel("allocation failure");
                }
                self.control.lock()
            }
        };
        if self.gc_count() != seen {
            self.cancel.clear();
            return;
        }
        let threshold = self.config.full_gc_threshold;
        let mode = if self.config.mode.is_generational() {
            GenerationMode::Young
        } else {
            GenerationMode::Global
        };
        let record = CycleRecord::new(self, mode);
        if attempt >= threshold || control.consecutive_degenerated >= threshold {
            self.full_collection(&mut control, record);
        } else {
            self.degenerated_cycle(&mut control, record, DegenPoint::OutsideCycle);
        }
    }

    /// Runs `f` at a pause and adds its duration to the cycle.
    pub(crate) fn pause<R>(
        &self,
        record: &mut CycleRecord,
        phase: GcPhase,
        f: impl FnOnce(&mut CycleRecord) -> R,
    ) -> R {
        let _span = trace_phase(phase);
        let _pause = self.safepoint.write();
        let start = Instant::now();
        log_phase_start(phase, self.used());
        let result = f(record);
        log_phase_end(phase, self.used());
        record.pause_time += start.elapsed();
        result
    }

    /// Clears every thread's evacuation OOM state. Pause only.
    pub(crate) fn clear_evac_oom(&self) {
        let threads = self.thread_contexts();
        self.oom.clear(threads.iter().map(|ctx| &**ctx));
    }

    /// Panics when the heap fails verification. Pause only.
    pub(crate) fn verify_or_panic(&self, after: &str) {
        if let Err(err) = Verifier::verify(self, VerifyOptions::after_cycle()) {
            panic!("heap verification failed after {after} cycle: {err}");
        }
    }

    /// Body of the init-mark pause, shared with degenerated cycles.
    pub(crate) fn init_mark_work(&self, control: &mut ControlState, mode: GenerationMode) {
        self.retire_labs(true, false);
        let generational = self.config.mode.is_generational();
        if generational && mode == GenerationMode::Young {
            for region in self.regions.iter().filter(|r| r.is_old()) {
                self.rset.cards().swap_range(region.bottom(), region.end());
            }
        }
        if generational && mode == GenerationMode::Global {
            self.abandon_old_marking();
        }
        self.start_marking(control, mode);
        Marker::new(self, mode).scan_roots();
    }

    /// Resets marking for `mode`, turns the barriers on and decides
    /// whether this cycle ages regions.
    pub(crate) fn start_marking(&self, control: &mut ControlState, mode: GenerationMode) {
        self.prepare_marking(mode);
        let mut bits = GcStateBits::MARKING;
        if self.config.mode.is_generational() && mode == GenerationMode::Young {
            bits = bits | GcStateBits::YOUNG_MARKING;
        }
        self.gc_state.set(bits, true);
        let period = self.config.aging_cycle_period;
        let aging = period != 0 && control.cycles % period == 0;
        self.aging_cycle.store(aging, Ordering::Release);
        control.cycles += 1;
    }

    /// Drops any old marking in progress. Global cycles mark old objects
    /// themselves.
    pub(crate) fn abandon_old_marking(&self) {
        if self.gc_state.is(GcStateBits::OLD_MARKING) {
            self.gc_state.set(GcStateBits::OLD_MARKING, false);
            self.satb.abandon();
            self.old_gen.queues().clear();
        }
        self.old_gen.abandon();
        self.old_gen.transition_to(OldState::Idle);
    }

    /// Body of the final-mark pause. `rescan_roots` forces a root rescan,
    /// which incremental-update marking always needs.
    pub(crate) fn final_mark_work(&self, record: &mut CycleRecord, rescan_roots: bool) {
        let mode = record.mode;
        self.retire_labs(true, false);
        self.flush_satb_buffers();
        let marker = Marker::new(self, mode);
        if rescan_roots || self.config.mode == GcMode::Iu {
            marker.scan_roots();
        }
        marker.mark(false);

        self.marking.set_young_complete(true);
        if mode == GenerationMode::Global {
            self.marking.set_old_complete(true);
        }
        self.gc_state
            .set(GcStateBits::MARKING | GcStateBits::YOUNG_MARKING, false);
        if mode == GenerationMode::Global && self.config.mode.is_generational() {
            let _span = trace_phase(GcPhase::CoalesceAndFill);
            self.coalesce_and_fill_old_regions(false);
        }

        self.choose_collection_set(record);
        if !self.cset.is_empty() {
            self.gc_state
                .set(GcStateBits::HAS_FORWARDED | GcStateBits::EVACUATION, true);
            self.clear_evac_oom();
        }
    }

    /// Ages young regions, reclaims immediate garbage and fills the
    /// collection set within the evacuation reserves. Pause only.
    fn choose_collection_set(&self, record: &mut CycleRecord) {
        let mode = record.mode;
        let generational = self.config.mode.is_generational();
        self.sync_pinned_region_status();
        if generational && self.aging_cycle.load(Ordering::Acquire) {
            for region in self.regions.iter().filter(|r| r.is_young() && r.is_regular()) {
                if region.top() > self.marking.tams(region.index()) {
                    region.reset_age();
                } else {
                    region.increment_age();
                }
            }
        }

        let mut candidates = Vec::new();
        let mut immediate = 0;
        let mut immediate_garbage = 0;
        let mut total_garbage = 0;
        for region in self.regions.iter() {
            if !Self::in_generation(region, mode) || region.is_pinned() {
                continue;
            }
            if region.is_humongous_start() {
                let marked = ObjRef::from_raw(region.bottom())
                    .is_some_and(|obj| self.marking.is_marked(obj));
                if !marked {
                    immediate += self.trash_humongous(region.index());
                    immediate_garbage += region.used();
                }
                continue;
            }
            if region.state() != RegionState::Regular {
                continue;
            }
            let live = self.live_estimate(region.index());
            if live == 0 {
                immediate_garbage += region.used();
                region.set_state(RegionState::Trash);
                immediate += 1;
                continue;
            }
            let garbage = region.used().saturating_sub(live);
            total_garbage += garbage;
            candidates.push(RegionData {
                index: region.index(),
                affiliation: region.affiliation(),
                live_bytes: live,
                garbage,
                capacity: region.size_bytes(),
                age: region.age(),
            });
        }
        if immediate > 0 {
            self.recycle_trash();
        }

        let (young_reserve, old_reserve) = {
            let free_set = self.heap_lock.lock();
            (
                free_set.available(Partition::Collector, &self.regions),
                free_set.available(Partition::OldCollector, &self.regions),
            )
        };
        let budget = CollectionSetBudget {
            young_reserve,
            old_reserve: if mode == GenerationMode::Global { old_reserve } else { 0 },
            waste: self.config.waste_factor(),
            immediate_garbage,
            total_garbage: total_garbage + immediate_garbage,
        };
        let mut selected = Vec::new();
        let heuristics = if generational {
            self.generation(mode).heuristics()
        } else {
            self.heuristics()
        };
        heuristics.choose_collection_set(&candidates, &budget, &mut selected);

        let (mut young_cost, mut old_cost) = (0, 0);
        for index in selected {
            let Some(data) = candidates.iter().find(|c| c.index == index) else {
                continue;
            };
            let region = &self.regions[index];
            let (spent, limit) = if region.is_old() {
                (&mut old_cost, budget.old_reserve)
            } else {
                (&mut young_cost, budget.young_reserve)
            };
            let cost = budget.cost(data.live_bytes);
            if self.cset.contains(index) || *spent + cost > limit {
                continue;
            }
            *spent += cost;
            self.cset.add(index, data.live_bytes, region.is_old());
            region.set_state(RegionState::Cset);
        }
        if generational && mode == GenerationMode::Young {
            old_cost += self.add_mixed_candidates(young_reserve, old_reserve, &budget);
        }

        self.rebuild_free_set();
        self.budget.set_young_evac_reserve(young_reserve);
        self.budget.set_old_evac_reserve(old_cost);
        let promoted = if generational { old_reserve.saturating_sub(old_cost) } else { 0 };
        self.budget.set_promoted_reserve(promoted);
        if generational {
            let shift = isize::try_from(young_reserve).unwrap_or(isize::MAX);
            self.young.adjust_available(-shift);
        }

        record.cset_regions = self.cset.len();
        record.immediate_regions = immediate;
        log_collection_set(
            self.cset.len(),
            self.cset.young_live_bytes(),
            self.cset.old_live_bytes(),
            immediate,
        );
    }

    /// Adds old candidates from the last old marking to a young cycle.
    /// Returns the evacuation cost they were charged.
    fn add_mixed_candidates(
        &self,
        young_reserve: usize,
        old_reserve: usize,
        budget: &CollectionSetBudget,
    ) -> usize {
        if self.old_gen.state() != OldState::Waiting || !self.marking.is_old_complete() {
            return 0;
        }
        let ratio = self.config.old_evac_ratio_percent.min(99);
        let cap = old_reserve.min(young_reserve * ratio / (100 - ratio));
        let mut spent = 0;
        let taken = self.old_gen.take_candidates(|index| {
            let region = &self.regions[index];
            if !region.is_old() || region.state() != RegionState::Regular {
                return true;
            }
            let cost = budget.cost(self.live_estimate(index));
            if spent + cost > cap {
                return false;
            }
            spent += cost;
            true
        });
        for index in taken {
            let region = &self.regions[index];
            if region.is_old() && region.state() == RegionState::Regular {
                self.cset.add(index, self.live_estimate(index), true);
                region.set_state(RegionState::Cset);
            }
        }
        if self.old_gen.candidate_count() == 0 {
            self.old_gen.transition_to(OldState::Idle);
        }
        spent
    }

    /// Trashes a humongous object's start region and its continuations.
    /// Returns the number of regions trashed.
    pub(crate) fn trash_humongous(&self, start: usize) -> usize {
        self.regions[start].set_state(RegionState::Trash);
        let mut count = 1;
        for region in self.regions[start + 1..].iter() {
            if !region.is_humongous_continuation() {
                break;
            }
            region.set_state(RegionState::Trash);
            count += 1;
        }
        count
    }

    /// Body of the init-update-refs pause.
    pub(crate) fn init_update_refs_work(&self) {
        self.prepare_update_refs();
        self.gc_state.set(GcStateBits::EVACUATION, false);
        self.gc_state.set(GcStateBits::UPDATE_REFS, true);
    }

    /// Body of the final-update-refs pause: the collection set is released
    /// and the cycle's evacuation state is reset.
    pub(crate) fn final_update_refs_work(&self) {
        if !self.cset.is_empty() {
            self.update_root_references();
            self.sync_pinned_region_status();
            for index in self.cset.regions() {
                let region = &self.regions[index];
                match region.state() {
                    RegionState::Cset => region.set_state(RegionState::Trash),
                    RegionState::CsetPinned => region.set_state(RegionState::Pinned),
                    _ => {}
                }
            }
        }
        self.cycle_cleanup();
    }

    /// Clears per-cycle evacuation state and recycles trash. Pause only.
    pub(crate) fn cycle_cleanup(&self) {
        let _span = trace_phase(GcPhase::Cleanup);
        self.cset.clear();
        self.gc_state.set(
            GcStateBits::EVACUATION | GcStateBits::UPDATE_REFS | GcStateBits::HAS_FORWARDED,
            false,
        );
        self.recycle_trash();
        self.budget.reset();
        self.young.unadjust_available();
    }

    /// Advances the old-generation cycle. See [`collect`](Self::collect).
    fn collect_old(&self) -> GcMetrics {
        let mut control = self.control.lock();
        let mut metrics = GcMetrics::new();
        if matches!(self.old_gen.state(), OldState::Idle | OldState::Waiting | OldState::Filling) {
            self.old_gen.transition_to(OldState::Filling);
            {
                let _span = trace_phase(GcPhase::CoalesceAndFill);
                if !self.coalesce_and_fill_old_regions(true) {
                    let record = CycleRecord::new(self, GenerationMode::Young);
                    return self.degenerated_cycle(&mut control, record, DegenPoint::OutsideCycle);
                }
            }
            let mut record = CycleRecord::new(self, GenerationMode::Old);
            self.pause(&mut record, GcPhase::InitMark, |_| self.prepare_old_marking());
            let (young, guard) =
                ConcurrentCycle::new(self, control, GenerationMode::Young).run_keeping_control();
            control = guard;
            metrics = young;
            if self.old_gen.state() != OldState::Bootstrapping {
                return metrics;
            }
            self.old_gen.transition_to(OldState::Marking);
        }
        if self.old_gen.state() != OldState::Marking {
            return metrics;
        }

        let marked = {
            let _span = trace_phase(GcPhase::OldMark);
            log_phase_start(GcPhase::OldMark, self.old.used());
            let marked = self.concurrent_old_mark();
            log_phase_end(GcPhase::OldMark, self.old.used());
            marked
        };
        if !marked {
            let record = CycleRecord::new(self, GenerationMode::Young);
            return self.degenerated_cycle(&mut control, record, DegenPoint::OutsideCycle);
        }
        let mut record = CycleRecord::new(self, GenerationMode::Old);
        self.pause(&mut record, GcPhase::FinalMark, |_| self.final_old_mark());
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, REGION_SIZE_FLOOR};
    use crate::heap::alloc::AllocRequest;
    use crate::heap::object::{init_object, ObjectShape};

    fn heap(mode: GcMode) -> Heap {
        let config = GcConfig::default()
            .with_heap_size(4 << 20)
            .with_region_size_bounds(REGION_SIZE_FLOOR.max(sys_alloc::allocation_granularity()), 1 << 20)
            .with_target_regions(32)
            .with_parallel_workers(2)
            .with_mode(mode)
            .with_verify(true);
        Heap::new(config).unwrap()
    }

    fn alloc(heap: &Heap, shape: ObjectShape) -> ObjRef {
        let mut req = AllocRequest::shared(shape.size_words());
        let addr = heap.allocate_memory(&mut req).unwrap();
        // SAFETY: fresh allocation.
        unsafe { init_object(addr, shape) }
    }

    #[test]
    fn test_cycle_reclaims_unreachable_region() {
        let heap = heap(GcMode::Satb);
        let garbage = alloc(&heap, ObjectShape::instance(0, 64));
        let region = heap.region_of(garbage).index();
        let metrics = heap.collect(GenerationMode::Global);
        assert_eq!(metrics.collection_type, CollectionType::Concurrent);
        assert_eq!(metrics.immediate_regions, 1);
        assert!(heap.regions()[region].is_empty());
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.gc_count(), 1);
    }

    #[test]
    fn test_cycle_evacuates_sparse_region() {
        let heap = heap(GcMode::Satb);
        let keep = alloc(&heap, ObjectShape::instance(0, 1));
        keep.data_word(0).store(42, Ordering::Relaxed);
        let root = heap.roots.new_handle(keep.addr());
        let region = heap.region_of(keep).index();
        let words = heap.region_layout().region_size_words / 2;
        let _dead = alloc(&heap, ObjectShape::instance(0, words));

        let metrics = heap.collect(GenerationMode::Global);
        assert_eq!(metrics.collection_type, CollectionType::Concurrent);
        assert_eq!(metrics.cset_regions, 1);
        let moved = ObjRef::from_raw(root.slot().load(Ordering::Relaxed)).unwrap();
        assert_ne!(moved, keep);
        assert_ne!(heap.region_of(moved).index(), region);
        assert_eq!(moved.data_word(0).load(Ordering::Relaxed), 42);
        assert!(heap.regions()[region].is_empty());
        assert_eq!(heap.gc_state().bits(), 0);
    }

    #[test]
    fn test_cancelled_cycle_degenerates() {
        let heap = heap(GcMode::Satb);
        let keep = alloc(&heap, ObjectShape::instance(0, 1));
        let _root = heap.roots.new_handle(keep.addr());
        // Two regions of garbage, so the degenerated cycle makes progress.
        let quarter = heap.region_layout().region_size_words / 4 - 2;
        for _ in 0..8 {
            alloc(&heap, ObjectShape::instance(0, quarter));
        }
        let mut cycle = heap.begin_cycle(GenerationMode::Global);
        assert!(cycle.init_mark());
        assert_eq!(cycle.degen_point(), DegenPoint::Roots);
        heap.cancel.try_cancel();
        assert!(!cycle.concurrent_mark());
        let metrics = cycle.degenerate();
        assert_eq!(metrics.collection_type, CollectionType::Degenerated);
        assert!(!heap.is_cancelled());
        assert_eq!(heap.metrics().degenerated_cycles(), 1);
        assert_eq!(heap.metrics().upgrades_to_full(), 0);
    }

    #[test]
    fn test_passive_mode_degenerates_every_cycle() {
        let heap = heap(GcMode::Passive);
        let garbage = alloc(&heap, ObjectShape::instance(0, 16));
        let region = heap.region_of(garbage).index();
        let metrics = heap.collect(GenerationMode::Young);
        assert_ne!(metrics.collection_type, CollectionType::Concurrent);
        assert!(heap.regions()[region].is_empty());
        assert_eq!(heap.metrics().concurrent_cycles(), 0);
    }

    #[test]
    fn test_alloc_failure_without_cycle_collects() {
        let heap = heap(GcMode::Satb);
        let _garbage = alloc(&heap, ObjectShape::instance(0, 16));
        heap.handle_alloc_failure(0);
        assert_eq!(heap.gc_count(), 1);
        assert_eq!(heap.metrics().alloc_failures(), 1);
        assert_eq!(heap.metrics().cancellations(), 0);
        assert!(!heap.is_cancelled());
        let full = heap.metrics().full_cycles();
        heap.handle_alloc_failure(heap.config().full_gc_threshold);
        assert_eq!(heap.metrics().full_cycles(), full + 1);
        assert_eq!(heap.gc_count(), 2);
    }

    #[test]
    fn test_young_region_ages_across_cycles() {
        let heap = heap(GcMode::Generational);
        let keep = alloc(&heap, ObjectShape::instance(0, 1));
        let _root = heap.roots.new_handle(keep.addr());
        let region = heap.region_of(keep).index();
        // Keep the region out of the collection set.
        let words = heap.region_layout().region_size_words - keep.size_words() - 8;
        let filler = alloc(&heap, ObjectShape::instance(0, words - 2));
        let _filler_root = heap.roots.new_handle(filler.addr());
        heap.collect(GenerationMode::Young);
        heap.collect(GenerationMode::Young);
        assert_eq!(heap.regions()[region].age(), 2);
    }
}
