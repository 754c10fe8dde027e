//! The heap: region table, allocation and the collector state shared by
//! mutators and workers.
//!
//! # Lock order
//!
//! | Level | Lock                       | Taken by                                  |
//! |-------|----------------------------|-------------------------------------------|
//! | 1     | `control`                  | the thread driving a cycle                |
//! | 2     | `safepoint` (write)        | pauses, on the thread holding `control`   |
//! | 2     | `safepoint` (read)         | mutator scopes                            |
//! | 3     | thread context state       | its owner, a worker for a phase, pauses   |
//! | 4     | heap lock (`FreeSet`)      | allocation, free-set rebuild, recycling   |
//! | 5     | old candidates, registries | short leaf sections                       |
//!
//! Locks are taken in increasing level. A mutator never takes the read
//! side of `safepoint` twice; allocation failure drops its scope's guard
//! before it waits on `control`. Concurrent phases run their workers
//! without the safepoint lock.

pub mod alloc;
pub mod budget;
pub mod collection_set;
pub mod free_set;
pub mod generation;
pub mod lab;
pub mod layout;
pub mod object;
pub mod region;
pub mod thread_local;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use sys_alloc::{Reservation, ReserveOptions};

use crate::card::RememberedSet;
use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::gc::control::ControlState;
use crate::gc::evac::EvacStats;
use crate::gc::heuristics::{Heuristics, StaticHeuristics};
use crate::gc::mark::MarkingContext;
use crate::gc::oom::OomEvacHandler;
use crate::gc::satb::SatbQueueSet;
use crate::gc::state::{CancelFlag, GcState, GcStateBits};
use crate::gc::worklist::TaskQueueSet;
use crate::metrics::GlobalMetrics;
use crate::roots::RootSet;
use crate::tracing::log_commit_failure;
use crate::workers::WorkerPool;

use self::budget::EvacBudget;
use self::collection_set::CollectionSet;
use self::free_set::{FreeSet, Partition};
use self::generation::{Generation, GenerationMode, OldGeneration};
use self::lab::{Lab, LabKind};
use self::layout::RegionLayout;
use self::object::{ObjRef, WORD_SIZE};
use self::region::{Affiliation, HeapRegion, RegionState};
use self::thread_local::{ThreadContext, ThreadRegistry};

/// A region-based heap and its collector.
pub struct Heap {
    pub(crate) config: GcConfig,
    pub(crate) layout: RegionLayout,
    reservation: Reservation,
    base: usize,
    pub(crate) regions: Box<[HeapRegion]>,
    pub(crate) heap_lock: Mutex<FreeSet>,
    peek_free: AtomicUsize,
    committed: AtomicUsize,
    pub(crate) cset: CollectionSet,
    pub(crate) marking: MarkingContext,
    pub(crate) rset: RememberedSet,
    pub(crate) young: Generation,
    pub(crate) old: Generation,
    pub(crate) global: Generation,
    pub(crate) old_gen: OldGeneration,
    pub(crate) budget: EvacBudget,
    pub(crate) evac_stats: EvacStats,
    pub(crate) gc_state: GcState,
    pub(crate) cancel: CancelFlag,
    pub(crate) oom: OomEvacHandler,
    pub(crate) threads: ThreadRegistry,
    pub(crate) satb: SatbQueueSet,
    pub(crate) mark_queues: TaskQueueSet,
    pub(crate) workers: WorkerPool,
    pub(crate) roots: RootSet,
    pub(crate) safepoint: RwLock<()>,
    pub(crate) control: Mutex<ControlState>,
    pub(crate) metrics: GlobalMetrics,
    pub(crate) gc_count: AtomicUsize,
    pub(crate) aging_cycle: AtomicBool,
    epoch: Instant,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("mode", &self.config.mode)
            .field("regions", &self.regions.len())
            .field("region_size", &self.layout.region_size_bytes)
            .field("used", &self.used())
            .field("committed", &self.committed())
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Builds a heap with default heuristics.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, when the address range cannot be
    /// reserved, or when pretouching is requested and a region cannot be
    /// committed.
    pub fn new(config: GcConfig) -> Result<Self> {
        let young = Box::new(StaticHeuristics::new(&config));
        Self::with_heuristics(config, young)
    }

    /// Builds a heap whose young (or, in single-generation modes, only)
    /// generation consults `heuristics`.
    ///
    /// # Errors
    ///
    /// Same as [`Heap::new`].
    pub fn with_heuristics(config: GcConfig, heuristics: Box<dyn Heuristics>) -> Result<Self> {
        config.validate()?;
        let layout = RegionLayout::setup(&config)?;
        let reservation = ReserveOptions::new()
            .len(layout.heap_size)
            .align(layout.region_size_bytes)
            .reserve()
            .map_err(|source| GcError::Reserve {
                bytes: layout.heap_size,
                source,
            })?;
        let base = reservation.ptr() as usize;
        let region_bytes = layout.region_size_bytes;
        let regions: Box<[HeapRegion]> = (0..layout.region_count)
            .map(|i| HeapRegion::new(i, base + i * region_bytes, region_bytes))
            .collect();

        let (young_capacity, old_capacity) = if config.mode.is_generational() {
            let young_regions = (layout.region_count * config.young_capacity_percent / 100).max(1);
            (
                young_regions * region_bytes,
                (layout.region_count - young_regions) * region_bytes,
            )
        } else {
            (layout.heap_size, 0)
        };
        let old_heuristics = StaticHeuristics::new(&config)
            .with_garbage_threshold(config.old_garbage_threshold_percent);
        let workers = config.effective_workers();
        let threads = ThreadRegistry::new(config.min_lab_words);
        let pool = WorkerPool::new(&threads, workers);

        let heap = Self {
            layout,
            base,
            heap_lock: Mutex::new(FreeSet::new(layout.region_count)),
            peek_free: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            cset: CollectionSet::new(layout.region_count),
            marking: MarkingContext::new(base, layout.region_size_bytes_shift, layout.region_count),
            rset: RememberedSet::new(base, layout.heap_size),
            young: Generation::new(GenerationMode::Young, young_capacity, heuristics),
            old: Generation::new(GenerationMode::Old, old_capacity, Box::new(old_heuristics)),
            global: Generation::new(
                GenerationMode::Global,
                layout.heap_size,
                Box::new(StaticHeuristics::new(&config)),
            ),
            old_gen: OldGeneration::new(workers),
            budget: EvacBudget::new(),
            evac_stats: EvacStats::default(),
            gc_state: GcState::new(),
            cancel: CancelFlag::new(),
            oom: OomEvacHandler::new(),
            threads,
            satb: SatbQueueSet::new(config.satb_buffer_size),
            mark_queues: TaskQueueSet::new(workers),
            workers: pool,
            roots: RootSet::default(),
            safepoint: RwLock::new(()),
            control: Mutex::new(ControlState::default()),
            metrics: GlobalMetrics::new(),
            gc_count: AtomicUsize::new(0),
            aging_cycle: AtomicBool::new(false),
            epoch: Instant::now(),
            regions,
            reservation,
            config,
        };

        if heap.config.always_pretouch {
            for region in heap.regions.iter() {
                heap.commit_region(region).map_err(|source| GcError::Commit {
                    region: region.index(),
                    source,
                })?;
            }
        }
        heap.rebuild_free_set();
        Ok(heap)
    }

    /// The configuration the heap was built with.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Region geometry.
    #[must_use]
    pub const fn region_layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Number of regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// The region table.
    #[must_use]
    pub fn regions(&self) -> &[HeapRegion] {
        &self.regions
    }

    /// First address of the heap.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Whether `addr` lies in the reserved range.
    #[inline]
    #[must_use]
    pub fn is_in(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.layout.heap_size
    }

    /// Index of the region holding `addr`.
    #[inline]
    #[must_use]
    pub fn region_index(&self, addr: usize) -> Option<usize> {
        self.is_in(addr)
            .then(|| self.layout.region_index_for_offset(addr - self.base))
    }

    /// The region holding `addr`.
    #[inline]
    #[must_use]
    pub fn region_for(&self, addr: usize) -> Option<&HeapRegion> {
        self.region_index(addr).map(|i| &self.regions[i])
    }

    #[inline]
    pub(crate) fn region_of(&self, obj: ObjRef) -> &HeapRegion {
        &self.regions[self.layout.region_index_for_offset(obj.addr() - self.base)]
    }

    /// Fast-path barrier test: does `addr` lie in a collection-set region?
    #[inline]
    #[must_use]
    pub fn in_collection_set(&self, addr: usize) -> bool {
        self.region_index(addr).is_some_and(|i| self.cset.contains(i))
    }

    /// Bytes allocated in all generations.
    #[must_use]
    pub fn used(&self) -> usize {
        self.young.used() + self.old.used()
    }

    /// Bytes of committed memory.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Heap size in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.layout.heap_size
    }

    /// Bytes mutators can still allocate without a collection.
    #[must_use]
    pub fn free(&self) -> usize {
        self.heap_lock.lock().available(Partition::Mutator, &self.regions)
    }

    /// Young generation (all regions in single-generation modes).
    #[must_use]
    pub const fn young(&self) -> &Generation {
        &self.young
    }

    /// Old generation capacity and usage.
    #[must_use]
    pub const fn old(&self) -> &Generation {
        &self.old
    }

    /// Whole-heap view.
    #[must_use]
    pub const fn global(&self) -> &Generation {
        &self.global
    }

    /// Old generation state and mixed candidates.
    #[must_use]
    pub const fn old_generation(&self) -> &OldGeneration {
        &self.old_gen
    }

    /// Evacuation and promotion budgets of the current cycle.
    #[must_use]
    pub const fn budget(&self) -> &EvacBudget {
        &self.budget
    }

    /// The current collection set.
    #[must_use]
    pub const fn collection_set(&self) -> &CollectionSet {
        &self.cset
    }

    /// Mark bitmap and per-region TAMS.
    #[must_use]
    pub const fn marking_context(&self) -> &MarkingContext {
        &self.marking
    }

    /// Card tables and object-start table.
    #[must_use]
    pub const fn remembered_set(&self) -> &RememberedSet {
        &self.rset
    }

    /// Persistent roots and root providers.
    #[must_use]
    pub const fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// Current GC state bits.
    #[must_use]
    pub fn gc_state(&self) -> GcStateBits {
        self.gc_state.load()
    }

    /// Whether the running cycle has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cumulative statistics.
    #[must_use]
    pub const fn metrics(&self) -> &GlobalMetrics {
        &self.metrics
    }

    /// Completed collections of any kind.
    #[must_use]
    pub fn gc_count(&self) -> usize {
        self.gc_count.load(Ordering::Acquire)
    }

    /// Number of collector workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Best-effort bound on the next TLAB, read without the heap lock.
    /// Concurrent allocation may make it stale in either direction.
    #[must_use]
    pub fn unsafe_max_tlab_alloc(&self) -> usize {
        self.peek_free
            .load(Ordering::Relaxed)
            .min(self.layout.max_lab_words * WORD_SIZE)
    }

    pub(crate) fn set_peek_free(&self, bytes: usize) {
        self.peek_free.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub(crate) const fn generation(&self, mode: GenerationMode) -> &Generation {
        match mode {
            GenerationMode::Young => &self.young,
            GenerationMode::Old => &self.old,
            GenerationMode::Global => &self.global,
        }
    }

    pub(crate) const fn generation_for(&self, affiliation: Affiliation) -> &Generation {
        match affiliation {
            Affiliation::Old => &self.old,
            _ => &self.young,
        }
    }

    /// Whether `region` belongs to the generation a `mode` cycle collects.
    #[inline]
    pub(crate) fn in_generation(region: &HeapRegion, mode: GenerationMode) -> bool {
        match mode {
            GenerationMode::Young => region.is_young(),
            GenerationMode::Old => region.is_old(),
            GenerationMode::Global => region.is_affiliated(),
        }
    }

    pub(crate) fn max_regions(&self, generation: &Generation) -> usize {
        generation.max_capacity() >> self.layout.region_size_bytes_shift
    }

    pub(crate) fn increase_used(&self, affiliation: Affiliation, bytes: usize) {
        self.generation_for(affiliation).increase_used(bytes);
        self.global.increase_used(bytes);
    }

    pub(crate) fn decrease_used(&self, affiliation: Affiliation, bytes: usize) {
        self.generation_for(affiliation).decrease_used(bytes);
        self.global.decrease_used(bytes);
    }

    /// Commits a region's memory if it is not backed yet.
    pub(crate) fn commit_region(&self, region: &HeapRegion) -> io::Result<()> {
        if region.is_committed() {
            return Ok(());
        }
        let offset = region.bottom() - self.base;
        let len = region.size_bytes();
        self.reservation.commit(offset, len)?;
        if self.config.always_pretouch {
            // SAFETY: the range was committed just above.
            unsafe { self.reservation.pretouch(offset, len) };
        }
        region.set_state(RegionState::EmptyCommitted);
        region.set_empty_since_ms(self.now_ms());
        self.committed.fetch_add(len, Ordering::AcqRel);
        Ok(())
    }

    /// Returns the memory of regions that stayed empty for longer than the
    /// configured delay. Failures are logged and the region stays
    /// committed. Returns the number of regions uncommitted.
    pub fn uncommit_empty_regions(&self) -> usize {
        if !self.config.uncommit {
            return 0;
        }
        let delay = u64::try_from(self.config.uncommit_delay.as_millis()).unwrap_or(u64::MAX);
        let now = self.now_ms();
        let _free_set = self.heap_lock.lock();
        let mut count = 0;
        for region in self.regions.iter() {
            if region.state() != RegionState::EmptyCommitted
                || region.is_affiliated()
                || now.saturating_sub(region.empty_since_ms()) < delay
            {
                continue;
            }
            let offset = region.bottom() - self.base;
            // SAFETY: an empty, unaffiliated region holds no objects and
            // cannot be allocated into while the heap lock is held.
            match unsafe { self.reservation.uncommit(offset, region.size_bytes()) } {
                Ok(()) => {
                    region.set_state(RegionState::EmptyUncommitted);
                    self.committed.fetch_sub(region.size_bytes(), Ordering::AcqRel);
                    count += 1;
                }
                Err(err) => log_commit_failure(region.index(), &err),
            }
        }
        count
    }

    /// Regions held back for evacuation: young, then old.
    fn reserve_regions(&self) -> (usize, usize) {
        let n = self.regions.len();
        let young = (n * self.config.evac_reserve_percent / 100).max(1);
        let old = if self.config.mode.is_generational() {
            (n * self.config.old_evac_reserve_percent / 100).max(1)
        } else {
            0
        };
        (young, old)
    }

    pub(crate) fn rebuild_free_set(&self) {
        let mut free_set = self.heap_lock.lock();
        self.rebuild_free_set_under_lock(&mut free_set);
    }

    pub(crate) fn rebuild_free_set_under_lock(&self, free_set: &mut FreeSet) {
        let (young, old) = self.reserve_regions();
        free_set.rebuild(
            &self.regions,
            young,
            old,
            self.config.min_lab_words * WORD_SIZE,
        );
        let peek = free_set
            .iter(Partition::Mutator)
            .map(|i| self.regions[i].free())
            .max()
            .unwrap_or(0);
        self.set_peek_free(peek);
    }

    /// Recycles one trashed region. Caller holds the heap lock or is in a
    /// pause.
    pub(crate) fn recycle_region(&self, region: &HeapRegion) {
        debug_assert!(region.is_trash());
        let affiliation = region.affiliation();
        if affiliation != Affiliation::Free {
            self.decrease_used(affiliation, region.used());
            self.generation_for(affiliation).decrement_affiliated_regions();
            self.global.decrement_affiliated_regions();
        }
        if affiliation == Affiliation::Old {
            self.rset.cards().clear_range(region.bottom(), region.end());
            self.rset.starts().clear_range(region.bottom(), region.end());
        }
        region.recycle(self.now_ms());
        self.marking.reset_tams(region);
        self.marking.clear_bitmap(region);
    }

    /// Recycles every trashed region. Returns the bytes reclaimed.
    pub(crate) fn recycle_trash(&self) -> usize {
        let mut free_set = self.heap_lock.lock();
        let mut reclaimed = 0;
        for region in self.regions.iter().filter(|r| r.is_trash()) {
            reclaimed += region.used();
            self.recycle_region(region);
            free_set.set_partition(region.index(), Partition::NotFree);
        }
        self.rebuild_free_set_under_lock(&mut free_set);
        reclaimed
    }

    /// Every thread context, mutators and workers.
    pub(crate) fn thread_contexts(&self) -> Vec<std::sync::Arc<ThreadContext>> {
        self.threads.snapshot()
    }

    /// Retires one LAB, keeping the start table and promotion budget in
    /// step with the abandoned tail.
    pub(crate) fn retire_lab(&self, lab: &mut Lab) {
        let kind = lab.kind();
        let retired = lab.retire();
        if kind != LabKind::Plab {
            return;
        }
        if let Some(filler) = retired.filler {
            self.rset.starts().register_object(filler);
        }
        if retired.allowed_promotion {
            let unused = retired.words - retired.promoted_words;
            self.budget.unexpend_promoted(unused * WORD_SIZE);
        }
    }

    /// Retires LABs of every thread. Pause only.
    pub(crate) fn retire_labs(&self, tlabs: bool, gc_labs: bool) {
        for ctx in self.thread_contexts() {
            let mut state = ctx.lock();
            if tlabs {
                self.retire_lab(&mut state.tlab);
            }
            if gc_labs {
                self.retire_lab(&mut state.gclab);
                self.retire_lab(&mut state.plab);
                let min = self.config.min_lab_words;
                state.gclab.reset_size(min);
                state.plab.reset_size(min);
            }
        }
    }

    /// Publishes every thread's partial SATB buffer. Pause only.
    pub(crate) fn flush_satb_buffers(&self) {
        for ctx in self.thread_contexts() {
            let mut state = ctx.lock();
            self.satb.flush(&mut state.satb);
        }
    }

    /// Re-derives pinned states from pin counts. Pause only.
    pub(crate) fn sync_pinned_region_status(&self) {
        let _free_set = self.heap_lock.lock();
        for region in self.regions.iter() {
            region.sync_pinned_status();
        }
    }

    /// Visits every root slot: thread handle areas, persistent handles and
    /// providers. Pause only.
    pub(crate) fn roots_do(&self, f: &mut dyn FnMut(&AtomicUsize)) {
        for ctx in self.thread_contexts() {
            let state = ctx.lock();
            state.handles.for_each(&mut *f);
        }
        self.roots.roots_do(f);
    }

    /// Recomputes generation usage from region tops. Pause only.
    pub(crate) fn recompute_usage(&self) {
        let (mut young, mut old) = ((0, 0), (0, 0));
        for region in self.regions.iter() {
            match region.affiliation() {
                Affiliation::Young => {
                    young.0 += region.used();
                    young.1 += 1;
                }
                Affiliation::Old => {
                    old.0 += region.used();
                    old.1 += 1;
                }
                Affiliation::Free => {}
            }
        }
        self.young.set_used(young.0, young.1);
        self.old.set_used(old.0, old.1);
        self.global.set_used(young.0 + old.0, young.1 + old.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcMode, REGION_SIZE_FLOOR};
    use crate::heap::alloc::AllocRequest;
    use std::time::Duration;

    fn config() -> GcConfig {
        GcConfig::default()
            .with_heap_size(2 << 20)
            .with_region_size_bounds(REGION_SIZE_FLOOR.max(sys_alloc::allocation_granularity()), 1 << 20)
            .with_target_regions(32)
            .with_parallel_workers(2)
    }

    #[test]
    fn test_new_heap_is_uncommitted() {
        let heap = Heap::new(config()).unwrap();
        assert_eq!(heap.committed(), 0);
        assert_eq!(heap.used(), 0);
        assert!(heap.regions().iter().all(|r| r.state() == RegionState::EmptyUncommitted));
        assert_eq!(heap.worker_count(), 2);
        assert_eq!(heap.old().max_capacity(), 0);
    }

    #[test]
    fn test_generational_capacity_split() {
        let heap = Heap::new(config().with_mode(GcMode::Generational)).unwrap();
        let n = heap.region_count();
        let rs = heap.region_layout().region_size_bytes;
        let young = n * 75 / 100;
        assert_eq!(heap.young().max_capacity(), young * rs);
        assert_eq!(heap.old().max_capacity(), (n - young) * rs);
    }

    #[test]
    fn test_region_lookup() {
        let heap = Heap::new(config()).unwrap();
        let last = heap.regions().last().unwrap();
        assert_eq!(heap.region_for(last.bottom()).unwrap().index(), last.index());
        assert!(heap.region_for(last.end()).is_none());
        assert!(!heap.in_collection_set(heap.base()));
    }

    #[test]
    fn test_recycle_returns_usage() {
        let heap = Heap::new(config()).unwrap();
        let mut req = AllocRequest::shared(32);
        let addr = heap.allocate_memory(&mut req).unwrap();
        let region = heap.region_for(addr).unwrap();
        assert_eq!(heap.used(), 32 * WORD_SIZE);
        region.set_state(RegionState::Trash);
        assert_eq!(heap.recycle_trash(), 32 * WORD_SIZE);
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.young().affiliated_regions(), 0);
        assert!(region.is_empty());
    }

    #[test]
    fn test_uncommit_after_delay() {
        let heap = Heap::new(config().with_uncommit(true, Duration::ZERO)).unwrap();
        let mut req = AllocRequest::shared(32);
        let addr = heap.allocate_memory(&mut req).unwrap();
        let region = heap.region_for(addr).unwrap();
        let committed = heap.committed();
        assert_eq!(committed, region.size_bytes());

        region.set_state(RegionState::Trash);
        heap.recycle_trash();
        assert_eq!(heap.uncommit_empty_regions(), 1);
        assert_eq!(heap.committed(), 0);

        let mut req = AllocRequest::shared(32);
        assert!(heap.allocate_memory(&mut req).is_some());
        assert_eq!(heap.committed(), committed);
    }
}
