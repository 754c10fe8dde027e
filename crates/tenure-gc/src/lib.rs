//! A region-based, generational, concurrent evacuating garbage collector.
//!
//! `tenure-gc` manages a heap of equally sized regions. Live objects are
//! found by concurrent snapshot-at-the-beginning (or incremental-update)
//! marking and copied out of sparse regions while mutators keep running;
//! a load-reference barrier makes every thread see the copy. Cycles that
//! cannot keep up are finished stop-the-world (a *degenerated* cycle), and
//! as a last resort the heap is compacted in place by a full collection.
//!
//! In generational mode regions belong to a young or an old generation.
//! Objects that survive enough young collections are promoted, a card
//! table remembers old-to-young references, and old regions are marked
//! concurrently between young cycles and collected in mixed collections.
//!
//! # Quick Start
//!
//! ```no_run
//! use tenure_gc::{GcConfig, GcMode, GenerationMode, Heap, ObjectShape};
//!
//! let heap = Heap::new(GcConfig::default().with_mode(GcMode::Generational))?;
//! let mut mutator = heap.attach_mutator();
//!
//! let root = {
//!     let mut scope = mutator.scope();
//!     let list = scope.alloc(ObjectShape::ref_array(16))?;
//!     for i in 0..16 {
//!         let cell = scope.alloc(ObjectShape::instance(0, 1))?;
//!         scope.write_data(cell, 0, i)?;
//!         scope.store_ref(list, i, Some(cell))?;
//!     }
//!     scope.handle(list)?
//! };
//!
//! let mut scope = mutator.scope();
//! scope.collect(GenerationMode::Young);
//! let list = scope.from_handle(&root).expect("rooted");
//! let cell = scope.load_ref(list, 3)?.expect("stored");
//! assert_eq!(scope.read_data(cell, 0)?, 3);
//! # Ok::<(), tenure_gc::GcError>(())
//! ```
//!
//! # Threads
//!
//! [`Heap`] is `Sync`. Every thread that touches objects attaches its own
//! [`Mutator`]; a mutator and its locals stay on that thread. Collector
//! pauses wait for every open [`MutatorScope`] to reach a safepoint.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod card;
pub mod config;
mod error;
pub mod gc;
mod metrics;
mod mutator;
mod roots;
mod tracing;
mod workers;

/// Region table, allocation and object layout.
///
/// This module is public for testing and advanced use cases.
/// Most users should go through [`Heap`] and [`Mutator`].
pub mod heap;

// Re-export public API
pub use config::{GcConfig, GcMode};
pub use error::{GcError, Result};
pub use gc::control::ConcurrentCycle;
pub use gc::degen::DegenPoint;
pub use gc::heuristics::{
    CollectionSetBudget, GenerationStats, Heuristics, RegionData, StaticHeuristics,
};
pub use gc::state::GcStateBits;
pub use gc::verifier::{Verifier, VerifyError, VerifyOptions, VerifyReport};
pub use heap::generation::{GenerationMode, OldState};
pub use heap::object::ObjectShape;
pub use heap::region::{Affiliation, RegionState};
pub use heap::Heap;
pub use metrics::{CollectionType, GcMetrics, GlobalMetrics, MetricsSnapshot};
pub use mutator::{Local, Mutator, MutatorScope, PinGuard};
pub use roots::{Handle, RootProvider};
pub use crate::tracing::{GcId, GcPhase};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
#[allow(clippy::missing_panics_doc)]
pub mod test_util {
    use std::sync::atomic::Ordering;

    use crate::heap::alloc::AllocRequest;
    use crate::heap::object::{init_object, ObjRef};
    use crate::{Affiliation, GcConfig, GcMode, Handle, Heap, ObjectShape, PinGuard};

    /// A verifying 4 MiB heap of 32 regions with two workers.
    pub fn small_config(mode: GcMode) -> GcConfig {
        GcConfig::default()
            .with_heap_size(4 << 20)
            .with_region_size_bounds(
                crate::config::REGION_SIZE_FLOOR.max(sys_alloc::allocation_granularity()),
                1 << 20,
            )
            .with_target_regions(32)
            .with_parallel_workers(2)
            .with_mode(mode)
            .with_verify(true)
    }

    /// Roots `count` objects with data words `(i, !i)`, followed by a dead
    /// object half a region long, so their region is mostly garbage.
    pub fn sparse_objects(heap: &Heap, count: usize) -> Vec<Handle> {
        let mut mutator = heap.attach_mutator();
        let mut scope = mutator.scope();
        let roots = (0..count)
            .map(|i| {
                let obj = scope.alloc(ObjectShape::instance(0, 2)).expect("heap has room");
                scope.write_data(obj, 0, i).expect("live local");
                scope.write_data(obj, 1, !i).expect("live local");
                scope.handle(obj).expect("live local")
            })
            .collect();
        let dead = heap.region_layout().region_size_words / 2;
        scope.alloc(ObjectShape::instance(0, dead)).expect("heap has room");
        roots
    }

    /// Allocates `regions` regions' worth of unreachable quarter-region
    /// objects.
    pub fn garbage_regions(heap: &Heap, regions: usize) {
        let mut mutator = heap.attach_mutator();
        let mut scope = mutator.scope();
        let words = heap.region_layout().region_size_words / 4 - crate::heap::object::HEADER_WORDS;
        for _ in 0..regions * 4 {
            scope.alloc(ObjectShape::instance(0, words)).expect("heap has room");
        }
    }

    /// Checks that every handle from [`sparse_objects`] still sees its data.
    pub fn assert_sparse_intact(heap: &Heap, roots: &[Handle]) {
        let mut mutator = heap.attach_mutator();
        let mut scope = mutator.scope();
        for (i, root) in roots.iter().enumerate() {
            let obj = scope.from_handle(root).expect("rooted");
            assert_eq!(scope.read_data(obj, 0).expect("live local"), i, "object {i}");
            assert_eq!(scope.read_data(obj, 1).expect("live local"), !i, "object {i}");
        }
    }

    /// Address a handle currently refers to, without any barrier.
    pub fn handle_address(handle: &Handle) -> usize {
        handle.slot().load(Ordering::Acquire)
    }

    /// Requests cancellation of the running cycle, as an allocation
    /// failure would.
    pub fn cancel(heap: &Heap) -> bool {
        heap.cancel.try_cancel()
    }

    /// Allocates an object directly in `affiliation`'s regions and roots
    /// it. Returns `None` when no region can hold it.
    pub fn alloc_rooted(heap: &Heap, shape: ObjectShape, affiliation: Affiliation) -> Option<Handle> {
        let mut req = match affiliation {
            Affiliation::Old => AllocRequest::shared_gc(shape.size_words(), Affiliation::Old, false),
            _ => AllocRequest::shared(shape.size_words()),
        };
        let addr = heap.allocate_memory(&mut req)?;
        // SAFETY: `addr` is a fresh allocation of the shape's size.
        let obj = unsafe { init_object(addr, shape) };
        Some(heap.roots.new_handle(obj.addr()))
    }

    /// Pins the object `handle` refers to where it currently is, even when
    /// that is inside the collection set.
    pub fn pin_in_place<'h>(heap: &'h Heap, handle: &Handle) -> Option<PinGuard<'h>> {
        PinGuard::new(heap, handle_address(handle))
    }

    /// Address of reference field `index` of the object at `addr`.
    pub fn ref_slot_address(addr: usize, index: usize) -> usize {
        ObjRef::from_raw(addr).map_or(0, |obj| obj.ref_slot_addr(index))
    }

    /// Forwardee of the object at `addr`, if it has been copied.
    pub fn forwardee(addr: usize) -> Option<usize> {
        let obj = ObjRef::from_raw(addr)?;
        obj.is_forwarded().then(|| obj.resolve_forwarded().addr())
    }

    /// Age recorded in the header of the object at `addr`.
    pub fn object_age(addr: usize) -> u8 {
        ObjRef::from_raw(addr).map_or(0, |obj| obj.mark_word().age())
    }

    /// Reads reference field `index` of the object at `addr`.
    pub fn ref_at(addr: usize, index: usize) -> usize {
        ObjRef::from_raw(addr).map_or(0, |obj| obj.ref_slot(index).load(Ordering::Acquire))
    }

    /// Writes reference field `index` of the object at `addr` with no
    /// barrier. Callers dirty cards themselves.
    pub fn set_ref(addr: usize, index: usize, target: usize) {
        if let Some(obj) = ObjRef::from_raw(addr) {
            obj.ref_slot(index).store(target, Ordering::Release);
        }
    }

    /// Reads data word `index` of the object at `addr`.
    pub fn data_at(addr: usize, index: usize) -> usize {
        ObjRef::from_raw(addr).map_or(0, |obj| obj.data_word(index).load(Ordering::Acquire))
    }

    /// Writes data word `index` of the object at `addr`.
    pub fn set_data(addr: usize, index: usize, value: usize) {
        if let Some(obj) = ObjRef::from_raw(addr) {
            obj.data_word(index).store(value, Ordering::Release);
        }
    }

    /// A whole-object mark task for `addr`, which must not be `0`. The
    /// address is never dereferenced by the queues.
    pub fn mark_task(addr: usize) -> crate::gc::worklist::MarkTask {
        let obj = ObjRef::from_raw(addr).unwrap_or_else(|| panic!("mark task for a null address"));
        crate::gc::worklist::MarkTask::object(obj)
    }
}
