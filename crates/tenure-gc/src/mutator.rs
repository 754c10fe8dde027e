//! Mutator threads.
//!
//! A thread that touches the heap attaches a [`Mutator`] and works inside
//! a [`MutatorScope`]. A scope holds the safepoint lock for reading, so no
//! pause runs while it is open; long-running scopes call
//! [`MutatorScope::safepoint_poll`] to let pauses through. Objects are
//! named by [`Local`] handles that live until the scope ends. Every access
//! goes through the load-reference barrier, and reference stores through
//! the SATB (or incremental-update) and card-marking barriers.
//!
//! One thread should attach at most one mutator per heap: a scope on a
//! second mutator of the same thread can deadlock against a waiting
//! pause.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{MutexGuard, RwLockReadGuard};

use crate::config::GcMode;
use crate::error::{GcError, Result};
use crate::gc::state::GcStateBits;
use crate::heap::alloc::AllocRequest;
use crate::heap::generation::GenerationMode;
use crate::heap::object::{init_object, Layout, ObjRef, ObjectShape};
use crate::heap::thread_local::{LocalState, ThreadContext, ThreadKind};
use crate::heap::Heap;
use crate::metrics::GcMetrics;
use crate::roots::Handle;

/// Serial numbers of scopes; `0` is never handed out.
static NEXT_SCOPE_SERIAL: AtomicU64 = AtomicU64::new(1);

/// An application thread registered with a heap.
///
/// Dropping the mutator retires its allocation buffer, publishes its
/// pending SATB entries and unregisters it.
#[derive(Debug)]
pub struct Mutator<'h> {
    heap: &'h Heap,
    ctx: Arc<ThreadContext>,
    // One thread owns a mutator; scopes rely on that.
    _not_send: PhantomData<*const ()>,
}

impl Heap {
    /// Registers the calling thread as a mutator.
    pub fn attach_mutator(&self) -> Mutator<'_> {
        Mutator {
            heap: self,
            ctx: self.threads.register(ThreadKind::Mutator),
            _not_send: PhantomData,
        }
    }
}

impl<'h> Mutator<'h> {
    /// The heap this mutator is attached to.
    #[must_use]
    pub const fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Opens a scope. Blocks while a pause is running.
    pub fn scope(&mut self) -> MutatorScope<'_> {
        let guard = self.heap.safepoint.read();
        let serial = NEXT_SCOPE_SERIAL.fetch_add(1, Ordering::Relaxed);
        let base = {
            let mut state = self.ctx.lock();
            state.scope_serial = serial;
            state.handles.len()
        };
        MutatorScope {
            heap: self.heap,
            ctx: &self.ctx,
            guard,
            state: self.heap.gc_state(),
            serial,
            base,
        }
    }
}

impl Drop for Mutator<'_> {
    fn drop(&mut self) {
        let _guard = self.heap.safepoint.read();
        {
            let mut state = self.ctx.lock();
            let state = &mut *state;
            self.heap.retire_lab(&mut state.tlab);
            self.heap.retire_lab(&mut state.gclab);
            self.heap.retire_lab(&mut state.plab);
            self.heap.satb.flush(&mut state.satb);
            state.handles.truncate(0);
        }
        self.heap.threads.unregister(&self.ctx);
    }
}

/// A handle to an object, valid inside the scope that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Local {
    index: usize,
    serial: u64,
}

/// A region of mutator code during which no pause can run.
pub struct MutatorScope<'m> {
    heap: &'m Heap,
    ctx: &'m ThreadContext,
    guard: RwLockReadGuard<'m, ()>,
    state: GcStateBits,
    serial: u64,
    base: usize,
}

impl std::fmt::Debug for MutatorScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorScope")
            .field("serial", &self.serial)
            .field("base", &self.base)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for MutatorScope<'_> {
    fn drop(&mut self) {
        let mut state = self.ctx.lock();
        state.handles.truncate(self.base);
        state.scope_serial = 0;
    }
}

impl<'m> MutatorScope<'m> {
    /// The heap.
    #[must_use]
    pub const fn heap(&self) -> &'m Heap {
        self.heap
    }

    /// Lets a waiting pause run, then resumes the scope. Locals stay valid;
    /// the objects they name may have moved.
    pub fn safepoint_poll(&mut self) {
        RwLockReadGuard::bump(&mut self.guard);
        self.state = self.heap.gc_state();
    }

    /// Runs a collection of `mode` with this scope suspended.
    pub fn collect(&mut self, mode: GenerationMode) -> GcMetrics {
        let heap = self.heap;
        let metrics = RwLockReadGuard::unlocked(&mut self.guard, || heap.collect(mode));
        self.state = heap.gc_state();
        metrics
    }

    fn lock(&self) -> MutexGuard<'m, LocalState> {
        self.ctx.lock()
    }

    fn push(&self, state: &mut LocalState, obj: ObjRef) -> Local {
        Local {
            index: state.handles.push(obj.addr()),
            serial: self.serial,
        }
    }

    /// Applies the load-reference barrier to `raw`.
    fn barrier(&self, state: &mut LocalState, raw: usize) -> usize {
        if !self.state.contains(GcStateBits::HAS_FORWARDED) {
            return raw;
        }
        self.heap.load_reference_barrier(raw, self.ctx, state)
    }

    /// Reads `local`'s slot through the barrier, healing the slot.
    fn resolve(&self, state: &mut LocalState, local: Local) -> Result<ObjRef> {
        if local.serial != self.serial || local.index < self.base {
            return Err(GcError::InvalidHandle);
        }
        let raw = state
            .handles
            .slot(local.index)
            .ok_or(GcError::InvalidHandle)?
            .load(Ordering::Acquire);
        let fixed = self.barrier(state, raw);
        if fixed != raw {
            if let Some(slot) = state.handles.slot(local.index) {
                slot.store(fixed, Ordering::Release);
            }
        }
        ObjRef::from_raw(fixed).ok_or(GcError::InvalidHandle)
    }

    fn try_allocate(&self, words: usize) -> Option<usize> {
        let heap = self.heap;
        let mut state = self.lock();
        if words < heap.layout.humongous_threshold_words {
            if let Some(addr) = state.tlab.allocate(words) {
                return Some(addr);
            }
            if words * 4 <= heap.layout.max_lab_words {
                heap.retire_lab(&mut state.tlab);
                state.tlab.grow(heap.layout.max_lab_words);
                let min = words.max(heap.config.min_lab_words);
                let desired = state.tlab.desired_words().max(min);
                let mut req = AllocRequest::tlab(min, desired);
                if let Some(start) = heap.allocate_memory(&mut req) {
                    state.tlab.install(start, req.actual_words(), false);
                    return state.tlab.allocate(words);
                }
            }
        }
        drop(state);
        heap.allocate_memory(&mut AllocRequest::shared(words))
    }

    /// Allocates a zeroed object of `shape`.
    ///
    /// When the heap is exhausted the scope is suspended while the
    /// collector runs, possibly several times, before
    /// [`GcError::OutOfMemory`] is returned.
    pub fn alloc(&mut self, shape: ObjectShape) -> Result<Local> {
        if !shape.fits() {
            return Err(GcError::ShapeTooLarge("field count exceeds the header encoding"));
        }
        let words = shape.size_words();
        let heap = self.heap;
        if heap.layout.regions_for_words(words) <= heap.region_count() {
            for attempt in 0..=heap.config.full_gc_threshold {
                if let Some(addr) = self.try_allocate(words) {
                    // SAFETY: `addr` is a fresh allocation of `words` words.
                    let obj = unsafe { init_object(addr, shape) };
                    let mut state = self.lock();
                    return Ok(self.push(&mut state, obj));
                }
                RwLockReadGuard::unlocked(&mut self.guard, || heap.handle_alloc_failure(attempt));
                self.state = heap.gc_state();
            }
        }
        Err(GcError::OutOfMemory {
            requested_bytes: words * crate::heap::object::WORD_SIZE,
        })
    }

    /// Loads reference field `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a reference field of `obj`.
    pub fn load_ref(&mut self, obj: Local, index: usize) -> Result<Option<Local>> {
        let mut state = self.lock();
        let holder = self.resolve(&mut state, obj)?;
        assert!(index < holder.layout().ref_count(), "reference index {index} out of bounds");
        let slot = holder.ref_slot(index);
        let raw = slot.load(Ordering::Acquire);
        let fixed = self.barrier(&mut state, raw);
        if fixed != raw {
            let _ = slot.compare_exchange(raw, fixed, Ordering::Release, Ordering::Relaxed);
        }
        Ok(ObjRef::from_raw(fixed).map(|target| self.push(&mut state, target)))
    }

    /// Stores `value` into reference field `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a reference field of `obj`.
    pub fn store_ref(&mut self, obj: Local, index: usize, value: Option<Local>) -> Result<()> {
        let mut state = self.lock();
        let holder = self.resolve(&mut state, obj)?;
        assert!(index < holder.layout().ref_count(), "reference index {index} out of bounds");
        let new = match value {
            Some(value) => self.resolve(&mut state, value)?.addr(),
            None => 0,
        };
        let slot_addr = holder.ref_slot_addr(index);
        let slot = holder.ref_slot(index);
        let heap = self.heap;

        if heap.config.mode == GcMode::Iu {
            slot.store(new, Ordering::Release);
            if self.state.contains(GcStateBits::MARKING) && new != 0 {
                heap.satb.enqueue(&mut state.satb, new);
            }
        } else if self.state.is_marking() {
            let previous = slot.swap(new, Ordering::AcqRel);
            let record = previous != 0
                && (self.state.contains(GcStateBits::MARKING)
                    || heap.region_for(previous).is_some_and(|r| r.is_old()));
            if record {
                heap.satb.enqueue(&mut state.satb, previous);
            }
        } else {
            slot.store(new, Ordering::Release);
        }

        if heap.config.mode.is_generational() && new != 0 {
            let holder_old = heap.region_for(holder.addr()).is_some_and(|r| r.is_old());
            if holder_old && heap.region_for(new).is_some_and(|r| r.is_young()) {
                heap.rset.cards().dirty_write(slot_addr);
            }
        }
        Ok(())
    }

    fn data_index(holder: ObjRef, index: usize) {
        let data = match holder.layout() {
            Layout::Instance { data, .. } => data,
            _ => 0,
        };
        assert!(index < data, "data index {index} out of bounds");
    }

    /// Reads data word `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a data word of `obj`.
    pub fn read_data(&mut self, obj: Local, index: usize) -> Result<usize> {
        let mut state = self.lock();
        let holder = self.resolve(&mut state, obj)?;
        Self::data_index(holder, index);
        Ok(holder.data_word(index).load(Ordering::Acquire))
    }

    /// Writes data word `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a data word of `obj`.
    pub fn write_data(&mut self, obj: Local, index: usize, value: usize) -> Result<()> {
        let mut state = self.lock();
        let holder = self.resolve(&mut state, obj)?;
        Self::data_index(holder, index);
        holder.data_word(index).store(value, Ordering::Release);
        Ok(())
    }

    /// Number of reference fields of `obj`.
    pub fn ref_count(&mut self, obj: Local) -> Result<usize> {
        let mut state = self.lock();
        Ok(self.resolve(&mut state, obj)?.layout().ref_count())
    }

    /// Whether `a` and `b` name the same object.
    pub fn same_object(&mut self, a: Local, b: Local) -> Result<bool> {
        let mut state = self.lock();
        let a = self.resolve(&mut state, a)?;
        let b = self.resolve(&mut state, b)?;
        Ok(a == b)
    }

    /// Current address of `obj`. Only stable while the object is pinned.
    pub fn address(&mut self, obj: Local) -> Result<usize> {
        let mut state = self.lock();
        Ok(self.resolve(&mut state, obj)?.addr())
    }

    /// Creates a persistent root for `obj`.
    pub fn handle(&mut self, obj: Local) -> Result<Handle> {
        let mut state = self.lock();
        let obj = self.resolve(&mut state, obj)?;
        Ok(self.heap.roots.new_handle(obj.addr()))
    }

    /// Opens `handle` in this scope. Returns `None` for a null handle.
    pub fn from_handle(&mut self, handle: &Handle) -> Option<Local> {
        let mut state = self.lock();
        let slot = handle.slot();
        let raw = slot.load(Ordering::Acquire);
        let fixed = self.barrier(&mut state, raw);
        if fixed != raw {
            let _ = slot.compare_exchange(raw, fixed, Ordering::Release, Ordering::Relaxed);
        }
        ObjRef::from_raw(fixed).map(|obj| self.push(&mut state, obj))
    }

    /// Points `handle` at `value`.
    pub fn store_handle(&mut self, handle: &Handle, value: Option<Local>) -> Result<()> {
        let mut state = self.lock();
        let raw = match value {
            Some(value) => self.resolve(&mut state, value)?.addr(),
            None => 0,
        };
        handle.slot().store(raw, Ordering::Release);
        Ok(())
    }

    /// Pins `obj` so no collection moves it until the guard is dropped.
    pub fn pin(&mut self, obj: Local) -> Result<PinGuard<'m>> {
        let mut state = self.lock();
        let obj = self.resolve(&mut state, obj)?;
        PinGuard::new(self.heap, obj.addr()).ok_or(GcError::InvalidHandle)
    }
}

/// Keeps an object in place. The region is treated as pinned from the
/// next pause on.
#[derive(Debug)]
pub struct PinGuard<'h> {
    heap: &'h Heap,
    region: usize,
    addr: usize,
}

impl<'h> PinGuard<'h> {
    pub(crate) fn new(heap: &'h Heap, addr: usize) -> Option<Self> {
        let region = heap.region_index(addr)?;
        heap.regions()[region].record_pin();
        Some(Self { heap, region, addr })
    }

    /// Address of the pinned object.
    #[must_use]
    pub const fn address(&self) -> usize {
        self.addr
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.heap.regions()[self.region].record_unpin();
    }
}
