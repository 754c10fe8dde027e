//! Per-thread collector state.
//!
//! Every mutator and every GC worker owns a [`ThreadContext`] registered in
//! the heap's [`ThreadRegistry`]. The owning thread locks its own state for
//! each operation; pauses lock every context to retire LABs, flush SATB
//! buffers and visit local handles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::gc::oom::EvacThreadState;
use crate::heap::lab::{Lab, LabKind};

/// Slots per handle block.
pub const HANDLE_BLOCK_SIZE: usize = 256;

type HandleBlock = Box<[AtomicUsize; HANDLE_BLOCK_SIZE]>;

/// Stack of root slots backing `Local` handles.
///
/// Blocks are never freed while the thread lives; truncating only moves
/// the top, so blocks are reused by later scopes.
#[derive(Debug, Default)]
pub struct HandleArea {
    blocks: Vec<HandleBlock>,
    top: usize,
}

impl HandleArea {
    /// Number of slots in use.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.top
    }

    /// Whether no slot is in use.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.top == 0
    }

    /// Pushes a slot holding `raw` and returns its index.
    pub fn push(&mut self, raw: usize) -> usize {
        let index = self.top;
        let block = index / HANDLE_BLOCK_SIZE;
        if block == self.blocks.len() {
            self.blocks
                .push(Box::new(std::array::from_fn(|_| AtomicUsize::new(0))));
        }
        self.blocks[block][index % HANDLE_BLOCK_SIZE].store(raw, Ordering::Relaxed);
        self.top += 1;
        index
    }

    /// The slot at `index`, if it is in use.
    #[inline]
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&AtomicUsize> {
        (index < self.top).then(|| &self.blocks[index / HANDLE_BLOCK_SIZE][index % HANDLE_BLOCK_SIZE])
    }

    /// Drops every slot at or above `len`.
    pub fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.top);
        self.top = len;
    }

    /// Visits every slot in use.
    pub fn for_each(&self, mut f: impl FnMut(&AtomicUsize)) {
        for index in 0..self.top {
            f(&self.blocks[index / HANDLE_BLOCK_SIZE][index % HANDLE_BLOCK_SIZE]);
        }
    }
}

/// State only the owning thread (or a pause) touches.
#[derive(Debug)]
pub struct LocalState {
    /// Mutator allocation buffer.
    pub tlab: Lab,
    /// Young evacuation buffer.
    pub gclab: Lab,
    /// Old evacuation and promotion buffer.
    pub plab: Lab,
    /// SATB entries not yet published.
    pub satb: Vec<usize>,
    /// Local handle slots.
    pub handles: HandleArea,
    /// Serial of the scope that owns the current handle slots.
    pub scope_serial: u64,
    /// Promotion failures reported during `report_epoch`.
    pub promotion_failure_reports: u8,
    /// GC epoch the report counter belongs to.
    pub report_epoch: usize,
}

impl LocalState {
    fn new(min_lab_words: usize) -> Self {
        Self {
            tlab: Lab::new(LabKind::Tlab, min_lab_words),
            gclab: Lab::new(LabKind::Gclab, min_lab_words),
            plab: Lab::new(LabKind::Plab, min_lab_words),
            satb: Vec::new(),
            handles: HandleArea::default(),
            scope_serial: 0,
            promotion_failure_reports: 0,
            report_epoch: 0,
        }
    }
}

/// Who owns a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// An attached application thread.
    Mutator,
    /// A collector worker.
    Worker,
}

/// One thread's collector state.
#[derive(Debug)]
pub struct ThreadContext {
    id: usize,
    kind: ThreadKind,
    state: Mutex<LocalState>,
    evac: EvacThreadState,
}

impl ThreadContext {
    /// Registry-unique id.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Owner kind.
    #[must_use]
    pub const fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// Locks the local state.
    pub fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock()
    }

    /// The thread's part of the evacuation OOM handshake.
    #[must_use]
    pub const fn evac(&self) -> &EvacThreadState {
        &self.evac
    }
}

impl AsRef<EvacThreadState> for ThreadContext {
    fn as_ref(&self) -> &EvacThreadState {
        &self.evac
    }
}

/// All live thread contexts.
#[derive(Debug)]
pub struct ThreadRegistry {
    contexts: Mutex<Vec<Arc<ThreadContext>>>,
    next_id: AtomicUsize,
    min_lab_words: usize,
}

impl ThreadRegistry {
    /// Empty registry whose contexts start with `min_lab_words` LABs.
    #[must_use]
    pub fn new(min_lab_words: usize) -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            min_lab_words,
        }
    }

    /// Creates and registers a context.
    pub fn register(&self, kind: ThreadKind) -> Arc<ThreadContext> {
        let ctx = Arc::new(ThreadContext {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            state: Mutex::new(LocalState::new(self.min_lab_words)),
            evac: EvacThreadState::new(),
        });
        self.contexts.lock().push(Arc::clone(&ctx));
        ctx
    }

    /// Removes a context.
    pub fn unregister(&self, ctx: &ThreadContext) {
        self.contexts.lock().retain(|c| c.id != ctx.id);
    }

    /// Snapshot of the registered contexts.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ThreadContext>> {
        self.contexts.lock().clone()
    }

    /// Number of registered contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Whether no context is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
