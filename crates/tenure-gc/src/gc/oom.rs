//! Evacuation out-of-memory handshake.
//!
//! Threads that may copy objects enter a nesting-counted evacuation scope.
//! When a copy cannot be allocated, the failing thread raises the OOM bit,
//! leaves the count, and waits until every other evacuating thread has
//! left. From then on no thread copies; every one of them resolves through
//! whatever forwarding already exists. The collector notices the OOM,
//! degenerates, and re-evacuates the collection set at a pause.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

const OOM_MARKER_MASK: usize = 1 << (usize::BITS - 1);

/// Per-thread part of the handshake.
#[derive(Debug, Default)]
pub struct EvacThreadState {
    depth: AtomicUsize,
    oom_during_evac: AtomicBool,
}

impl EvacThreadState {
    /// Fresh state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            oom_during_evac: AtomicBool::new(false),
        }
    }

    /// Whether this thread saw the OOM and must not copy.
    #[inline]
    #[must_use]
    pub fn is_oom_during_evac(&self) -> bool {
        self.oom_during_evac.load(Ordering::Acquire)
    }

    /// Current scope nesting.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Heap-wide part of the handshake.
#[derive(Debug, Default)]
pub struct OomEvacHandler {
    threads_in_evac: AtomicUsize,
}

impl OomEvacHandler {
    /// No threads inside, no OOM.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            threads_in_evac: AtomicUsize::new(0),
        }
    }

    /// Whether an evacuation OOM was raised this cycle.
    #[must_use]
    pub fn is_oom(&self) -> bool {
        self.threads_in_evac.load(Ordering::Acquire) & OOM_MARKER_MASK != 0
    }

    /// Threads currently counted inside a scope.
    #[must_use]
    pub fn threads_in_evac(&self) -> usize {
        self.threads_in_evac.load(Ordering::Acquire) & !OOM_MARKER_MASK
    }

    /// Enters an evacuation scope for the current thread.
    pub fn enter(&self, thread: &EvacThreadState) {
        if thread.depth.fetch_add(1, Ordering::Relaxed) > 0 {
            return;
        }
        if thread.is_oom_during_evac() {
            return;
        }
        let mut current = self.threads_in_evac.load(Ordering::Acquire);
        loop {
            if current & OOM_MARKER_MASK != 0 {
                self.wait_for_no_evac_threads();
                thread.oom_during_evac.store(true, Ordering::Release);
                return;
            }
            match self.threads_in_evac.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Leaves the current thread's evacuation scope.
    pub fn leave(&self, thread: &EvacThreadState) {
        let prev = thread.depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unbalanced evacuation scope");
        if prev != 1 {
            return;
        }
        if !thread.is_oom_during_evac() {
            self.threads_in_evac.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Called by a thread whose copy allocation failed. Returns once no
    /// other thread can still be copying.
    pub fn handle_out_of_memory(&self, thread: &EvacThreadState) {
        debug_assert!(thread.depth() > 0);
        if thread.is_oom_during_evac() {
            return;
        }
        self.threads_in_evac.fetch_or(OOM_MARKER_MASK, Ordering::AcqRel);
        self.threads_in_evac.fetch_sub(1, Ordering::AcqRel);
        self.wait_for_no_evac_threads();
        thread.oom_during_evac.store(true, Ordering::Release);
    }

    fn wait_for_no_evac_threads(&self) {
        let backoff = Backoff::new();
        while self.threads_in_evac() != 0 {
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Clears the OOM condition. Pause only, with no thread in a scope.
    pub fn clear(&self, threads: impl IntoIterator<Item = impl AsRef<EvacThreadState>>) {
        debug_assert_eq!(self.threads_in_evac(), 0);
        self.threads_in_evac.store(0, Ordering::Release);
        for thread in threads {
            thread.as_ref().oom_during_evac.store(false, Ordering::Release);
        }
    }
}

/// RAII evacuation scope.
#[derive(Debug)]
pub struct EvacScope<'a> {
    handler: &'a OomEvacHandler,
    thread: &'a EvacThreadState,
}

impl<'a> EvacScope<'a> {
    /// Enters a scope, leaving it on drop.
    pub fn enter(handler: &'a OomEvacHandler, thread: &'a EvacThreadState) -> Self {
        handler.enter(thread);
        Self { handler, thread }
    }
}

impl Drop for EvacScope<'_> {
    fn drop(&mut self) {
        self.handler.leave(self.thread);
    }
}

impl AsRef<Self> for EvacThreadState {
    fn as_ref(&self) -> &Self {
        self
    }
}
