//! Parallel worker pool.
//!
//! Each worker owns a registered [`ThreadContext`] for its evacuation
//! LABs and OOM-evac state. A parallel phase runs one closure per worker
//! on scoped threads and returns once all of them have finished; the
//! worker's context stays locked for the duration of the phase.

use std::sync::Arc;

use crate::heap::thread_local::{LocalState, ThreadContext, ThreadKind, ThreadRegistry};

/// Fixed set of collector workers.
#[derive(Debug)]
pub struct WorkerPool {
    contexts: Vec<Arc<ThreadContext>>,
}

impl WorkerPool {
    pub(crate) fn new(registry: &ThreadRegistry, workers: usize) -> Self {
        Self {
            contexts: (0..workers.max(1))
                .map(|_| registry.register(ThreadKind::Worker))
                .collect(),
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Always `false`; a pool has at least one worker.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub(crate) fn contexts(&self) -> &[Arc<ThreadContext>] {
        &self.contexts
    }

    /// Runs `task(worker_id, context, local_state)` on every worker.
    ///
    /// With a single worker the task runs on the calling thread.
    pub(crate) fn run<F>(&self, task: F)
    where
        F: Fn(usize, &ThreadContext, &mut LocalState) + Sync,
    {
        if let [ctx] = self.contexts.as_slice() {
            let mut state = ctx.lock();
            task(0, ctx, &mut state);
            return;
        }
        std::thread::scope(|s| {
            for (id, ctx) in self.contexts.iter().enumerate() {
                let task = &task;
                s.spawn(move || {
                    let mut state = ctx.lock();
                    task(id, ctx, &mut state);
                });
            }
        });
    }
}
