//! Work-stealing queues for parallel marking.
//!
//! Each worker owns a bounded Chase-Lev deque. Pushes that find the deque
//! full spill into a shared overflow pool, and idle workers steal from the
//! other deques before offering termination.

use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;
use crossbeam_queue::SegQueue;

use crate::heap::object::ObjRef;

/// Capacity of each worker deque.
pub const TASK_QUEUE_SIZE: usize = 1 << 13;

const ADDR_BITS: u32 = 49;
const POW_BITS: u32 = 5;
const CHUNK_BITS: u32 = 10;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;
const POW_MASK: u64 = (1 << POW_BITS) - 1;
const CHUNK_MASK: u64 = (1 << CHUNK_BITS) - 1;

/// Largest chunk number a task can carry.
pub const MAX_CHUNK: usize = (1 << CHUNK_BITS) - 1;

/// A marking task packed into one word: object address, plus an array
/// chunk number and power when the task covers part of a reference array.
/// Chunk `0` means the whole object.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MarkTask(u64);

impl MarkTask {
    /// Task scanning the whole object.
    #[inline]
    #[must_use]
    pub fn object(obj: ObjRef) -> Self {
        debug_assert!((obj.addr() as u64) <= ADDR_MASK);
        Self(obj.addr() as u64)
    }

    /// Task scanning elements `[(chunk - 1) << pow, chunk << pow)`.
    #[inline]
    #[must_use]
    pub fn array_chunk(obj: ObjRef, chunk: usize, pow: u32) -> Self {
        debug_assert!(chunk > 0 && chunk <= MAX_CHUNK);
        debug_assert!(u64::from(pow) <= POW_MASK);
        Self(
            obj.addr() as u64
                | (u64::from(pow) << ADDR_BITS)
                | ((chunk as u64) << (ADDR_BITS + POW_BITS)),
        )
    }

    /// The object.
    #[inline]
    #[must_use]
    pub fn obj(self) -> ObjRef {
        ObjRef::from_raw((self.0 & ADDR_MASK) as usize)
            .unwrap_or_else(|| unreachable!("mark tasks never hold null"))
    }

    /// Chunk number, `0` for whole-object tasks.
    #[inline]
    #[must_use]
    pub const fn chunk(self) -> usize {
        ((self.0 >> (ADDR_BITS + POW_BITS)) & CHUNK_MASK) as usize
    }

    /// log2 of the chunk length.
    #[inline]
    #[must_use]
    pub const fn pow(self) -> u32 {
        ((self.0 >> ADDR_BITS) & POW_MASK) as u32
    }

    #[inline]
    const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for MarkTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkTask")
            .field("obj", &format_args!("{:#x}", self.0 & ADDR_MASK))
            .field("chunk", &self.chunk())
            .field("pow", &self.pow())
            .finish()
    }
}

/// Lock-free work stealing deque.
///
/// Based on: "Simple and Efficient Work-Stealing Queues for Parallel Programming"
/// by Chase and Lev (2005), with the fences of the C11 formulation by Lê et al.
///
/// The owner pushes and pops at `bottom` (LIFO); thieves take from `top`
/// (FIFO). Slots are atomic words so a thief racing with the owner's
/// wrap-around never reads a torn value.
///
/// # Invariants
///
/// - `N` must be a power of 2
/// - Only the owning worker calls `push` and `pop`
/// - Queue is empty when `bottom == top`
/// - Size is always `bottom - top` (modulo arithmetic)
#[derive(Debug)]
pub struct StealQueue<const N: usize = TASK_QUEUE_SIZE> {
    slots: Box<[AtomicU64]>,
    bottom: AtomicUsize,
    top: AtomicUsize,
}

impl<const N: usize> Default for StealQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> StealQueue<N> {
    const MASK: usize = N - 1;

    /// Create a new steal queue.
    ///
    /// # Panics
    ///
    /// Panics if `N` is not a power of 2.
    #[must_use]
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "StealQueue size N must be a power of 2");
        Self {
            slots: (0..N).map(|_| AtomicU64::new(0)).collect(),
            bottom: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
        }
    }

    /// Push at the owner's end. Hands the task back if the deque is full.
    ///
    /// # Errors
    ///
    /// Returns the task when no slot is free.
    pub fn push(&self, task: MarkTask) -> Result<(), MarkTask> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b.wrapping_sub(t) >= N {
            return Err(task);
        }
        self.slots[b & Self::MASK].store(task.raw(), Ordering::Relaxed);
        // Publish the slot before the new bottom becomes visible to thieves.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop at the owner's end.
    pub fn pop(&self) -> Option<MarkTask> {
        let b = self.bottom.load(Ordering::Relaxed).wrapping_sub(1);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        let size = b.wrapping_sub(t).cast_signed();
        if size < 0 {
            self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        let raw = self.slots[b & Self::MASK].load(Ordering::Relaxed);
        if size > 0 {
            return Some(MarkTask(raw));
        }

        // Last element: race thieves for it.
        let won = self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
        won.then_some(MarkTask(raw))
    }

    /// Steal from the far end. May fail spuriously under contention.
    pub fn steal(&self) -> Option<MarkTask> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if b.wrapping_sub(t).cast_signed() <= 0 {
            return None;
        }
        let raw = self.slots[t & Self::MASK].load(Ordering::Relaxed);
        self.top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| MarkTask(raw))
    }

    /// Approximate number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        usize::try_from(b.wrapping_sub(t).cast_signed().max(0)).unwrap_or(0)
    }

    /// Whether the deque looks empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One deque per worker plus a shared overflow pool.
#[derive(Debug)]
pub struct TaskQueueSet {
    queues: Box<[StealQueue]>,
    overflow: SegQueue<MarkTask>,
}

impl TaskQueueSet {
    /// Creates `workers` empty deques.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            queues: (0..workers.max(1)).map(|_| StealQueue::new()).collect(),
            overflow: SegQueue::new(),
        }
    }

    /// Number of deques.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Push onto `worker`'s deque, spilling to the overflow pool when full.
    #[inline]
    pub fn push(&self, worker: usize, task: MarkTask) {
        if let Err(task) = self.queues[worker].push(task) {
            self.overflow.push(task);
        }
    }

    /// Pop from `worker`'s deque, then from the overflow pool.
    #[inline]
    pub fn pop(&self, worker: usize) -> Option<MarkTask> {
        self.queues[worker].pop().or_else(|| self.overflow.pop())
    }

    /// Steal from any other worker, starting after `worker`.
    pub fn steal(&self, worker: usize) -> Option<MarkTask> {
        let n = self.queues.len();
        (1..n)
            .map(|i| (worker + i) % n)
            .find_map(|victim| self.queues[victim].steal())
            .or_else(|| self.overflow.pop())
    }

    /// Whether every deque and the overflow pool look empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.overflow.is_empty() && self.queues.iter().all(StealQueue::is_empty)
    }

    /// Approximate total of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.overflow.len() + self.queues.iter().map(StealQueue::len).sum::<usize>()
    }

    /// Drops every queued task. Pause only.
    pub fn clear(&self) {
        for worker in 0..self.queues.len() {
            while self.queues[worker].pop().is_some() {}
        }
        while self.overflow.pop().is_some() {}
    }
}

/// Cooperative termination: workers that run dry offer termination and
/// either see every worker idle or find new work and go back to stealing.
#[derive(Debug)]
pub struct TaskTerminator {
    workers: usize,
    idle: AtomicUsize,
}

impl TaskTerminator {
    /// Terminator for `workers` participants.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            idle: AtomicUsize::new(0),
        }
    }

    /// Returns `true` when the caller should stop: every worker is idle
    /// with no queued work, or `should_exit` reports cancellation. Returns
    /// `false` when work reappeared.
    pub fn offer_termination(&self, queues: &TaskQueueSet, should_exit: impl Fn() -> bool) -> bool {
        self.idle.fetch_add(1, Ordering::SeqCst);
        let backoff = Backoff::new();
        loop {
            if self.idle.load(Ordering::SeqCst) >= self.workers || should_exit() {
                return true;
            }
            if !queues.is_empty() {
                self.idle.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}
