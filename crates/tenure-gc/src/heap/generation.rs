//! Generations: capacity and usage accounting, plus the old generation's
//! marking state machine.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::gc::heuristics::Heuristics;
use crate::gc::worklist::TaskQueueSet;
use crate::tracing::log_old_transition;

/// Which part of the heap a cycle collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationMode {
    /// Young regions only; old regions act as remembered-set roots.
    Young,
    /// Old marking, bootstrapped by a young cycle.
    Old,
    /// The whole heap.
    Global,
}

impl GenerationMode {
    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Young => "young",
            Self::Old => "old",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capacity and usage of one generation.
pub struct Generation {
    mode: GenerationMode,
    max_capacity: AtomicUsize,
    used: AtomicUsize,
    affiliated_regions: AtomicUsize,
    adjustment: AtomicIsize,
    heuristics: Box<dyn Heuristics>,
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("mode", &self.mode)
            .field("max_capacity", &self.max_capacity())
            .field("used", &self.used())
            .field("affiliated_regions", &self.affiliated_regions())
            .finish_non_exhaustive()
    }
}

impl Generation {
    pub(crate) fn new(mode: GenerationMode, max_capacity: usize, heuristics: Box<dyn Heuristics>) -> Self {
        Self {
            mode,
            max_capacity: AtomicUsize::new(max_capacity),
            used: AtomicUsize::new(0),
            affiliated_regions: AtomicUsize::new(0),
            adjustment: AtomicIsize::new(0),
            heuristics,
        }
    }

    /// Which generation this is.
    #[must_use]
    pub const fn mode(&self) -> GenerationMode {
        self.mode
    }

    /// The heuristics consulted for this generation.
    #[must_use]
    pub fn heuristics(&self) -> &dyn Heuristics {
        &*self.heuristics
    }

    /// Upper bound on bytes this generation may occupy.
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity.load(Ordering::Acquire)
    }

    /// Bytes allocated in regions of this generation.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Regions currently affiliated with this generation.
    #[must_use]
    pub fn affiliated_regions(&self) -> usize {
        self.affiliated_regions.load(Ordering::Acquire)
    }

    /// Capacity not yet used.
    #[must_use]
    pub fn available(&self) -> usize {
        self.max_capacity().saturating_sub(self.used())
    }

    /// Available capacity after the cycle's evacuation adjustment.
    #[must_use]
    pub fn adjusted_available(&self) -> usize {
        let adjusted = self.available() as isize + self.adjustment.load(Ordering::Acquire);
        usize::try_from(adjusted).unwrap_or(0)
    }

    /// Shifts available capacity by `delta` bytes for the rest of the cycle.
    pub(crate) fn adjust_available(&self, delta: isize) {
        self.adjustment.store(delta, Ordering::Release);
    }

    /// Undoes `adjust_available`.
    pub(crate) fn unadjust_available(&self) {
        self.adjustment.store(0, Ordering::Release);
    }

    pub(crate) fn increase_used(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn decrease_used(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "{} used underflow", self.mode);
    }

    pub(crate) fn set_used(&self, bytes: usize, regions: usize) {
        self.used.store(bytes, Ordering::Release);
        self.affiliated_regions.store(regions, Ordering::Release);
    }

    pub(crate) fn increment_affiliated_regions(&self) {
        self.affiliated_regions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_affiliated_regions(&self) {
        let prev = self.affiliated_regions.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}

/// Old-generation marking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldState {
    /// No old marking under way and nothing to fill.
    Idle,
    /// Dead old objects are being turned into fillers.
    Filling,
    /// The next young cycle seeds the old mark queues.
    Bootstrapping,
    /// Old marking is running (or preempted, waiting to resume).
    Marking,
    /// Mixed-collection candidates remain.
    Waiting,
}

impl OldState {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Filling => "filling",
            Self::Bootstrapping => "bootstrapping",
            Self::Marking => "marking",
            Self::Waiting => "waiting",
        }
    }

    /// Whether `self -> to` is legal. Every state may drop to `Idle` when a
    /// full or global collection abandons old marking.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use OldState::{Bootstrapping, Filling, Idle, Marking, Waiting};
        matches!(
            (self, to),
            (_, Idle)
                | (Idle | Waiting, Filling | Bootstrapping)
                | (Filling, Bootstrapping)
                | (Bootstrapping, Marking)
                | (Marking, Waiting)
        )
    }

    /// Whether the remembered set can be filtered by the old marking.
    #[must_use]
    pub const fn is_remembered_set_stable(self) -> bool {
        !matches!(self, Self::Bootstrapping | Self::Marking)
    }
}

/// Old generation bookkeeping beyond capacity accounting.
#[derive(Debug)]
pub struct OldGeneration {
    state: Mutex<OldState>,
    queues: TaskQueueSet,
    candidates: Mutex<VecDeque<usize>>,
}

impl OldGeneration {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(OldState::Idle),
            queues: TaskQueueSet::new(workers),
            candidates: Mutex::new(VecDeque::new()),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> OldState {
        *self.state.lock()
    }

    /// Moves to `to`.
    ///
    /// # Panics
    ///
    /// Panics on an illegal transition; that is a collector bug.
    pub(crate) fn transition_to(&self, to: OldState) {
        let mut state = self.state.lock();
        let from = *state;
        if from == to {
            return;
        }
        assert!(
            from.can_transition_to(to),
            "illegal old generation transition {} -> {}",
            from.name(),
            to.name()
        );
        log_old_transition(from.name(), to.name());
        *state = to;
    }

    /// The persistent old mark queues.
    #[must_use]
    pub const fn queues(&self) -> &TaskQueueSet {
        &self.queues
    }

    /// Whether young marking must feed old objects to the old queues.
    #[must_use]
    pub fn is_feeding_old_marking(&self) -> bool {
        matches!(self.state(), OldState::Bootstrapping | OldState::Marking)
    }

    /// Replaces the mixed-collection candidates, sorted by preference.
    pub(crate) fn set_candidates(&self, regions: impl IntoIterator<Item = usize>) {
        let mut candidates = self.candidates.lock();
        candidates.clear();
        candidates.extend(regions);
    }

    /// Remaining mixed-collection candidates.
    #[must_use]
    pub fn candidates(&self) -> Vec<usize> {
        self.candidates.lock().iter().copied().collect()
    }

    /// Number of remaining candidates.
    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.candidates.lock().len()
    }

    /// Takes candidates from the front while `accept` agrees.
    pub(crate) fn take_candidates(&self, mut accept: impl FnMut(usize) -> bool) -> Vec<usize> {
        let mut candidates = self.candidates.lock();
        let mut taken = Vec::new();
        while let Some(&region) = candidates.front() {
            if !accept(region) {
                break;
            }
            candidates.pop_front();
            taken.push(region);
        }
        taken
    }

    /// Drops candidates and queued old marking work.
    pub(crate) fn abandon(&self) {
        self.candidates.lock().clear();
        self.queues.clear();
    }
}
