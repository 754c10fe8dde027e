//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for every cycle and phase. Without the feature
//! the same functions exist as no-ops so call sites need no `cfg` guards.

/// Collector phases reported in spans and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Pause: snapshot TAMS, swap card tables, scan roots.
    InitMark,
    /// Concurrent marking.
    ConcurrentMark,
    /// Pause: drain SATB, finish marking, choose the collection set.
    FinalMark,
    /// Concurrent copying of collection-set objects.
    ConcurrentEvacuation,
    /// Pause: retire LABs and capture update watermarks.
    InitUpdateRefs,
    /// Concurrent reference rewriting.
    ConcurrentUpdateRefs,
    /// Pause: update roots and trash the collection set.
    FinalUpdateRefs,
    /// Recycle trash regions and rebuild the free set.
    Cleanup,
    /// Making old regions parseable.
    CoalesceAndFill,
    /// Concurrent old-generation marking.
    OldMark,
    /// Stop-the-world degenerated cycle.
    Degenerated,
    /// Stop-the-world compacting collection.
    Full,
}

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use super::GcPhase;

    /// Stable identifier for a GC cycle.
    ///
    /// Used to correlate all events within one cycle, including the
    /// degenerated or full cycle it may turn into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Global counter for generating unique GC IDs.
    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span guard type returned by the span constructors.
    pub type SpanGuard = span::EnteredSpan;

    /// Create a span for a whole cycle.
    pub fn trace_gc_cycle(kind: &str, generation: &str, gc_id: GcId) -> SpanGuard {
        span!(
            Level::DEBUG,
            "gc_cycle",
            kind = kind,
            generation = generation,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: GcPhase) -> SpanGuard {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a phase.
    pub fn log_phase_start(phase: GcPhase, bytes_used: usize) {
        tracing::debug!(phase = ?phase, bytes_used, "phase_start");
    }

    /// Log the end of a phase.
    pub fn log_phase_end(phase: GcPhase, bytes_used: usize) {
        tracing::debug!(phase = ?phase, bytes_used, "phase_end");
    }

    /// Log a cancellation request that won.
    pub fn log_cancel(cause: &str) {
        tracing::info!(cause, "gc_cancelled");
    }

    /// Log entry into a degenerated cycle.
    pub fn log_degenerated(point: &str) {
        tracing::info!(point, "degenerated_gc");
    }

    /// Log the class-unloading decision of a degenerated cycle.
    pub fn log_class_unloading(unload: bool) {
        tracing::debug!(unload, "class_unloading");
    }

    /// Log an escalation from degenerated to full GC.
    pub fn log_upgrade_to_full(reason: &str) {
        tracing::warn!(reason, "upgrade_to_full_gc");
    }

    /// Log a failed promotion.
    pub fn log_promotion_failure(size_words: usize, promoted_reserve: usize, promoted_expended: usize) {
        tracing::info!(
            size_words,
            promoted_reserve,
            promoted_expended,
            "promotion_failure"
        );
    }

    /// Log the first evacuation OOM of a cycle.
    pub fn log_evac_oom(size_words: usize) {
        tracing::warn!(size_words, "evacuation_oom");
    }

    /// Log a tolerated commit/uncommit failure after initialization.
    pub fn log_commit_failure(region: usize, err: &std::io::Error) {
        tracing::warn!(region, error = %err, "region_commit_failure");
    }

    /// Log the collection set chosen at final mark.
    pub fn log_collection_set(regions: usize, young_live: usize, old_live: usize, immediate: usize) {
        tracing::debug!(regions, young_live, old_live, immediate, "collection_set");
    }

    /// Log an old-generation state transition.
    pub fn log_old_transition(from: &str, to: &str) {
        tracing::debug!(from, to, "old_generation_transition");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    use super::GcPhase;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub fn next_gc_id() -> GcId {
        GcId(0)
    }

    /// Stub span guard.
    pub struct SpanGuard;

    #[inline]
    pub fn trace_gc_cycle(_kind: &str, _generation: &str, _gc_id: GcId) -> SpanGuard {
        SpanGuard
    }

    #[inline]
    pub fn trace_phase(_phase: GcPhase) -> SpanGuard {
        SpanGuard
    }

    #[inline]
    pub fn log_phase_start(_phase: GcPhase, _bytes_used: usize) {}

    #[inline]
    pub fn log_phase_end(_phase: GcPhase, _bytes_used: usize) {}

    #[inline]
    pub fn log_cancel(_cause: &str) {}

    #[inline]
    pub fn log_degenerated(_point: &str) {}

    #[inline]
    pub fn log_class_unloading(_unload: bool) {}

    #[inline]
    pub fn log_upgrade_to_full(_reason: &str) {}

    #[inline]
    pub fn log_promotion_failure(_size_words: usize, _reserve: usize, _expended: usize) {}

    #[inline]
    pub fn log_evac_oom(_size_words: usize) {}

    #[inline]
    pub fn log_commit_failure(_region: usize, _err: &std::io::Error) {}

    #[inline]
    pub fn log_collection_set(_regions: usize, _young: usize, _old: usize, _immediate: usize) {}

    #[inline]
    pub fn log_old_transition(_from: &str, _to: &str) {}
}

pub use internal::GcId;
pub(crate) use internal::*;
