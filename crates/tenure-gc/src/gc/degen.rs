//! Degenerated cycles: a cancelled concurrent cycle finished at one pause.
//!
//! The pause picks up at the cancelled step's [`DegenPoint`] and runs
//! every later step without workers yielding. A degenerated cycle that
//! meets a pinned collection-set region, runs out of memory while copying,
//! or frees too little is upgraded to a full collection.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::gc::control::{ControlState, CycleRecord};
use crate::gc::marker::Marker;
use crate::gc::state::GcStateBits;
use crate::heap::generation::GenerationMode;
use crate::heap::Heap;
use crate::metrics::{CollectionType, GcMetrics};
use crate::tracing::{
    log_class_unloading, log_degenerated, log_upgrade_to_full, trace_gc_cycle, trace_phase, GcPhase,
};

/// Step from which a degenerated cycle resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DegenPoint {
    /// No cycle was running: the pause runs a whole cycle.
    OutsideCycle,
    /// Cancelled before the remembered set was scanned: marking restarts.
    Roots,
    /// Cancelled during concurrent marking.
    Mark,
    /// Cancelled during evacuation.
    Evac,
    /// Cancelled while updating references.
    UpdateRefs,
}

impl DegenPoint {
    /// Name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OutsideCycle => "outside cycle",
            Self::Roots => "roots",
            Self::Mark => "mark",
            Self::Evac => "evacuation",
            Self::UpdateRefs => "update refs",
        }
    }
}

impl Heap {
    /// Completes a cycle stop-the-world from `point`, upgrading to a full
    /// collection when it cannot finish or makes too little progress.
    pub(crate) fn degenerated_cycle(
        &self,
        control: &mut ControlState,
        mut record: CycleRecord,
        point: DegenPoint,
    ) -> GcMetrics {
        let _cycle = trace_gc_cycle("degenerated", record.mode.name(), record.gc_id);
        let _span = trace_phase(GcPhase::Degenerated);
        let _pause = self.safepoint.write();
        let start = Instant::now();
        log_degenerated(point.name());
        self.cancel.clear();
        // Degenerated cycles do not age.
        self.aging_cycle.store(false, Ordering::Release);

        let upgrade = match self.run_degenerated(control, &mut record, point) {
            Err(reason) => Some(reason),
            Ok(()) => {
                record.snapshot.snap_after(self.used(), self.free());
                let progress = record.snapshot.is_good_progress(
                    self.config.critical_free_threshold_percent,
                    self.layout.region_size_bytes,
                );
                (!progress).then_some("degenerated cycle made no progress")
            }
        };
        record.pause_time += start.elapsed();
        if let Some(reason) = upgrade {
            log_upgrade_to_full(reason);
            self.metrics.record_upgrade_to_full();
            self.heuristics().record_degenerated_upgrade_to_full();
            return self.full_collection_at_pause(control, record);
        }

        control.consecutive_degenerated += 1;
        self.heuristics().record_success_degenerated();
        if self.config.uncommit {
            self.uncommit_empty_regions();
        }
        if self.config.verify {
            self.verify_or_panic("degenerated");
        }
        record.finish(self, CollectionType::Degenerated)
    }

    fn run_degenerated(
        &self,
        control: &mut ControlState,
        record: &mut CycleRecord,
        mut point: DegenPoint,
    ) -> Result<(), &'static str> {
        let mode = record.mode;
        let young = self.config.mode.is_generational() && mode == GenerationMode::Young;
        loop {
            point = match point {
                DegenPoint::OutsideCycle => {
                    self.flush_satb_buffers();
                    record.unload_classes = self.heuristics().can_unload_classes();
                    log_class_unloading(record.unload_classes);
                    if !self.gc_state.is(GcStateBits::OLD_MARKING) {
                        self.satb.abandon();
                    }
                    if young {
                        for region in self.regions.iter().filter(|r| r.is_old()) {
                            self.rset.cards().swap_range(region.bottom(), region.end());
                        }
                    }
                    DegenPoint::Roots
                }
                DegenPoint::Roots => {
                    if young {
                        for region in self.regions.iter().filter(|r| r.is_old()) {
                            self.rset
                                .cards()
                                .merge_write_into_read(region.bottom(), region.end());
                        }
                    }
                    if self.config.mode.is_generational() && mode == GenerationMode::Global {
                        self.abandon_old_marking();
                    }
                    self.retire_labs(true, false);
                    self.start_marking(control, mode);
                    self.aging_cycle.store(false, Ordering::Release);
                    let marker = Marker::new(self, mode);
                    marker.scan_roots();
                    if young {
                        marker.scan_remembered_set(false);
                    }
                    marker.mark(false);
                    DegenPoint::Mark
                }
                DegenPoint::Mark => {
                    self.final_mark_work(record, true);
                    DegenPoint::Evac
                }
                DegenPoint::Evac => {
                    if !self.cset.is_empty() {
                        self.retire_labs(true, true);
                        self.sync_pinned_region_status();
                        let pinned = self
                            .cset
                            .regions()
                            .into_iter()
                            .any(|index| self.regions[index].is_pinned());
                        if pinned {
                            return Err("pinned region in collection set");
                        }
                        self.clear_evac_oom();
                        self.gc_state
                            .set(GcStateBits::HAS_FORWARDED | GcStateBits::EVACUATION, true);
                        if !self.evacuate_collection_set(false) {
                            return Err("out of memory during evacuation");
                        }
                    }
                    DegenPoint::UpdateRefs
                }
                DegenPoint::UpdateRefs => {
                    if !self.cset.is_empty() {
                        self.init_update_refs_work();
                        self.update_heap_references(mode, false);
                    }
                    self.final_update_refs_work();
                    return Ok(());
                }
            };
        }
    }
}
