//! Full collection: stop-the-world mark-compact of the whole heap.
//!
//! Live objects slide towards the bottom of the regions of their own
//! generation, in region order:
//!
//! 1. mark from roots, healing references to forwarded objects left by an
//!    interrupted evacuation;
//! 2. compute each object's destination and store it in the mark word;
//! 3. rewrite every reference and root to the destination;
//! 4. copy objects down and restore their mark words.
//!
//! Humongous and pinned regions stay in place; dead runs inside pinned
//! regions are turned into fillers.

use std::time::Instant;

use crate::gc::control::{ControlState, CycleRecord};
use crate::gc::marker::Marker;
use crate::gc::state::GcStateBits;
use crate::heap::generation::GenerationMode;
use crate::heap::object::{copy_words, MarkWord, ObjRef, WORD_SIZE};
use crate::heap::region::{Affiliation, RegionState};
use crate::heap::Heap;
use crate::metrics::{CollectionType, GcMetrics};
use crate::tracing::{log_phase_end, log_phase_start, trace_gc_cycle, trace_phase, GcPhase};

/// One object's move.
#[derive(Debug, Clone, Copy)]
struct Move {
    from: usize,
    to: usize,
    words: usize,
    age: u8,
}

/// Where every live object goes and where each compacted region ends.
#[derive(Debug, Default)]
struct CompactionPlan {
    moves: Vec<Move>,
    /// `(region, new top)` for every region that was compacted.
    tops: Vec<(usize, usize)>,
}

impl Heap {
    /// Runs a full collection at a new pause.
    pub(crate) fn full_collection(&self, control: &mut ControlState, record: CycleRecord) -> GcMetrics {
        let _pause = self.safepoint.write();
        self.full_collection_at_pause(control, record)
    }

    /// Runs a full collection. The caller holds the safepoint write lock.
    pub(crate) fn full_collection_at_pause(
        &self,
        control: &mut ControlState,
        mut record: CycleRecord,
    ) -> GcMetrics {
        let _cycle = trace_gc_cycle("full", GenerationMode::Global.name(), record.gc_id);
        let _span = trace_phase(GcPhase::Full);
        let start = Instant::now();
        log_phase_start(GcPhase::Full, self.used());
        self.cancel.clear();

        self.prepare_full();
        let marker = Marker::new(self, GenerationMode::Global).healing();
        marker.scan_roots();
        marker.mark(false);
        let plan = self.plan_compaction();
        self.adjust_references();
        self.compact(&plan);
        self.finish_full(&plan);

        control.consecutive_degenerated = 0;
        self.heuristics().record_success_full();
        log_phase_end(GcPhase::Full, self.used());
        if self.config.uncommit {
            self.uncommit_empty_regions();
        }
        if self.config.verify {
            self.verify_or_panic("full");
        }
        record.mode = GenerationMode::Global;
        record.pause_time += start.elapsed();
        record.finish(self, CollectionType::Full)
    }

    /// Abandons any cycle in flight and starts a global marking.
    fn prepare_full(&self) {
        self.retire_labs(true, true);
        self.flush_satb_buffers();
        self.satb.abandon();
        self.abandon_old_marking();
        self.old_gen.queues().clear();
        for index in self.cset.regions() {
            let region = &self.regions[index];
            match region.state() {
                RegionState::Cset => region.set_state(RegionState::Regular),
                RegionState::CsetPinned => region.set_state(RegionState::Pinned),
                _ => {}
            }
        }
        self.cset.clear();
        self.gc_state.set(
            GcStateBits::MARKING
                | GcStateBits::YOUNG_MARKING
                | GcStateBits::EVACUATION
                | GcStateBits::UPDATE_REFS
                | GcStateBits::HAS_FORWARDED,
            false,
        );
        self.sync_pinned_region_status();
        self.prepare_marking(GenerationMode::Global);
    }

    /// Assigns destinations to live objects of movable regions and stores
    /// them as forwarding pointers.
    fn plan_compaction(&self) -> CompactionPlan {
        let mut plan = CompactionPlan::default();
        for affiliation in [Affiliation::Young, Affiliation::Old] {
            let regions: Vec<usize> = self
                .regions
                .iter()
                .filter(|r| r.affiliation() == affiliation && r.state() == RegionState::Regular)
                .map(|r| r.index())
                .collect();
            let Some(&first) = regions.first() else {
                continue;
            };
            let mut dest = 0;
            let mut dest_top = self.regions[first].bottom();
            for &index in &regions {
                let region = &self.regions[index];
                self.marking.for_each_live(region, region.top(), |obj| {
                    let bytes = obj.size_bytes();
                    while dest_top + bytes > self.regions[regions[dest]].end() {
                        plan.tops.push((regions[dest], dest_top));
                        dest += 1;
                        dest_top = self.regions[regions[dest]].bottom();
                    }
                    let mark = obj.mark_word();
                    plan.moves.push(Move {
                        from: obj.addr(),
                        to: dest_top,
                        words: obj.size_words(),
                        age: mark.age(),
                    });
                    obj.set_mark_word(MarkWord::forwarded_to(dest_top));
                    dest_top += bytes;
                });
            }
            plan.tops.push((regions[dest], dest_top));
            for &index in &regions[dest + 1..] {
                plan.tops.push((index, self.regions[index].bottom()));
            }
        }
        plan
    }

    /// Points every live reference and root at its object's destination.
    fn adjust_references(&self) {
        let adjust = |slot: &std::sync::atomic::AtomicUsize| {
            let raw = slot.load(std::sync::atomic::Ordering::Relaxed);
            if let Some(obj) = ObjRef::from_raw(raw) {
                let mark = obj.mark_word();
                if mark.is_forwarded() {
                    slot.store(mark.forwardee(), std::sync::atomic::Ordering::Relaxed);
                }
            }
        };
        for region in self.regions.iter() {
            if region.is_humongous_start() {
                if let Some(obj) = ObjRef::from_raw(region.bottom()) {
                    if self.marking.is_marked(obj) {
                        obj.slots(|_, slot| adjust(slot));
                    }
                }
            } else if region.is_regular() {
                self.marking
                    .for_each_live(region, region.top(), |obj| obj.slots(|_, slot| adjust(slot)));
            }
        }
        self.roots_do(&mut |slot| adjust(slot));
    }

    /// Slides objects to their destinations and resets their mark words.
    fn compact(&self, plan: &CompactionPlan) {
        for m in &plan.moves {
            if m.from != m.to {
                // SAFETY: moves of one generation run in address order and
                // always go downwards; destinations lie in committed
                // regions below the source.
                unsafe { copy_words(m.from, m.to, m.words) };
            }
            if let Some(obj) = ObjRef::from_raw(m.to) {
                obj.set_mark_word(MarkWord::with_age(m.age));
            }
        }
        for &(index, top) in &plan.tops {
            let region = &self.regions[index];
            region.set_top(top);
            if top == region.bottom() {
                region.set_state(RegionState::Trash);
            }
        }
    }

    /// Rebuilds region, card and generation state after compaction.
    fn finish_full(&self, plan: &CompactionPlan) {
        for region in self.regions.iter() {
            if region.is_humongous_start() && region.state() == RegionState::HumongousStart {
                let marked = ObjRef::from_raw(region.bottom())
                    .is_some_and(|obj| self.marking.is_marked(obj));
                if !marked {
                    self.trash_humongous(region.index());
                }
            }
        }
        for region in self.regions.iter().filter(|r| r.is_pinned() && !r.is_humongous()) {
            self.coalesce_and_fill(region);
        }

        let cards = self.rset.cards();
        let starts = self.rset.starts();
        for region in self.regions.iter() {
            if region.is_active() {
                self.marking.reset_tams(region);
                self.marking.clear_bitmap(region);
                region.set_update_watermark(region.bottom());
                region.set_live_words(region.used() / WORD_SIZE);
            }
            if region.is_old() && !region.is_trash() {
                cards.dirty_both_range(region.bottom(), region.used());
                if region.is_regular() {
                    starts.clear_range(region.bottom(), region.end());
                    crate::gc::mark::walk_objects(region.bottom(), region.top(), |obj| {
                        starts.register_object(obj.addr());
                    });
                }
            }
        }
        debug_assert!(plan.tops.iter().all(|&(i, top)| top <= self.regions[i].end()));

        self.marking.set_young_complete(false);
        self.marking.set_old_complete(false);
        self.mark_queues.clear();
        self.budget.reset();
        self.young.unadjust_available();
        self.clear_evac_oom();
        self.cancel.clear();
        self.recycle_trash();
        self.recompute_usage();
    }
}
