//! Heap verification.
//!
//! Checks region bookkeeping, generation usage, the object graph reachable
//! from roots and, for old regions, parseability and the object-start
//! table. Runs at a pause; enabled after every cycle by `GcConfig::verify`.

use std::collections::HashSet;

use thiserror::Error;

use crate::heap::object::{ObjRef, WORD_SIZE};
use crate::heap::region::{Affiliation, RegionState};
use crate::heap::Heap;

/// A broken heap invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// Region top outside its bounds.
    #[error("region {region}: top {top:#x} outside [{bottom:#x}, {end:#x}]")]
    RegionBounds {
        /// Region index.
        region: usize,
        /// Region bottom.
        bottom: usize,
        /// Region top.
        top: usize,
        /// Region end.
        end: usize,
    },

    /// Affiliation disagrees with the region state.
    #[error("region {region}: state {state:?} with affiliation {affiliation:?}")]
    RegionAffiliation {
        /// Region index.
        region: usize,
        /// Region state.
        state: RegionState,
        /// Region affiliation.
        affiliation: Affiliation,
    },

    /// Generation accounting disagrees with region tops.
    #[error("{generation} generation accounts {accounted} bytes, regions hold {actual}")]
    Usage {
        /// Generation name.
        generation: &'static str,
        /// Bytes the generation accounts for.
        accounted: usize,
        /// Bytes between bottom and top of its regions.
        actual: usize,
    },

    /// A reference that leads nowhere valid.
    #[error("{holder:#x} references {target:#x}, which is not an object in an active region")]
    DanglingReference {
        /// Holder address, `0` for a root.
        holder: usize,
        /// Referenced address.
        target: usize,
    },

    /// A reference into a region being collected.
    #[error("{holder:#x} references {target:#x} in {state:?} region {region}")]
    CollectedRegion {
        /// Holder address, `0` for a root.
        holder: usize,
        /// Referenced address.
        target: usize,
        /// Target region.
        region: usize,
        /// Target region state.
        state: RegionState,
    },

    /// A reachable object still carries a forwarding pointer.
    #[error("reachable object {0:#x} is forwarded")]
    Forwarded(usize),

    /// An old-to-young reference the remembered set does not know about.
    #[error("old object {holder:#x} references young {target:#x} from clean card {card}")]
    CleanCard {
        /// Old holder.
        holder: usize,
        /// Young target.
        target: usize,
        /// Card of the slot.
        card: usize,
    },

    /// An old region that cannot be walked object by object.
    #[error("region {region}: object walk stops at {reached:#x}, top is {top:#x}")]
    Unparseable {
        /// Region index.
        region: usize,
        /// Where the walk ended.
        reached: usize,
        /// Region top.
        top: usize,
    },

    /// The object-start table disagrees with the objects in a card.
    #[error("card {card}: start table records {recorded:?}, first object at word {actual:?}")]
    ObjectStart {
        /// Card index.
        card: usize,
        /// Recorded first start, if any.
        recorded: Option<usize>,
        /// First start found by walking, if any.
        actual: Option<usize>,
    },
}

/// Which checks to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct VerifyOptions {
    /// Generation usage equals the sum of region usage.
    pub usage: bool,
    /// Everything reachable is a valid, unforwarded object outside the
    /// collection set.
    pub reachability: bool,
    /// Old-to-young references sit on dirty cards.
    pub cards: bool,
    /// Old regions parse and match the object-start table.
    pub old_regions: bool,
}

impl VerifyOptions {
    /// Every check, as run after a completed cycle.
    #[must_use]
    pub const fn after_cycle() -> Self {
        Self {
            usage: true,
            reachability: true,
            cards: true,
            old_regions: true,
        }
    }
}

/// What a successful verification looked at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Active regions.
    pub active_regions: usize,
    /// Objects reachable from roots.
    pub reachable_objects: usize,
    /// Bytes of reachable objects.
    pub reachable_bytes: usize,
}

/// Walks the heap and reports the first broken invariant.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verifier;

impl Verifier {
    /// Verifies `heap`. Call with mutators stopped and no cycle step in
    /// progress.
    pub fn verify(heap: &Heap, options: VerifyOptions) -> Result<VerifyReport, VerifyError> {
        let mut report = VerifyReport::default();
        Self::verify_regions(heap, &mut report)?;
        if options.usage {
            Self::verify_usage(heap)?;
        }
        if options.reachability {
            Self::verify_reachable(heap, options.cards, &mut report)?;
        }
        if options.old_regions {
            Self::verify_old_regions(heap)?;
        }
        Ok(report)
    }

    fn verify_regions(heap: &Heap, report: &mut VerifyReport) -> Result<(), VerifyError> {
        for region in heap.regions() {
            let (bottom, top, end) = (region.bottom(), region.top(), region.end());
            if top < bottom || top > end {
                return Err(VerifyError::RegionBounds {
                    region: region.index(),
                    bottom,
                    top,
                    end,
                });
            }
            let consistent = if region.is_empty() {
                !region.is_affiliated() && top == bottom
            } else {
                region.is_trash() || region.is_affiliated()
            };
            if !consistent {
                return Err(VerifyError::RegionAffiliation {
                    region: region.index(),
                    state: region.state(),
                    affiliation: region.affiliation(),
                });
            }
            if region.is_active() {
                report.active_regions += 1;
            }
        }
        Ok(())
    }

    fn verify_usage(heap: &Heap) -> Result<(), VerifyError> {
        let (mut young, mut old) = (0, 0);
        for region in heap.regions() {
            match region.affiliation() {
                Affiliation::Young => young += region.used(),
                Affiliation::Old => old += region.used(),
                Affiliation::Free => {}
            }
        }
        let checks = [
            ("young", heap.young().used(), young),
            ("old", heap.old().used(), old),
            ("global", heap.global().used(), young + old),
        ];
        for (generation, accounted, actual) in checks {
            if accounted != actual {
                return Err(VerifyError::Usage {
                    generation,
                    accounted,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Resolves a reference and checks its target.
    fn check_target(heap: &Heap, holder: usize, target: usize) -> Result<ObjRef, VerifyError> {
        let dangling = VerifyError::DanglingReference { holder, target };
        let Some(region) = heap.region_for(target) else {
            return Err(dangling);
        };
        if !region.is_active() || target >= region.top() || target % WORD_SIZE != 0 {
            return Err(dangling);
        }
        if region.is_cset() {
            return Err(VerifyError::CollectedRegion {
                holder,
                target,
                region: region.index(),
                state: region.state(),
            });
        }
        let obj = ObjRef::from_raw(target).ok_or(dangling)?;
        if obj.is_forwarded() {
            return Err(VerifyError::Forwarded(target));
        }
        if obj.layout().is_filler() || (obj.end() > region.end() && !region.is_humongous_start()) {
            return Err(VerifyError::DanglingReference { holder, target });
        }
        Ok(obj)
    }

    fn verify_reachable(
        heap: &Heap,
        cards: bool,
        report: &mut VerifyReport,
    ) -> Result<(), VerifyError> {
        let check_cards = cards && heap.config().mode.is_generational();
        let mut seen = HashSet::new();
        let mut stack = Vec::new();
        let mut error = None;
        heap.roots_do(&mut |slot| {
            let raw = slot.load(std::sync::atomic::Ordering::Acquire);
            if raw == 0 || error.is_some() {
                return;
            }
            match Self::check_target(heap, 0, raw) {
                Ok(obj) => {
                    if seen.insert(obj) {
                        stack.push(obj);
                    }
                }
                Err(err) => error = Some(err),
            }
        });
        if let Some(err) = error {
            return Err(err);
        }

        let cards_table = heap.remembered_set().cards();
        while let Some(obj) = stack.pop() {
            report.reachable_objects += 1;
            report.reachable_bytes += obj.size_bytes();
            let holder_old = heap
                .region_for(obj.addr())
                .is_some_and(|r| r.is_old());
            let mut result = Ok(());
            obj.slots(|slot_addr, slot| {
                let raw = slot.load(std::sync::atomic::Ordering::Acquire);
                if raw == 0 || result.is_err() {
                    return;
                }
                let target = match Self::check_target(heap, obj.addr(), raw) {
                    Ok(target) => target,
                    Err(err) => {
                        result = Err(err);
                        return;
                    }
                };
                if check_cards && holder_old {
                    let young = heap.region_for(raw).is_some_and(|r| r.is_young());
                    let card = cards_table.card_index(slot_addr);
                    if young && !cards_table.is_either_dirty(card) {
                        result = Err(VerifyError::CleanCard {
                            holder: obj.addr(),
                            target: raw,
                            card,
                        });
                        return;
                    }
                }
                if seen.insert(target) {
                    stack.push(target);
                }
            });
            result?;
        }
        Ok(())
    }

    fn verify_old_regions(heap: &Heap) -> Result<(), VerifyError> {
        let cards = heap.remembered_set().cards();
        let starts = heap.remembered_set().starts();
        for region in heap.regions() {
            if !region.is_old() || !region.is_regular() {
                continue;
            }
            let (bottom, top) = (region.bottom(), region.top());
            let mut first_in_card = vec![None; cards.card_index(region.end() - 1) + 1 - cards.card_index(bottom)];
            let base_card = cards.card_index(bottom);
            let mut cursor = bottom;
            while cursor < top {
                let Some(obj) = ObjRef::from_raw(cursor) else {
                    break;
                };
                let words = obj.size_words();
                if words == 0 || obj.end() > top {
                    break;
                }
                let card = cards.card_index(cursor);
                let entry = &mut first_in_card[card - base_card];
                if entry.is_none() {
                    *entry = Some((cursor - cards.card_start(card)) / WORD_SIZE);
                }
                cursor = obj.end();
            }
            if cursor != top {
                return Err(VerifyError::Unparseable {
                    region: region.index(),
                    reached: cursor,
                    top,
                });
            }
            for (n, actual) in first_in_card.into_iter().enumerate() {
                let card = base_card + n;
                let recorded = starts.starts_object(card).then(|| starts.first_start(card));
                if recorded != actual {
                    return Err(VerifyError::ObjectStart {
                        card,
                        recorded,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, GcMode, REGION_SIZE_FLOOR};
    use crate::heap::alloc::AllocRequest;
    use crate::heap::object::{init_object, ObjectShape};
    use std::sync::atomic::Ordering;

    fn heap(mode: GcMode) -> Heap {
        let config = GcConfig::default()
            .with_heap_size(4 << 20)
            .with_region_size_bounds(REGION_SIZE_FLOOR.max(sys_alloc::allocation_granularity()), 1 << 20)
            .with_target_regions(32)
            .with_parallel_workers(1)
            .with_mode(mode);
        Heap::new(config).unwrap()
    }

    fn alloc(heap: &Heap, shape: ObjectShape, affiliation: Affiliation) -> ObjRef {
        let mut req = match affiliation {
            Affiliation::Old => AllocRequest::shared_gc(shape.size_words(), Affiliation::Old, false),
            _ => AllocRequest::shared(shape.size_words()),
        };
        let addr = heap.allocate_memory(&mut req).unwrap();
        // SAFETY: fresh allocation.
        unsafe { init_object(addr, shape) }
    }

    #[test]
    fn test_consistent_heap_verifies() {
        let heap = heap(GcMode::Generational);
        let a = alloc(&heap, ObjectShape::instance(1, 0), Affiliation::Young);
        let b = alloc(&heap, ObjectShape::instance(0, 3), Affiliation::Young);
        a.ref_slot(0).store(b.addr(), Ordering::Relaxed);
        let _root = heap.roots.new_handle(a.addr());
        let report = Verifier::verify(&heap, VerifyOptions::after_cycle()).unwrap();
        assert_eq!(report.reachable_objects, 2);
        assert_eq!(report.reachable_bytes, a.size_bytes() + b.size_bytes());
    }

    #[test]
    fn test_old_to_young_reference_needs_dirty_card() {
        let heap = heap(GcMode::Generational);
        let old = alloc(&heap, ObjectShape::instance(1, 0), Affiliation::Old);
        let young = alloc(&heap, ObjectShape::instance(0, 1), Affiliation::Young);
        old.ref_slot(0).store(young.addr(), Ordering::Relaxed);
        let _root = heap.roots.new_handle(old.addr());

        let err = Verifier::verify(&heap, VerifyOptions::after_cycle()).unwrap_err();
        assert!(matches!(err, VerifyError::CleanCard { holder, .. } if holder == old.addr()));

        heap.rset.cards().dirty_write(old.ref_slot_addr(0));
        assert!(Verifier::verify(&heap, VerifyOptions::after_cycle()).is_ok());
    }

    #[test]
    fn test_reference_into_collection_set_fails() {
        let heap = heap(GcMode::Satb);
        let a = alloc(&heap, ObjectShape::instance(0, 1), Affiliation::Young);
        let _root = heap.roots.new_handle(a.addr());
        let region = heap.region_of(a);
        region.set_state(RegionState::Cset);
        let err = Verifier::verify(&heap, VerifyOptions::after_cycle()).unwrap_err();
        assert!(matches!(err, VerifyError::CollectedRegion { holder: 0, .. }));
        region.set_state(RegionState::Regular);
    }

    #[test]
    fn test_usage_mismatch_is_reported() {
        let heap = heap(GcMode::Satb);
        alloc(&heap, ObjectShape::instance(0, 1), Affiliation::Young);
        heap.young.increase_used(WORD_SIZE);
        let err = Verifier::verify(&heap, VerifyOptions::after_cycle()).unwrap_err();
        assert!(matches!(err, VerifyError::Usage { generation: "young", .. }));
    }
}
