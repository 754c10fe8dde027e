//! Region allocation under the heap lock.
//!
//! Every request names its kind (LAB refill or shared), the generation it
//! targets and a minimum and desired size. LAB refills may be satisfied
//! with anything between the two; shared requests get exactly what they
//! ask for.

use crate::card::table::{CARD_SIZE, CARD_SIZE_WORDS};
use crate::heap::free_set::{FreeSet, Partition};
use crate::heap::object::{fill_with_filler, MIN_OBJ_ALIGN_WORDS, WORD_SIZE};
use crate::heap::region::{Affiliation, HeapRegion, RegionState};
use crate::heap::Heap;
use crate::tracing::log_commit_failure;

#[inline]
const fn align_to_card(addr: usize) -> usize {
    (addr + CARD_SIZE - 1) & !(CARD_SIZE - 1)
}

#[inline]
const fn align_words_to_card(words: usize) -> usize {
    (words + CARD_SIZE_WORDS - 1) & !(CARD_SIZE_WORDS - 1)
}

/// What an allocation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Mutator TLAB refill.
    Tlab,
    /// Young evacuation buffer refill.
    Gclab,
    /// Old evacuation / promotion buffer refill.
    Plab,
    /// Single mutator object outside a TLAB.
    SharedMutator,
    /// Single object copied by the collector outside a LAB.
    SharedGc,
}

/// An allocation request and, once served, its outcome.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    kind: AllocKind,
    affiliation: Affiliation,
    min_words: usize,
    words: usize,
    actual_words: usize,
    is_promotion: bool,
    promotion_allowed: bool,
}

impl AllocRequest {
    const fn new(kind: AllocKind, affiliation: Affiliation, min_words: usize, words: usize) -> Self {
        Self {
            kind,
            affiliation,
            min_words,
            words,
            actual_words: 0,
            is_promotion: false,
            promotion_allowed: false,
        }
    }

    /// TLAB refill of at least `min_words`, preferably `words`.
    #[must_use]
    pub const fn tlab(min_words: usize, words: usize) -> Self {
        Self::new(AllocKind::Tlab, Affiliation::Young, min_words, words)
    }

    /// GCLAB refill.
    #[must_use]
    pub const fn gclab(min_words: usize, words: usize) -> Self {
        Self::new(AllocKind::Gclab, Affiliation::Young, min_words, words)
    }

    /// PLAB refill. Both sizes are rounded up to whole cards.
    #[must_use]
    pub const fn plab(min_words: usize, words: usize) -> Self {
        let min_words = align_words_to_card(min_words);
        let words = align_words_to_card(words);
        Self::new(AllocKind::Plab, Affiliation::Old, min_words, words)
    }

    /// Mutator object of `words` words.
    #[must_use]
    pub const fn shared(words: usize) -> Self {
        Self::new(AllocKind::SharedMutator, Affiliation::Young, words, words)
    }

    /// Collector copy of `words` words into `affiliation`.
    #[must_use]
    pub const fn shared_gc(words: usize, affiliation: Affiliation, is_promotion: bool) -> Self {
        let mut req = Self::new(AllocKind::SharedGc, affiliation, words, words);
        req.is_promotion = is_promotion;
        req
    }

    /// Request kind.
    #[must_use]
    pub const fn kind(&self) -> AllocKind {
        self.kind
    }

    /// Target generation.
    #[must_use]
    pub const fn affiliation(&self) -> Affiliation {
        self.affiliation
    }

    /// Desired size in words.
    #[must_use]
    pub const fn words(&self) -> usize {
        self.words
    }

    /// Size actually handed out.
    #[must_use]
    pub const fn actual_words(&self) -> usize {
        self.actual_words
    }

    /// Whether a served PLAB may hold promotions.
    #[must_use]
    pub const fn promotion_allowed(&self) -> bool {
        self.promotion_allowed
    }

    /// Whether the request comes from a mutator.
    #[must_use]
    pub const fn is_mutator(&self) -> bool {
        matches!(self.kind, AllocKind::Tlab | AllocKind::SharedMutator)
    }

    /// Whether the request refills a LAB.
    #[must_use]
    pub const fn is_lab(&self) -> bool {
        matches!(self.kind, AllocKind::Tlab | AllocKind::Gclab | AllocKind::Plab)
    }
}

impl Heap {
    /// Serves `req` under the heap lock. Returns the start address.
    pub(crate) fn allocate_memory(&self, req: &mut AllocRequest) -> Option<usize> {
        let mut free_set = self.heap_lock.lock();
        self.allocate_memory_under_lock(&mut free_set, req)
    }

    pub(crate) fn allocate_memory_under_lock(
        &self,
        free_set: &mut FreeSet,
        req: &mut AllocRequest,
    ) -> Option<usize> {
        if self.config.mode.is_generational()
            && req.is_mutator()
            && req.words * WORD_SIZE >= self.young.adjusted_available()
        {
            return None;
        }

        let mut expended = 0;
        match req.kind {
            AllocKind::Plab => {
                let bytes = req.words * WORD_SIZE;
                if self.budget.try_expend_promoted(bytes) {
                    req.promotion_allowed = true;
                    expended = bytes;
                } else if self.budget.old_evac_reserve() == 0 {
                    return None;
                } else {
                    req.promotion_allowed = false;
                }
            }
            AllocKind::SharedGc if req.is_promotion => {
                let bytes = req.words * WORD_SIZE;
                if !self.budget.try_expend_promoted(bytes) {
                    return None;
                }
                expended = bytes;
            }
            _ => {}
        }

        let result = if req.kind == AllocKind::SharedMutator
            && req.words >= self.layout.humongous_threshold_words
        {
            self.allocate_contiguous(free_set, req)
        } else {
            self.allocate_single(free_set, req)
        };

        let Some(addr) = result else {
            if expended > 0 {
                self.budget.unexpend_promoted(expended);
            }
            return None;
        };
        let actual = req.actual_words * WORD_SIZE;
        if expended > actual {
            self.budget.unexpend_promoted(expended - actual);
        }
        if req.affiliation == Affiliation::Old && !req.is_lab() {
            self.rset.starts().register_object(addr);
        }
        Some(addr)
    }

    fn allocate_single(&self, free_set: &mut FreeSet, req: &mut AllocRequest) -> Option<usize> {
        let order: &[Partition] = match (req.is_mutator(), req.affiliation) {
            (true, _) => &[Partition::Mutator],
            (false, Affiliation::Old) => &[
                Partition::OldCollector,
                Partition::Collector,
                Partition::Mutator,
            ],
            (false, _) => &[Partition::Collector, Partition::Mutator],
        };

        for (step, &partition) in order.iter().enumerate() {
            let candidates: Vec<usize> = if req.is_mutator() {
                free_set.iter(partition).collect()
            } else {
                free_set.iter(partition).rev().collect()
            };
            for index in candidates {
                let region = &self.regions[index];
                let borrowed = step > 0;
                if borrowed && !(region.is_empty() && !region.is_affiliated()) {
                    continue;
                }
                if let Some(addr) = self.try_allocate_in(free_set, region, req) {
                    if borrowed && free_set.partition(index) != Partition::NotFree {
                        free_set.set_partition(index, order[0]);
                    }
                    return Some(addr);
                }
            }
        }
        None
    }

    fn try_allocate_in(
        &self,
        free_set: &mut FreeSet,
        region: &HeapRegion,
        req: &mut AllocRequest,
    ) -> Option<usize> {
        if region.is_affiliated() {
            if region.affiliation() != req.affiliation || !region.is_regular() {
                return None;
            }
        } else {
            if !region.is_empty() {
                return None;
            }
            if req.is_mutator()
                && self.config.mode.is_generational()
                && self.young.affiliated_regions() >= self.max_regions(&self.young)
            {
                return None;
            }
            if let Err(err) = self.commit_region(region) {
                log_commit_failure(region.index(), &err);
                return None;
            }
            region.set_state(RegionState::Regular);
            region.set_affiliation(req.affiliation);
            self.generation_for(req.affiliation).increment_affiliated_regions();
            self.global.increment_affiliated_regions();
        }

        let words = if req.kind == AllocKind::Plab {
            let pad = (align_to_card(region.top()) - region.top()) / WORD_SIZE;
            let room = (region.free() / WORD_SIZE).saturating_sub(pad);
            let fit = room.min(req.words) & !(CARD_SIZE_WORDS - 1);
            if fit < req.min_words {
                return None;
            }
            if pad > 0 {
                self.pad_to_card(region, pad)?;
            }
            fit
        } else if req.is_lab() {
            let fit = (region.free() / WORD_SIZE).min(req.words) & !(MIN_OBJ_ALIGN_WORDS - 1);
            if fit < req.min_words {
                return None;
            }
            fit
        } else {
            req.words
        };
        let addr = region.allocate(words)?;
        req.actual_words = words;
        self.increase_used(req.affiliation, words * WORD_SIZE);

        if region.free() < self.config.min_lab_words * WORD_SIZE {
            free_set.set_partition(region.index(), Partition::NotFree);
        }
        if req.is_mutator() {
            self.set_peek_free(region.free());
        }
        Some(addr)
    }

    /// Plugs `pad` words below the next card boundary with a registered
    /// filler. PLABs start on a card boundary so workers registering
    /// objects in a PLAB never share a start-table entry with another
    /// allocator.
    fn pad_to_card(&self, region: &HeapRegion, pad: usize) -> Option<()> {
        let filler = region.allocate(pad)?;
        // SAFETY: `filler` was just bumped out of a committed region under
        // the heap lock and `pad` is a multiple of the object alignment.
        unsafe { fill_with_filler(filler, pad) };
        self.rset.starts().register_object(filler);
        self.increase_used(region.affiliation(), pad * WORD_SIZE);
        Some(())
    }

    /// Claims a run of empty mutator regions for one humongous object.
    fn allocate_contiguous(&self, free_set: &mut FreeSet, req: &mut AllocRequest) -> Option<usize> {
        let needed = self.layout.regions_for_words(req.words);
        if needed > self.regions.len() {
            return None;
        }
        if self.config.mode.is_generational()
            && self.young.affiliated_regions() + needed > self.max_regions(&self.young)
        {
            return None;
        }

        let usable = |i: usize| {
            let r = &self.regions[i];
            free_set.partition(i) == Partition::Mutator && r.is_empty() && !r.is_affiliated()
        };
        let mut start = 0;
        let mut found = None;
        while start + needed <= self.regions.len() {
            match (start..start + needed).rev().find(|&i| !usable(i)) {
                Some(blocked) => start = blocked + 1,
                None => {
                    found = Some(start);
                    break;
                }
            }
        }
        let start = found?;

        for index in start..start + needed {
            if let Err(err) = self.commit_region(&self.regions[index]) {
                log_commit_failure(index, &err);
                return None;
            }
        }

        let mut remaining = req.words * WORD_SIZE;
        for (n, index) in (start..start + needed).enumerate() {
            let region = &self.regions[index];
            region.set_state(if n == 0 {
                RegionState::HumongousStart
            } else {
                RegionState::HumongousCont
            });
            region.set_affiliation(Affiliation::Young);
            let here = remaining.min(region.size_bytes());
            region.set_top(region.bottom() + here);
            remaining -= here;
            free_set.set_partition(index, Partition::NotFree);
            self.young.increment_affiliated_regions();
            self.global.increment_affiliated_regions();
        }
        req.actual_words = req.words;
        self.increase_used(Affiliation::Young, req.words * WORD_SIZE);
        Some(self.regions[start].bottom())
    }
}
