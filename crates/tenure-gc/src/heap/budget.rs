//! Evacuation and promotion budgets.
//!
//! Reserves are set at final mark and zeroed when the cycle ends. Expend
//! and unexpend are plain atomic adds so they commute; the only checked
//! operation is promotion, which never lets `promoted_expended` pass
//! `promoted_reserve`.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-cycle byte budgets.
#[derive(Debug, Default)]
pub struct EvacBudget {
    young_evac_reserve: AtomicUsize,
    young_evac_expended: AtomicUsize,
    old_evac_reserve: AtomicUsize,
    old_evac_expended: AtomicUsize,
    promoted_reserve: AtomicUsize,
    promoted_expended: AtomicUsize,
    alloc_supplement_reserve: AtomicUsize,
}

macro_rules! getter {
    ($($name:ident),* $(,)?) => {
        $(
            #[doc = concat!("Current `", stringify!($name), "` in bytes.")]
            #[inline]
            #[must_use]
            pub fn $name(&self) -> usize {
                self.$name.load(Ordering::Acquire)
            }
        )*
    };
}

impl EvacBudget {
    /// All budgets zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            young_evac_reserve: AtomicUsize::new(0),
            young_evac_expended: AtomicUsize::new(0),
            old_evac_reserve: AtomicUsize::new(0),
            old_evac_expended: AtomicUsize::new(0),
            promoted_reserve: AtomicUsize::new(0),
            promoted_expended: AtomicUsize::new(0),
            alloc_supplement_reserve: AtomicUsize::new(0),
        }
    }

    getter!(
        young_evac_reserve,
        young_evac_expended,
        old_evac_reserve,
        old_evac_expended,
        promoted_reserve,
        promoted_expended,
        alloc_supplement_reserve,
    );

    /// Sets the young evacuation reserve.
    pub fn set_young_evac_reserve(&self, bytes: usize) {
        self.young_evac_reserve.store(bytes, Ordering::Release);
    }

    /// Sets the old evacuation reserve.
    pub fn set_old_evac_reserve(&self, bytes: usize) {
        self.old_evac_reserve.store(bytes, Ordering::Release);
    }

    /// Sets the promotion reserve.
    pub fn set_promoted_reserve(&self, bytes: usize) {
        self.promoted_reserve.store(bytes, Ordering::Release);
    }

    /// Sets the bytes of old reserve lent to young mutator allocation.
    pub fn set_alloc_supplement_reserve(&self, bytes: usize) {
        self.alloc_supplement_reserve.store(bytes, Ordering::Release);
    }

    /// Expends `bytes` of promotion budget if the reserve has room.
    pub fn try_expend_promoted(&self, bytes: usize) -> bool {
        let reserve = self.promoted_reserve();
        let ok = self
            .promoted_expended
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |spent| {
                spent.checked_add(bytes).filter(|&next| next <= reserve)
            })
            .is_ok();
        debug_assert!(self.promoted_expended() <= self.promoted_reserve());
        ok
    }

    /// Whether `bytes` more promotion would stay within the reserve.
    #[must_use]
    pub fn has_promotion_headroom(&self, bytes: usize) -> bool {
        self.promoted_expended() + bytes <= self.promoted_reserve()
    }

    /// Returns unused promotion budget.
    pub fn unexpend_promoted(&self, bytes: usize) {
        let prev = self.promoted_expended.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes);
    }

    /// Records young evacuation.
    pub fn expend_young_evac(&self, bytes: usize) {
        self.young_evac_expended.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Records old-to-old evacuation.
    pub fn expend_old_evac(&self, bytes: usize) {
        self.old_evac_expended.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Zeroes every budget at the end of a cycle.
    pub fn reset(&self) {
        for counter in [
            &self.young_evac_reserve,
            &self.young_evac_expended,
            &self.old_evac_reserve,
            &self.old_evac_expended,
            &self.promoted_reserve,
            &self.promoted_expended,
            &self.alloc_supplement_reserve,
        ] {
            counter.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_never_overruns() {
        let budget = EvacBudget::new();
        budget.set_promoted_reserve(1000);
        assert!(budget.try_expend_promoted(600));
        assert!(!budget.try_expend_promoted(500));
        assert!(budget.try_expend_promoted(400));
        assert!(!budget.try_expend_promoted(1));
        assert_eq!(budget.promoted_expended(), 1000);
        budget.unexpend_promoted(100);
        assert!(budget.has_promotion_headroom(100));
        assert!(!budget.has_promotion_headroom(101));
    }

    #[test]
    fn test_concurrent_promotion_stays_in_reserve() {
        let budget = EvacBudget::new();
        budget.set_promoted_reserve(10_000);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let _ = budget.try_expend_promoted(7);
                        assert!(budget.promoted_expended() <= budget.promoted_reserve());
                    }
                });
            }
        });
        assert!(budget.promoted_expended() <= 10_000);
        assert!(budget.promoted_expended() > 10_000 - 7);
    }

    #[test]
    fn test_reset() {
        let budget = EvacBudget::new();
        budget.set_young_evac_reserve(5);
        budget.expend_young_evac(3);
        budget.set_old_evac_reserve(4);
        budget.expend_old_evac(1);
        budget.reset();
        assert_eq!(budget.young_evac_reserve(), 0);
        assert_eq!(budget.young_evac_expended(), 0);
        assert_eq!(budget.old_evac_expended(), 0);
    }
}
