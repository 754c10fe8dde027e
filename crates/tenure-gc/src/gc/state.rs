//! Heap-wide GC state word and the cancellation flag.
//!
//! The state word is only changed inside pauses. Mutators copy it into
//! their scope when they enter one, so barrier fast paths test a plain
//! local value.

use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam::utils::Backoff;

/// Bitmask of collector activities visible to barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStateBits(u8);

impl GcStateBits {
    /// Collection-set objects may have forwarding pointers.
    pub const HAS_FORWARDED: Self = Self(1 << 0);
    /// Young or global marking is running.
    pub const MARKING: Self = Self(1 << 1);
    /// Concurrent evacuation is running.
    pub const EVACUATION: Self = Self(1 << 2);
    /// Concurrent reference updating is running.
    pub const UPDATE_REFS: Self = Self(1 << 3);
    /// Young marking specifically (generational mode).
    pub const YOUNG_MARKING: Self = Self(1 << 4);
    /// Old marking is running or bootstrapping.
    pub const OLD_MARKING: Self = Self(1 << 5);
    /// Weak roots still need cleaning.
    pub const WEAK_ROOTS: Self = Self(1 << 6);

    /// No activity.
    pub const IDLE: Self = Self(0);

    /// Whether any bit of `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the SATB barrier must record overwritten values.
    #[inline]
    #[must_use]
    pub const fn is_marking(self) -> bool {
        self.contains(Self::MARKING) || self.contains(Self::OLD_MARKING)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for GcStateBits {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The published state word.
#[derive(Debug, Default)]
pub struct GcState {
    bits: AtomicU8,
}

impl GcState {
    /// Idle state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
        }
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn load(&self) -> GcStateBits {
        GcStateBits(self.bits.load(Ordering::Acquire))
    }

    /// Sets or clears `flags`.
    pub fn set(&self, flags: GcStateBits, on: bool) {
        if on {
            self.bits.fetch_or(flags.0, Ordering::AcqRel);
        } else {
            self.bits.fetch_and(!flags.0, Ordering::AcqRel);
        }
    }

    /// Whether any of `flags` is set.
    #[inline]
    #[must_use]
    pub fn is(&self, flags: GcStateBits) -> bool {
        self.load().contains(flags)
    }
}

const CANCELLABLE: u8 = 0;
const CANCELLED: u8 = 1;
const NOT_CANCELLED: u8 = 2;

/// Tri-state cancellation flag.
///
/// `CANCELLABLE -> CANCELLED` poisons the rest of the cycle.
/// `CANCELLABLE -> NOT_CANCELLED -> CANCELLABLE` brackets a section that
/// must not be interrupted; cancel requests arriving meanwhile wait for it
/// to end.
#[derive(Debug, Default)]
pub struct CancelFlag {
    state: AtomicU8,
}

impl CancelFlag {
    /// New cancellable flag.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(CANCELLABLE),
        }
    }

    /// Requests cancellation. Returns `true` only for the request that
    /// moved the flag to cancelled.
    pub fn try_cancel(&self) -> bool {
        let backoff = Backoff::new();
        loop {
            match self.state.compare_exchange(
                CANCELLABLE,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(CANCELLED) => return false,
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Whether the cycle has been cancelled.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Enters an uninterruptible section. Returns `false` if the cycle was
    /// already cancelled.
    pub fn suspend(&self) -> bool {
        self.state
            .compare_exchange(CANCELLABLE, NOT_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leaves an uninterruptible section.
    pub fn resume(&self) {
        let prev = self.state.swap(CANCELLABLE, Ordering::AcqRel);
        debug_assert_eq!(prev, NOT_CANCELLED);
    }

    /// Clears cancellation. Pause only.
    pub fn clear(&self) {
        self.state.store(CANCELLABLE, Ordering::Release);
    }
}
