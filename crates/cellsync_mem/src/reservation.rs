use core::sync::atomic::{AtomicU64, Ordering};

use crate::BLOCK_SIZE;

/// Reservation stamp of a single block.
///
/// The stamp is a version counter, with a lock bit in the LSB.
/// Every write to the block happens with the lock bit set and bumps the version when the lock is released,
/// so a unit holding a reservation on version `n` can tell whether anybody wrote the block since it was read.
#[repr(C, align(8))]
pub(crate) struct Stamp {
    value : AtomicU64,
}

impl Stamp {
    /// Lock bit position in the stamp
    pub const LOCK_BIT : u64 = 1;

    pub const fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    /// Load the raw stamp, including the lock bit
    #[inline]
    pub fn load(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Get the current version (excluding the lock bit)
    #[inline]
    pub fn version(&self) -> u64 {
        self.load() & !Self::LOCK_BIT
    }

    /// Try to lock the block if the version still matches `expected`
    #[inline]
    pub fn try_lock(&self, expected: u64) -> bool {
        self.value
            .compare_exchange(expected, expected | Self::LOCK_BIT, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Lock the block regardless of its version, spinning while another writer holds it
    #[inline]
    pub fn lock(&self) {
        loop {
            let cur = self.load();
            if cur & Self::LOCK_BIT == 0 && self.try_lock(cur) {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Unlock the block and publish a new version
    #[inline]
    pub fn unlock_and_increment(&self) {
        let cur = self.value.load(Ordering::Relaxed);
        let new = (cur & !Self::LOCK_BIT) + BLOCK_SIZE as u64;
        self.value.store(new, Ordering::Release);
    }

    /// Check if a writer currently holds the block
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.load() & Self::LOCK_BIT != 0
    }
}

/// The single reservation slot of a unit: which block is reserved and at what version
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Reservation {
    pub line    : usize,
    pub version : u64,
}

/// Handle given to a [`Backoff`](crate::Backoff) strategy to check if a reservation has been lost.
///
/// Losing a reservation is the hardware event a unit waits on: it fires as soon as any other unit writes the reserved block.
pub struct ReservationEvent<'a> {
    stamp   : &'a Stamp,
    version : u64,
}

impl<'a> ReservationEvent<'a> {
    pub(crate) fn new(stamp: &'a Stamp, version: u64) -> Self {
        Self { stamp, version }
    }

    /// Create an event that has already fired, used when there is no live reservation to wait on
    pub(crate) fn fired(stamp: &'a Stamp) -> Self {
        Self { stamp, version: u64::MAX }
    }

    /// Check whether the reservation has been lost
    #[inline]
    pub fn lost(&self) -> bool {
        self.stamp.load() != self.version
    }
}
