use cellsync_logging::log_warning;
use cellsync_mem::{Block, SharedAddress, SpinWait, Step, Unit, BLOCK_SIZE};

use crate::{Error, Primitive, Result, LOG_CAT};

/// A rendezvous barrier in shared memory.
///
/// The record lives at the start of a block:
///
/// | offset | field   | type  |
/// |--------|---------|-------|
/// | 0      | `total` | `u16` |
/// | 2      | `count` | `u16` |
///
/// Every arrival atomically increments `count`, after which the caller spins with plain reads until `count` reaches `total`.
/// The barrier is single use: `count` is only reset by [`Barrier::init`] or [`Barrier::reset`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Barrier {
    addr : SharedAddress,
}

impl Barrier {
    const TOTAL_OFFSET : usize = 0;
    const COUNT_OFFSET : usize = 2;
    const RECORD_SIZE  : usize = 4;

    /// Refer to the barrier at `addr`
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not block aligned.
    #[inline]
    pub fn at(addr: SharedAddress) -> Self {
        assert!(addr.is_block_aligned(), "A barrier needs a {BLOCK_SIZE}-byte aligned address, got {addr}");
        Self { addr }
    }

    /// Get the address of the barrier
    #[inline]
    pub fn address(&self) -> SharedAddress {
        self.addr
    }

    /// Initialize the barrier for `total` participants, with nobody arrived yet.
    ///
    /// Returns [`Error::BadValue`] when `total` is 0, in which case the record is left untouched.
    pub fn init(&self, unit: &Unit, total: u16) -> Result<()> {
        if total == 0 {
            log_warning!(LOG_CAT, "Refused to initialize barrier at {} for 0 participants", self.addr);
            return Err(Error::BadValue("barrier needs at least 1 participant"));
        }
        unit.transact(self.addr, |block| {
            block.write_u16(Self::TOTAL_OFFSET, total);
            block.write_u16(Self::COUNT_OFFSET, 0);
            Step::Commit(())
        });
        Ok(())
    }

    /// Re-initialize the barrier with the number of participants it already has
    pub fn reset(&self, unit: &Unit) {
        unit.transact(self.addr, |block| {
            block.write_u16(Self::COUNT_OFFSET, 0);
            Step::Commit(())
        })
    }

    /// Arrive at the barrier, returning the number of arrivals including this one
    fn arrive(&self, unit: &Unit) -> (u16, u16) {
        unit.transact(self.addr, |block| {
            let total = block.read_u16(Self::TOTAL_OFFSET);
            let count = block.read_u16(Self::COUNT_OFFSET).wrapping_add(1);
            block.write_u16(Self::COUNT_OFFSET, count);
            Step::Commit((total, count))
        })
    }

    /// Arrive at the barrier and wait until all participants have arrived
    pub fn wait(&self, unit: &Unit) {
        let (total, count) = self.arrive(unit);
        if count < total {
            self.wait_only(unit);
        }
    }

    /// Arrive at the barrier without waiting.
    ///
    /// Returns [`Error::Retry`] when not all participants have arrived yet, in which case the caller can finish with [`Barrier::wait_only`].
    pub fn try_wait(&self, unit: &Unit) -> Result<()> {
        let (total, count) = self.arrive(unit);
        if count < total {
            Err(Error::Retry)
        } else {
            Ok(())
        }
    }

    /// Wait until all participants have arrived, without arriving.
    ///
    /// This must only be called after the caller already arrived through [`Barrier::try_wait`], otherwise it may never return.
    pub fn wait_only(&self, unit: &Unit) {
        let mut spin = SpinWait::new();
        loop {
            let (total, count) = self.read(unit);
            if count >= total {
                return;
            }
            if !spin.spin() {
                std::thread::yield_now();
            }
        }
    }

    /// Get the number of participants that arrived so far
    #[inline]
    pub fn arrived(&self, unit: &Unit) -> u16 {
        self.read(unit).1
    }

    /// Get the number of participants the barrier waits for
    #[inline]
    pub fn total(&self, unit: &Unit) -> u16 {
        self.read(unit).0
    }

    fn read(&self, unit: &Unit) -> (u16, u16) {
        let mut block = Block::zeroed();
        unit.get(self.addr, &mut block.as_bytes_mut()[..Self::RECORD_SIZE]);
        (block.read_u16(Self::TOTAL_OFFSET), block.read_u16(Self::COUNT_OFFSET))
    }
}

impl Primitive for Barrier {
    type Init = u16;

    fn storage_size(_init: &u16) -> Result<usize> {
        Ok(BLOCK_SIZE)
    }

    fn create_at(unit: &Unit, addr: SharedAddress, init: u16) -> Result<Self> {
        let barrier = Self::at(addr);
        barrier.init(unit, init)?;
        Ok(barrier)
    }

    fn address(&self) -> SharedAddress {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use cellsync_mem::{SharedRegion, SharedAddress, Unit, BLOCK_SIZE};
    use crate::Error;
    use super::Barrier;

    #[test]
    fn init_zero_is_rejected() {
        let unit = Unit::new(SharedRegion::new(BLOCK_SIZE));
        let barrier = Barrier::at(SharedAddress::ZERO);

        barrier.init(&unit, 2).unwrap();
        barrier.try_wait(&unit).unwrap_err();
        assert!(matches!(barrier.init(&unit, 0), Err(Error::BadValue(_))));
        assert_eq!(barrier.total(&unit), 2);
        assert_eq!(barrier.arrived(&unit), 1);
    }

    #[test]
    fn try_wait_then_wait_only() {
        let unit = Unit::new(SharedRegion::new(BLOCK_SIZE));
        let barrier = Barrier::at(SharedAddress::ZERO);

        barrier.init(&unit, 2).unwrap();
        assert_eq!(barrier.try_wait(&unit), Err(Error::Retry));
        assert_eq!(barrier.try_wait(&unit), Ok(()));
        barrier.wait_only(&unit);
        assert_eq!(barrier.arrived(&unit), 2);

        barrier.reset(&unit);
        assert_eq!(barrier.arrived(&unit), 0);
        assert_eq!(barrier.total(&unit), 2);
    }

    #[test]
    fn single_participant_does_not_wait() {
        let unit = Unit::new(SharedRegion::new(BLOCK_SIZE));
        let barrier = Barrier::at(SharedAddress::ZERO);
        barrier.init(&unit, 1).unwrap();
        barrier.wait(&unit);
        assert_eq!(barrier.arrived(&unit), 1);
    }
}
