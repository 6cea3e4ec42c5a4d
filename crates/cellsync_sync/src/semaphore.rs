use cellsync_logging::log_warning;
use cellsync_mem::{SharedAddress, Step, Unit, BLOCK_SIZE};

use crate::{AtomicCell, Error, Primitive, Result, LOG_CAT};

/// A counting semaphore in shared memory.
///
/// The count is an [`AtomicCell`], `wait` only ever commits a decrement of a count that is at least 1, so the count never goes negative.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Semaphore {
    cell : AtomicCell,
}

impl Semaphore {
    /// Refer to the semaphore at `addr`
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not 4-byte aligned.
    #[inline]
    pub fn at(addr: SharedAddress) -> Self {
        Self { cell: AtomicCell::at(addr) }
    }

    /// Get the address of the semaphore
    #[inline]
    pub fn address(&self) -> SharedAddress {
        self.cell.address()
    }

    /// Set the initial count
    #[inline]
    pub fn init(&self, unit: &Unit, val: i32) {
        self.cell.init(unit, val);
    }

    /// Increment the count by 1
    #[inline]
    pub fn post(&self, unit: &Unit) {
        self.cell.inc(unit);
    }

    /// Increment the count by `n` in a single update.
    ///
    /// Returns [`Error::BadValue`] when the count would no longer fit in an `i32`, in which case the count is left untouched.
    pub fn post_n(&self, unit: &Unit, n: u32) -> Result<()> {
        let Ok(n) = i32::try_from(n) else {
            log_warning!(LOG_CAT, "Refused to post {} to semaphore at {}", n, self.address());
            return Err(Error::BadValue("semaphore post count does not fit in an i32"));
        };

        let old = self.cell.update(unit, |old| old.checked_add(n));
        if old.checked_add(n).is_none() {
            log_warning!(LOG_CAT, "Refused to post {} to semaphore at {}, the count would overflow", n, self.address());
            return Err(Error::BadValue("semaphore count would overflow"));
        }
        Ok(())
    }

    /// Decrement the count, waiting until it is at least 1
    pub fn wait(&self, unit: &Unit) {
        let offset = self.address().block_offset();
        unit.transact(self.address().align_down(), |block| {
            let val = block.read_i32(offset);
            if val >= 1 {
                block.write_i32(offset, val - 1);
                Step::Commit(())
            } else {
                Step::Wait
            }
        })
    }

    /// Decrement the count if it is at least 1, otherwise return [`Error::Retry`]
    pub fn try_wait(&self, unit: &Unit) -> Result<()> {
        let offset = self.address().block_offset();
        unit.transact(self.address().align_down(), |block| {
            let val = block.read_i32(offset);
            if val >= 1 {
                block.write_i32(offset, val - 1);
                Step::Commit(Ok(()))
            } else {
                Step::Done(Err(Error::Retry))
            }
        })
    }

    /// Get the current count
    #[inline]
    pub fn value(&self, unit: &Unit) -> i32 {
        self.cell.get(unit)
    }
}

impl Primitive for Semaphore {
    type Init = i32;

    fn storage_size(_init: &i32) -> Result<usize> {
        Ok(BLOCK_SIZE)
    }

    fn create_at(unit: &Unit, addr: SharedAddress, init: i32) -> Result<Self> {
        let sem = Self::at(addr);
        sem.init(unit, init);
        Ok(sem)
    }

    fn address(&self) -> SharedAddress {
        self.cell.address()
    }
}
