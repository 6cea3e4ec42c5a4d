use core::fmt;
use cellsync_mem::{Block, SharedAddress, Step, Unit, BLOCK_SIZE};

use crate::{AtomicCell, Error, Primitive, Result};

/// Basic operations of a lock living in shared memory.
///
/// Types implementing this trait can be paired with a [`Condvar`](crate::Condvar), which releases and reacquires the lock while it waits.
/// Implementations must ensure that the lock is actually exclusive: it can't be acquired while it is already held, by any unit.
pub trait RemoteLock {
    /// Acquire the lock, spinning until it is able to do so
    fn lock(&self, unit: &Unit);

    /// Attempts to acquire the lock without spinning.
    /// Returns `true` if the lock was successfully acquired and `false` otherwise.
    fn try_lock(&self, unit: &Unit) -> bool;

    /// Release the lock.
    ///
    /// This may only be called by the unit currently holding the lock.
    fn unlock(&self, unit: &Unit);

    /// Checks whether the lock is currently held.
    #[inline]
    fn is_locked(&self, unit: &Unit) -> bool {
        let acquired_lock = self.try_lock(unit);
        if acquired_lock {
            self.unlock(unit);
        }
        !acquired_lock
    }
}

/// A binary lock in shared memory.
///
/// The lock is a single 32-bit flag (0 = free, 1 = held), which can live anywhere in a block as long as it is 4-byte aligned.
/// Acquiring it goes directly through the reservation: the block is reserved, and the flag is only committed if it was 0,
/// otherwise the unit waits until the block changes and tries again.
///
/// The lock is not reentrant, and makes no fairness guarantees: any contender may win a given round.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RemoteMutex {
    addr : SharedAddress,
}

impl RemoteMutex {
    const HELD : u32 = 1;
    const FREE : u32 = 0;

    /// Refer to the lock at `addr`
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not 4-byte aligned.
    #[inline]
    pub fn at(addr: SharedAddress) -> Self {
        assert!(addr.is_aligned_to(4), "A lock needs a 4-byte aligned address, got {addr}");
        Self { addr }
    }

    /// Get the address of the lock
    #[inline]
    pub fn address(&self) -> SharedAddress {
        self.addr
    }

    /// Initialize the lock as free
    pub fn init(&self, unit: &Unit) {
        AtomicCell::at(self.addr).init(unit, Self::FREE as i32);
    }

    /// Acquire the lock and return the content of the block it lives in.
    ///
    /// While the lock is held nobody else writes the block, so the returned copy stays current until [`RemoteMutex::store_unlock`].
    pub(crate) fn lock_fetch(&self, unit: &Unit) -> Block {
        let offset = self.addr.block_offset();
        unit.transact(self.addr.align_down(), |block| {
            if block.read_u32(offset) == Self::FREE {
                block.write_u32(offset, Self::HELD);
                Step::Commit(*block)
            } else {
                Step::Wait
            }
        })
    }

    /// Write back the block the lock lives in, releasing the lock in the same transfer
    pub(crate) fn store_unlock(&self, unit: &Unit, mut block: Block) {
        debug_assert!(block.read_u32(self.addr.block_offset()) == Self::HELD, "Releasing a lock that is not held");
        block.write_u32(self.addr.block_offset(), Self::FREE);
        unit.put_block(self.addr.align_down(), &block);
    }

    /// Acquire the lock, spinning until it is able to do so
    #[inline]
    pub fn lock(&self, unit: &Unit) {
        self.lock_fetch(unit);
    }

    /// Try to acquire the lock once, returns [`Error::Busy`] when it is held by somebody else
    pub fn try_lock(&self, unit: &Unit) -> Result<()> {
        let offset = self.addr.block_offset();
        unit.transact(self.addr.align_down(), |block| {
            if block.read_u32(offset) == Self::FREE {
                block.write_u32(offset, Self::HELD);
                Step::Commit(Ok(()))
            } else {
                Step::Done(Err(Error::Busy))
            }
        })
    }

    /// Release the lock
    #[inline]
    pub fn unlock(&self, unit: &Unit) {
        AtomicCell::at(self.addr).set(unit, Self::FREE as i32);
    }

    /// Check whether the lock is currently held, without trying to acquire it
    pub fn is_locked(&self, unit: &Unit) -> bool {
        let mut flag = [0u8; 4];
        unit.get(self.addr, &mut flag);
        u32::from_le_bytes(flag) != Self::FREE
    }

    /// Acquire the lock, releasing it again when the returned guard is dropped
    #[inline]
    pub fn guard<'a>(&self, unit: &'a Unit) -> RemoteMutexGuard<'a> {
        self.lock(unit);
        RemoteMutexGuard { mutex: *self, unit }
    }

    /// Try to acquire the lock once, releasing it again when the returned guard is dropped
    #[inline]
    pub fn try_guard<'a>(&self, unit: &'a Unit) -> Result<RemoteMutexGuard<'a>> {
        self.try_lock(unit)?;
        Ok(RemoteMutexGuard { mutex: *self, unit })
    }
}

impl RemoteLock for RemoteMutex {
    #[inline]
    fn lock(&self, unit: &Unit) {
        RemoteMutex::lock(self, unit)
    }

    #[inline]
    fn try_lock(&self, unit: &Unit) -> bool {
        RemoteMutex::try_lock(self, unit).is_ok()
    }

    #[inline]
    fn unlock(&self, unit: &Unit) {
        RemoteMutex::unlock(self, unit)
    }

    #[inline]
    fn is_locked(&self, unit: &Unit) -> bool {
        RemoteMutex::is_locked(self, unit)
    }
}

impl Primitive for RemoteMutex {
    type Init = ();

    fn storage_size(_init: &()) -> Result<usize> {
        Ok(BLOCK_SIZE)
    }

    fn create_at(unit: &Unit, addr: SharedAddress, _init: ()) -> Result<Self> {
        let mutex = Self::at(addr);
        mutex.init(unit);
        Ok(mutex)
    }

    fn address(&self) -> SharedAddress {
        self.addr
    }
}

/// An RAII implementation of a "scoped lock" of a [`RemoteMutex`].
/// When this structure is dropped, the lock will be released.
#[must_use = "if unused the RemoteMutex will immediately unlock"]
pub struct RemoteMutexGuard<'a> {
    mutex : RemoteMutex,
    unit  : &'a Unit,
}

impl<'a> RemoteMutexGuard<'a> {
    /// Get the lock this guard holds
    #[inline]
    pub fn mutex(&self) -> RemoteMutex {
        self.mutex
    }

    /// Get the unit that holds the lock
    #[inline]
    pub fn unit(&self) -> &'a Unit {
        self.unit
    }
}

impl Drop for RemoteMutexGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.unlock(self.unit);
    }
}

impl fmt::Debug for RemoteMutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMutexGuard").field("mutex", &self.mutex).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use cellsync_mem::{SharedRegion, SharedAddress, Unit, BLOCK_SIZE, CountingBackoff};
    use crate::{Error, AtomicCell};
    use super::{RemoteMutex, RemoteLock};

    #[test]
    fn lock_unlock() {
        let unit = Unit::new(SharedRegion::new(BLOCK_SIZE));
        let mutex = RemoteMutex::at(SharedAddress::ZERO);
        mutex.init(&unit);

        assert!(!mutex.is_locked(&unit));
        mutex.lock(&unit);
        assert!(mutex.is_locked(&unit));
        mutex.unlock(&unit);
        assert!(!mutex.is_locked(&unit));
    }

    #[test]
    fn trylock_is_busy_when_held() {
        let region = SharedRegion::new(BLOCK_SIZE);
        let backoff = CountingBackoff::new();
        let waits = backoff.counter();
        let a = Unit::new(region.clone());
        let b = Unit::with_backoff(region.clone(), backoff);
        let mutex = RemoteMutex::at(SharedAddress::new(16));
        mutex.init(&a);

        assert_eq!(mutex.try_lock(&a), Ok(()));
        assert_eq!(mutex.try_lock(&b), Err(Error::Busy));
        // A failed trylock gives up immediately
        assert_eq!(waits.load(Ordering::Relaxed), 0);
        assert!(b.reservation_lost());

        mutex.unlock(&a);
        assert_eq!(mutex.try_lock(&b), Ok(()));
    }

    #[test]
    fn trait_is_locked() {
        let unit = Unit::new(SharedRegion::new(BLOCK_SIZE));
        let mutex = RemoteMutex::at(SharedAddress::ZERO);
        mutex.init(&unit);

        let lock: &dyn RemoteLock = &mutex;
        assert!(lock.try_lock(&unit));
        assert!(lock.is_locked(&unit));
        lock.unlock(&unit);
        assert!(!lock.is_locked(&unit));
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let unit = Unit::new(SharedRegion::new(BLOCK_SIZE));
        let mutex = RemoteMutex::at(SharedAddress::ZERO);
        mutex.init(&unit);

        {
            let _guard = mutex.guard(&unit);
            assert!(mutex.is_locked(&unit));
            assert_eq!(mutex.try_guard(&unit).err(), Some(Error::Busy));
        }
        assert!(!mutex.is_locked(&unit));
    }

    #[test]
    fn mutual_exclusion() {
        let region = SharedRegion::new(2 * BLOCK_SIZE);
        let mutex = RemoteMutex::at(SharedAddress::ZERO);
        // Counter in a different block, updated with plain transfers only
        let counter_addr = SharedAddress::new(BLOCK_SIZE as u64);
        mutex.init(&Unit::new(region.clone()));

        let inside = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let region = region.clone();
                let inside = &inside;
                s.spawn(move || {
                    let unit = Unit::new(region);
                    for _ in 0..200 {
                        let _guard = mutex.guard(&unit);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);

                        let mut bytes = [0u8; 4];
                        unit.get(counter_addr, &mut bytes);
                        let val = u32::from_le_bytes(bytes) + 1;
                        unit.put(counter_addr, &val.to_le_bytes());

                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        let unit = Unit::new(region);
        assert_eq!(AtomicCell::at(counter_addr).get(&unit), 800);
        assert!(!mutex.is_locked(&unit));
    }
}
