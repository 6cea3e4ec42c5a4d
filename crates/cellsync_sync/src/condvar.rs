use cellsync_mem::{Block, SharedAddress, Unit, BLOCK_SIZE};
use static_assertions::const_assert;

use crate::{Primitive, RemoteLock, RemoteMutex, Result};

/// In-block layout of the condition record
mod layout {
    pub const LOCK       : usize = 0;
    pub const NWAITERS   : usize = 4;
    pub const BCAST_SEQ  : usize = 8;
    pub const TOTAL_SEQ  : usize = 16;
    pub const WAKEUP_SEQ : usize = 24;
    pub const WOKEN_SEQ  : usize = 32;
    pub const SIZE       : usize = 40;
}

const_assert!(layout::SIZE <= BLOCK_SIZE);
const_assert!(layout::TOTAL_SEQ % 8 == 0);

/// Local copy of the condition record, only valid while the internal lock is held
struct CondRecord {
    block      : Block,
    nwaiters   : u32,
    bcast_seq  : u32,
    total_seq  : u64,
    wakeup_seq : u64,
    woken_seq  : u64,
}

impl CondRecord {
    fn from_block(block: Block) -> Self {
        Self {
            nwaiters: block.read_u32(layout::NWAITERS),
            bcast_seq: block.read_u32(layout::BCAST_SEQ),
            total_seq: block.read_u64(layout::TOTAL_SEQ),
            wakeup_seq: block.read_u64(layout::WAKEUP_SEQ),
            woken_seq: block.read_u64(layout::WOKEN_SEQ),
            block,
        }
    }

    fn into_block(self) -> Block {
        let mut block = self.block;
        block.write_u32(layout::NWAITERS, self.nwaiters);
        block.write_u32(layout::BCAST_SEQ, self.bcast_seq);
        block.write_u64(layout::TOTAL_SEQ, self.total_seq);
        block.write_u64(layout::WAKEUP_SEQ, self.wakeup_seq);
        block.write_u64(layout::WOKEN_SEQ, self.woken_seq);
        block
    }
}

/// A condition variable in shared memory.
///
/// Waiters are tracked with sequence counters protected by an internal lock that lives in the same block as the counters:
///
/// | offset | field        | type  |
/// |--------|--------------|-------|
/// | 0      | `lock`       | `u32` |
/// | 4      | `nwaiters`   | `u32` |
/// | 8      | `bcast_seq`  | `u32` |
/// | 16     | `total_seq`  | `u64` |
/// | 24     | `wakeup_seq` | `u64` |
/// | 32     | `woken_seq`  | `u64` |
///
/// `total_seq` counts registered waits, `wakeup_seq` counts granted wakeups and `woken_seq` counts consumed wakeups,
/// so `total_seq >= wakeup_seq >= woken_seq` always holds.
/// A broadcast grants every pending wakeup at once and bumps `bcast_seq`, which releases every waiter that registered before it.
///
/// The condition variable can be paired with any [`RemoteLock`], which the caller must hold when calling [`Condvar::wait`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Condvar {
    addr : SharedAddress,
}

impl Condvar {
    /// Refer to the condition variable at `addr`
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not block aligned.
    #[inline]
    pub fn at(addr: SharedAddress) -> Self {
        assert!(addr.is_block_aligned(), "A condition variable needs a {BLOCK_SIZE}-byte aligned address, got {addr}");
        Self { addr }
    }

    /// Get the address of the condition variable
    #[inline]
    pub fn address(&self) -> SharedAddress {
        self.addr
    }

    #[inline]
    fn internal_lock(&self) -> RemoteMutex {
        RemoteMutex::at(self.addr.offset(layout::LOCK))
    }

    /// Reset all counters and the internal lock
    pub fn init(&self, unit: &Unit) {
        let mut block = unit.get_block(self.addr);
        block.as_bytes_mut()[..layout::SIZE].fill(0);
        unit.put_block(self.addr, &block);
    }

    /// Atomically release `mutex` and wait for a signal or broadcast, then reacquire `mutex`.
    ///
    /// The caller must hold `mutex`.
    /// A wakeup can only be consumed by a waiter that registered before the wakeup was granted, so no wakeup is missed between releasing `mutex` and waiting.
    pub fn wait<L: RemoteLock + ?Sized>(&self, unit: &Unit, mutex: &L) {
        let lock = self.internal_lock();

        let mut rec = CondRecord::from_block(lock.lock_fetch(unit));
        mutex.unlock(unit);

        rec.total_seq += 1;
        rec.nwaiters += 1;
        let seq = rec.wakeup_seq;
        let bcast = rec.bcast_seq;
        lock.store_unlock(unit, rec.into_block());

        let (mut rec, broadcast) = loop {
            unit.wait_for_change(self.addr);

            let rec = CondRecord::from_block(lock.lock_fetch(unit));
            if rec.bcast_seq != bcast {
                break (rec, true);
            }
            if rec.wakeup_seq != seq && rec.woken_seq != rec.wakeup_seq {
                break (rec, false);
            }
            lock.store_unlock(unit, rec.into_block());
        };

        if !broadcast {
            rec.woken_seq += 1;
        }
        rec.nwaiters -= 1;
        lock.store_unlock(unit, rec.into_block());

        mutex.lock(unit);
    }

    /// Wait as long as `condition` returns `true`.
    ///
    /// `condition` is checked with `mutex` held, both before the first wait and after every wakeup.
    pub fn wait_while<L, F>(&self, unit: &Unit, mutex: &L, mut condition: F)
    where
        L : RemoteLock + ?Sized,
        F : FnMut() -> bool
    {
        while condition() {
            self.wait(unit, mutex);
        }
    }

    /// Wake up one waiter, if there is one that was not woken yet
    pub fn signal(&self, unit: &Unit) {
        let lock = self.internal_lock();
        let mut rec = CondRecord::from_block(lock.lock_fetch(unit));
        if rec.total_seq > rec.wakeup_seq {
            rec.wakeup_seq += 1;
        }
        lock.store_unlock(unit, rec.into_block());
    }

    /// Wake up all current waiters
    pub fn broadcast(&self, unit: &Unit) {
        let lock = self.internal_lock();
        let mut rec = CondRecord::from_block(lock.lock_fetch(unit));
        if rec.total_seq > rec.wakeup_seq {
            rec.wakeup_seq = rec.total_seq;
            rec.woken_seq = rec.total_seq;
            rec.bcast_seq = rec.bcast_seq.wrapping_add(1);
        }
        lock.store_unlock(unit, rec.into_block());
    }

    /// Get the number of units currently inside [`Condvar::wait`]
    pub fn waiters(&self, unit: &Unit) -> u32 {
        let mut bytes = [0u8; 4];
        unit.get(self.addr.offset(layout::NWAITERS), &mut bytes);
        u32::from_le_bytes(bytes)
    }
}

impl Primitive for Condvar {
    type Init = ();

    fn storage_size(_init: &()) -> Result<usize> {
        Ok(BLOCK_SIZE)
    }

    fn create_at(unit: &Unit, addr: SharedAddress, _init: ()) -> Result<Self> {
        let cond = Self::at(addr);
        cond.init(unit);
        Ok(cond)
    }

    fn address(&self) -> SharedAddress {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use cellsync_mem::{SharedRegion, SharedAddress, Unit, BLOCK_SIZE};
    use crate::{AtomicCell, RemoteMutex};
    use super::{Condvar, layout};

    fn read_seqs(unit: &Unit, cond: &Condvar) -> (u64, u64, u64) {
        let block = unit.get_block(cond.address());
        (block.read_u64(layout::TOTAL_SEQ), block.read_u64(layout::WAKEUP_SEQ), block.read_u64(layout::WOKEN_SEQ))
    }

    #[test]
    fn signal_without_waiters_is_noop() {
        let unit = Unit::new(SharedRegion::new(BLOCK_SIZE));
        let cond = Condvar::at(SharedAddress::ZERO);
        cond.init(&unit);

        cond.signal(&unit);
        cond.broadcast(&unit);
        assert_eq!(read_seqs(&unit, &cond), (0, 0, 0));
        assert_eq!(cond.waiters(&unit), 0);
    }

    #[test]
    fn wait_while_flag_is_clear() {
        let region = SharedRegion::new(2 * BLOCK_SIZE);
        let cond = Condvar::at(SharedAddress::ZERO);
        let mutex = RemoteMutex::at(SharedAddress::new(BLOCK_SIZE as u64));
        let flag = AtomicCell::at(SharedAddress::new(BLOCK_SIZE as u64 + 4));
        {
            let unit = Unit::new(region.clone());
            cond.init(&unit);
            mutex.init(&unit);
            flag.init(&unit, 0);
        }

        std::thread::scope(|s| {
            let waiter_region = region.clone();
            let waiter = s.spawn(move || {
                let unit = Unit::new(waiter_region);
                mutex.lock(&unit);
                cond.wait_while(&unit, &mutex, || flag.get(&unit) == 0);
                let val = flag.get(&unit);
                mutex.unlock(&unit);
                val
            });

            let unit = Unit::new(region.clone());
            while cond.waiters(&unit) == 0 {
                std::thread::yield_now();
            }
            mutex.lock(&unit);
            flag.set(&unit, 7);
            cond.signal(&unit);
            mutex.unlock(&unit);

            assert_eq!(waiter.join().unwrap(), 7);
        });

        let unit = Unit::new(region);
        assert_eq!(cond.waiters(&unit), 0);
        assert_eq!(read_seqs(&unit, &cond), (1, 1, 1));
    }
}
