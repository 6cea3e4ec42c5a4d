use cellsync_mem::{SharedAddress, Step, Unit, BLOCK_SIZE};

use crate::{Primitive, Result};

/// A 32-bit signed integer in shared memory, updated atomically.
///
/// The cell may live anywhere in a block, as long as it is 4-byte aligned.
/// Every update reserves the whole block the cell lives in, mutates the local copy and commits it,
/// retrying as long as another unit wrote the block in between.
/// Any write to the same block, even to an unrelated field, forces a retry.
///
/// There is no bound on the number of retries: under pathological contention an update may livelock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AtomicCell {
    addr : SharedAddress,
}

impl AtomicCell {
    /// Size of the cell in bytes
    pub const SIZE : usize = 4;

    /// Refer to the cell at `addr`
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not 4-byte aligned.
    #[inline]
    pub fn at(addr: SharedAddress) -> Self {
        assert!(addr.is_aligned_to(Self::SIZE), "An atomic cell needs a 4-byte aligned address, got {addr}");
        Self { addr }
    }

    /// Get the address of the cell
    #[inline]
    pub fn address(&self) -> SharedAddress {
        self.addr
    }

    /// Run a single read-modify-write, `f` returns the new value, or `None` to leave the cell untouched.
    ///
    /// Returns the value the cell had before the update.
    pub fn update<F>(&self, unit: &Unit, mut f: F) -> i32
    where
        F : FnMut(i32) -> Option<i32>
    {
        let offset = self.addr.block_offset();
        debug_assert!(offset + Self::SIZE <= BLOCK_SIZE);

        unit.transact(self.addr.align_down(), |block| {
            let old = block.read_i32(offset);
            match f(old) {
                Some(new) => {
                    block.write_i32(offset, new);
                    Step::Commit(old)
                },
                None => Step::Done(old),
            }
        })
    }

    /// Set the initial value of the cell
    #[inline]
    pub fn init(&self, unit: &Unit, val: i32) {
        self.set(unit, val);
    }

    /// Store `val`, returning the previous value
    #[inline]
    pub fn set(&self, unit: &Unit, val: i32) -> i32 {
        self.update(unit, |_| Some(val))
    }

    /// Add `val`, returning the previous value
    #[inline]
    pub fn add(&self, unit: &Unit, val: i32) -> i32 {
        self.update(unit, |old| Some(old.wrapping_add(val)))
    }

    /// Subtract `val`, returning the previous value
    #[inline]
    pub fn sub(&self, unit: &Unit, val: i32) -> i32 {
        self.update(unit, |old| Some(old.wrapping_sub(val)))
    }

    /// Increment by 1, returning the previous value
    #[inline]
    pub fn inc(&self, unit: &Unit) -> i32 {
        self.add(unit, 1)
    }

    /// Decrement by 1, returning the previous value
    #[inline]
    pub fn dec(&self, unit: &Unit) -> i32 {
        self.sub(unit, 1)
    }

    /// Bitwise and with `val`, returning the previous value
    #[inline]
    pub fn fetch_and(&self, unit: &Unit, val: i32) -> i32 {
        self.update(unit, |old| Some(old & val))
    }

    /// Bitwise or with `val`, returning the previous value
    #[inline]
    pub fn fetch_or(&self, unit: &Unit, val: i32) -> i32 {
        self.update(unit, |old| Some(old | val))
    }

    /// Store `new` if the cell currently holds `expected`.
    ///
    /// Returns the value the cell held, the swap happened if it equals `expected`.
    #[inline]
    pub fn compare_and_swap(&self, unit: &Unit, expected: i32, new: i32) -> i32 {
        self.update(unit, |old| (old == expected).then_some(new))
    }

    /// Store 0, returning the previous value
    #[inline]
    pub fn read_and_clear(&self, unit: &Unit) -> i32 {
        self.set(unit, 0)
    }

    /// Read the current value.
    ///
    /// This goes through the same reserve/commit pair as an update, writing back the unchanged block,
    /// so the value is a consistent snapshot ordered with respect to all other updates of the block.
    pub fn get(&self, unit: &Unit) -> i32 {
        let offset = self.addr.block_offset();
        unit.transact(self.addr.align_down(), |block| Step::Commit(block.read_i32(offset)))
    }
}

impl Primitive for AtomicCell {
    type Init = i32;

    fn storage_size(_init: &i32) -> Result<usize> {
        Ok(Self::SIZE)
    }

    fn create_at(unit: &Unit, addr: SharedAddress, init: i32) -> Result<Self> {
        let cell = Self::at(addr);
        cell.init(unit, init);
        Ok(cell)
    }

    fn address(&self) -> SharedAddress {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use cellsync_mem::{SharedRegion, SharedAddress, Unit, BLOCK_SIZE};
    use super::AtomicCell;

    fn setup() -> Unit {
        Unit::new(SharedRegion::new(2 * BLOCK_SIZE))
    }

    #[test]
    fn arithmetic_returns_old_value() {
        let unit = setup();
        let cell = AtomicCell::at(SharedAddress::new(132));

        cell.init(&unit, 10);
        assert_eq!(cell.add(&unit, 5), 10);
        assert_eq!(cell.sub(&unit, 3), 15);
        assert_eq!(cell.inc(&unit), 12);
        assert_eq!(cell.dec(&unit), 13);
        assert_eq!(cell.get(&unit), 12);
        assert_eq!(cell.set(&unit, -1), 12);
        assert_eq!(cell.read_and_clear(&unit), -1);
        assert_eq!(cell.get(&unit), 0);
    }

    #[test]
    fn bit_ops_and_cas() {
        let unit = setup();
        let cell = AtomicCell::at(SharedAddress::ZERO);

        cell.init(&unit, 0b1100);
        assert_eq!(cell.fetch_or(&unit, 0b0011), 0b1100);
        assert_eq!(cell.fetch_and(&unit, 0b0110), 0b1111);
        assert_eq!(cell.get(&unit), 0b0110);

        assert_eq!(cell.compare_and_swap(&unit, 1, 100), 0b0110);
        assert_eq!(cell.get(&unit), 0b0110);
        assert_eq!(cell.compare_and_swap(&unit, 0b0110, 100), 0b0110);
        assert_eq!(cell.get(&unit), 100);
    }

    #[test]
    fn wraps_around() {
        let unit = setup();
        let cell = AtomicCell::at(SharedAddress::ZERO);
        cell.init(&unit, i32::MAX);
        cell.inc(&unit);
        assert_eq!(cell.get(&unit), i32::MIN);
    }

    #[test]
    fn neighbours_in_block_are_untouched() {
        let unit = setup();
        let a = AtomicCell::at(SharedAddress::new(8));
        let b = AtomicCell::at(SharedAddress::new(12));

        a.init(&unit, 1);
        b.init(&unit, 2);
        a.add(&unit, 10);
        assert_eq!(a.get(&unit), 11);
        assert_eq!(b.get(&unit), 2);
    }

    #[test]
    fn concurrent_increments() {
        let region = SharedRegion::new(BLOCK_SIZE);
        let cell = AtomicCell::at(SharedAddress::new(64));
        cell.init(&Unit::new(region.clone()), 0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                let region = region.clone();
                s.spawn(move || {
                    let unit = Unit::new(region);
                    for _ in 0..500 {
                        cell.inc(&unit);
                    }
                });
            }
        });

        assert_eq!(cell.get(&Unit::new(region)), 2000);
    }

    #[test]
    #[should_panic]
    fn misaligned_cell() {
        AtomicCell::at(SharedAddress::new(2));
    }
}
