use cellsync_logging::log_warning;
use cellsync_mem::{Block, SharedAddress, Step, Unit, BLOCK_SIZE, round_to_blocks};
use static_assertions::const_assert;

use crate::{Error, Primitive, QueueParams, Result, LOG_CAT};

mod layout {
    pub const WCOUNT        : usize = 0;
    pub const WP            : usize = 1;
    pub const RCOUNT        : usize = 2;
    pub const RP            : usize = 3;
    pub const CAPACITY      : usize = 4;
    pub const ITEM_SIZE     : usize = 6;
    pub const ITEMS_ADDRESS : usize = 8;
    pub const SIZE          : usize = 16;
}

const_assert!(layout::SIZE <= BLOCK_SIZE);
const_assert!(layout::ITEM_SIZE % 2 == 0);

#[derive(Clone, Copy)]
struct Counters {
    wcount    : u8,
    wp        : u8,
    rcount    : u8,
    rp        : u8,
    capacity  : u8,
    item_size : u16,
    items     : SharedAddress,
}

impl Counters {
    fn read(block: &Block) -> Self {
        Self {
            wcount: block.read_u8(layout::WCOUNT),
            wp: block.read_u8(layout::WP),
            rcount: block.read_u8(layout::RCOUNT),
            rp: block.read_u8(layout::RP),
            capacity: block.read_u8(layout::CAPACITY),
            item_size: block.read_u16(layout::ITEM_SIZE),
            items: SharedAddress::new(block.read_u64(layout::ITEMS_ADDRESS)),
        }
    }

    fn write(&self, block: &mut Block) {
        block.write_u8(layout::WCOUNT, self.wcount);
        block.write_u8(layout::WP, self.wp);
        block.write_u8(layout::RCOUNT, self.rcount);
        block.write_u8(layout::RP, self.rp);
        block.write_u8(layout::CAPACITY, self.capacity);
        block.write_u16(layout::ITEM_SIZE, self.item_size);
        block.write_u64(layout::ITEMS_ADDRESS, self.items.raw());
    }

    #[inline]
    fn can_claim(&self) -> bool {
        self.wcount < self.capacity && self.wcount == self.rcount
    }

    #[inline]
    fn next(&self, index: u8) -> u8 {
        ((index as u16 + 1) % self.capacity as u16) as u8
    }

    #[inline]
    fn slot(&self, index: u8) -> SharedAddress {
        self.items.offset(index as usize * self.item_size as usize)
    }

    fn check_item(&self, len: usize) {
        assert!(len == self.item_size as usize, "Queue item needs to be {} bytes, got {len}", self.item_size);
    }
}

/// A bounded FIFO queue of fixed-size items in shared memory, driven only by reservations on a pair of counters.
///
/// The record lives in its own block:
///
/// | offset | field           | type  |
/// |--------|-----------------|-------|
/// | 0      | `wcount`        | `u8`  |
/// | 1      | `wp`            | `u8`  |
/// | 2      | `rcount`        | `u8`  |
/// | 3      | `rp`            | `u8`  |
/// | 4      | `capacity`      | `u8`  |
/// | 6      | `item_size`     | `u16` |
/// | 8      | `items_address` | `u64` |
///
/// A producer first claims the slot at `wp` by bumping `wcount`, writes its item outside of any reservation,
/// and then publishes it by bumping `rcount`.
/// A producer can only claim a slot while no other write is in flight (`wcount == rcount`), so at most one slot is ever claimed but unpublished.
/// A consumer takes the item at `rp` in the same commit that decrements both counters.
///
/// Items are packed back to back with a stride of `item_size` bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LfQueue {
    addr : SharedAddress,
}

impl LfQueue {
    /// Largest capacity the byte-sized counters can track
    pub const MAX_CAPACITY : usize = u8::MAX as usize;

    /// Refer to the queue at `addr`
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not block aligned.
    #[inline]
    pub fn at(addr: SharedAddress) -> Self {
        assert!(addr.is_block_aligned(), "A queue needs a {BLOCK_SIZE}-byte aligned address, got {addr}");
        Self { addr }
    }

    /// Get the address of the queue record
    #[inline]
    pub fn address(&self) -> SharedAddress {
        self.addr
    }

    /// Check that `params` fit the byte-sized counters, returning the capacity and item size as stored
    fn checked_params(params: &QueueParams) -> Result<(u8, u16)> {
        let capacity = match u8::try_from(params.capacity) {
            Ok(capacity) if capacity > 0 => capacity,
            _ => return Err(Error::BadValue("lock-free queue capacity must be in 1..=255")),
        };
        let item_size = match u16::try_from(params.item_size) {
            Ok(item_size) if item_size > 0 => item_size,
            _ => return Err(Error::BadValue("lock-free queue item size must be in 1..=65535")),
        };
        Ok((capacity, item_size))
    }

    /// Get the number of bytes needed to store the items of a queue.
    ///
    /// Returns [`Error::BadValue`] for params [`LfQueue::init`] would reject.
    pub fn items_size(params: &QueueParams) -> Result<usize> {
        let (capacity, item_size) = Self::checked_params(params)?;
        Ok(capacity as usize * item_size as usize)
    }

    /// Get the number of bytes needed for the record followed by its items, starting on the next block
    ///
    /// Returns [`Error::BadValue`] for params [`LfQueue::init`] would reject.
    pub fn storage_size(params: &QueueParams) -> Result<usize> {
        Ok(BLOCK_SIZE + round_to_blocks(Self::items_size(params)?))
    }

    /// Initialize an empty queue, with its items stored at `items_address`.
    ///
    /// Returns [`Error::BadValue`] when the capacity is not in `1..=255`, or the item size is not in `1..=65535`.
    ///
    /// # Panics
    ///
    /// Panics if the items would overlap the block of the record.
    pub fn init(&self, unit: &Unit, params: QueueParams, items_address: SharedAddress) -> Result<()> {
        assert!(items_address.align_down() != self.addr, "Queue items at {items_address} overlap the queue record at {}", self.addr);

        let (capacity, item_size) = match Self::checked_params(&params) {
            Ok(checked) => checked,
            Err(err) => {
                log_warning!(LOG_CAT, "Refused to initialize lock-free queue at {} with capacity {} and item size {}", self.addr, params.capacity, params.item_size);
                return Err(err);
            }
        };

        let counters = Counters {
            wcount: 0,
            wp: 0,
            rcount: 0,
            rp: 0,
            capacity,
            item_size,
            items: items_address,
        };
        unit.transact(self.addr, |block| {
            *block = Block::zeroed();
            counters.write(block);
            Step::Commit(())
        });
        Ok(())
    }

    /// Add an item to the back of the queue, waiting while the queue is full or another item is being written.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn enq(&self, unit: &Unit, item: &[u8]) {
        let claimed = unit.transact(self.addr, |block| {
            let mut counters = Counters::read(block);
            counters.check_item(item.len());
            if !counters.can_claim() {
                return Step::Wait;
            }
            let slot = counters.slot(counters.wp);
            counters.wp = counters.next(counters.wp);
            counters.wcount += 1;
            counters.write(block);
            Step::Commit(slot)
        });
        self.publish(unit, claimed, item);
    }

    /// Add an item to the back of the queue, or return [`Error::Retry`] when the queue is full or another item is being written.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn try_enq(&self, unit: &Unit, item: &[u8]) -> Result<()> {
        let claimed = unit.transact(self.addr, |block| {
            let mut counters = Counters::read(block);
            counters.check_item(item.len());
            if !counters.can_claim() {
                return Step::Done(Err(Error::Retry));
            }
            let slot = counters.slot(counters.wp);
            counters.wp = counters.next(counters.wp);
            counters.wcount += 1;
            counters.write(block);
            Step::Commit(Ok(slot))
        })?;
        self.publish(unit, claimed, item);
        Ok(())
    }

    fn publish(&self, unit: &Unit, slot: SharedAddress, item: &[u8]) {
        unit.put(slot, item);
        unit.transact(self.addr, |block| {
            let mut counters = Counters::read(block);
            debug_assert!(counters.rcount < counters.wcount, "Publishing an item that was never claimed");
            counters.rcount += 1;
            counters.write(block);
            Step::Commit(())
        })
    }

    /// Remove the item at the front of the queue into `item`, waiting while the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn deq(&self, unit: &Unit, item: &mut [u8]) {
        unit.transact(self.addr, |block| {
            let mut counters = Counters::read(block);
            counters.check_item(item.len());
            if counters.rcount == 0 {
                return Step::Wait;
            }
            unit.get(counters.slot(counters.rp), item);
            counters.rp = counters.next(counters.rp);
            counters.rcount -= 1;
            counters.wcount -= 1;
            counters.write(block);
            Step::Commit(())
        })
    }

    /// Remove the item at the front of the queue into `item`, or return [`Error::Retry`] when the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn try_deq(&self, unit: &Unit, item: &mut [u8]) -> Result<()> {
        unit.transact(self.addr, |block| {
            let mut counters = Counters::read(block);
            counters.check_item(item.len());
            if counters.rcount == 0 {
                return Step::Done(Err(Error::Retry));
            }
            unit.get(counters.slot(counters.rp), item);
            counters.rp = counters.next(counters.rp);
            counters.rcount -= 1;
            counters.wcount -= 1;
            counters.write(block);
            Step::Commit(Ok(()))
        })
    }

    /// Copy the item at the front of the queue into `item` without removing it, or return [`Error::NoData`] when the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn peek(&self, unit: &Unit, item: &mut [u8]) -> Result<()> {
        unit.transact(self.addr, |block| {
            let counters = Counters::read(block);
            counters.check_item(item.len());
            if counters.rcount == 0 {
                return Step::Done(Err(Error::NoData));
            }
            unit.get(counters.slot(counters.rp), item);
            Step::Commit(Ok(()))
        })
    }

    fn counters(&self, unit: &Unit) -> Counters {
        Counters::read(&unit.get_block(self.addr))
    }

    /// Get the number of published items in the queue
    #[inline]
    pub fn len(&self, unit: &Unit) -> usize {
        self.counters(unit).rcount as usize
    }

    /// Check if the queue currently holds no published items
    #[inline]
    pub fn is_empty(&self, unit: &Unit) -> bool {
        self.len(unit) == 0
    }

    /// Get the maximum number of items in the queue
    #[inline]
    pub fn capacity(&self, unit: &Unit) -> usize {
        self.counters(unit).capacity as usize
    }

    /// Get the size of a single item in bytes
    #[inline]
    pub fn item_size(&self, unit: &Unit) -> usize {
        self.counters(unit).item_size as usize
    }
}

impl Primitive for LfQueue {
    type Init = QueueParams;

    fn storage_size(params: &QueueParams) -> Result<usize> {
        LfQueue::storage_size(params)
    }

    fn create_at(unit: &Unit, addr: SharedAddress, params: QueueParams) -> Result<Self> {
        let queue = Self::at(addr);
        queue.init(unit, params, addr.offset(BLOCK_SIZE))?;
        Ok(queue)
    }

    fn address(&self) -> SharedAddress {
        self.addr
    }
}
