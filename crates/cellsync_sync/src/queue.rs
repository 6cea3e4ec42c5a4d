use cellsync_logging::log_warning;
use cellsync_mem::{Block, SharedAddress, Unit, BLOCK_SIZE, round_to_blocks};
use static_assertions::const_assert;

use crate::{Error, Primitive, RemoteMutex, Result, LOG_CAT};

mod layout {
    pub const LOCK          : usize = 0;
    pub const COUNT         : usize = 4;
    pub const CAPACITY      : usize = 8;
    pub const RP            : usize = 12;
    pub const WP            : usize = 16;
    pub const ITEM_SIZE     : usize = 20;
    pub const ITEMS_ADDRESS : usize = 24;
    pub const SIZE          : usize = 32;
}

const_assert!(layout::SIZE <= BLOCK_SIZE);
const_assert!(layout::ITEMS_ADDRESS % 8 == 0);

/// Shape of a bounded queue, used to size and initialize it
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct QueueParams {
    /// Maximum number of items in the queue
    pub capacity  : usize,
    /// Size of a single item in bytes
    pub item_size : usize,
}

impl QueueParams {
    #[inline]
    pub const fn new(capacity: usize, item_size: usize) -> Self {
        Self { capacity, item_size }
    }
}

struct Header {
    block         : Block,
    count         : u32,
    capacity      : u32,
    rp            : u32,
    wp            : u32,
    item_size     : u32,
    items_address : SharedAddress,
}

impl Header {
    fn from_block(block: Block) -> Self {
        Self {
            count: block.read_u32(layout::COUNT),
            capacity: block.read_u32(layout::CAPACITY),
            rp: block.read_u32(layout::RP),
            wp: block.read_u32(layout::WP),
            item_size: block.read_u32(layout::ITEM_SIZE),
            items_address: SharedAddress::new(block.read_u64(layout::ITEMS_ADDRESS)),
            block,
        }
    }

    fn into_block(self) -> Block {
        let mut block = self.block;
        block.write_u32(layout::COUNT, self.count);
        block.write_u32(layout::CAPACITY, self.capacity);
        block.write_u32(layout::RP, self.rp);
        block.write_u32(layout::WP, self.wp);
        block.write_u32(layout::ITEM_SIZE, self.item_size);
        block.write_u64(layout::ITEMS_ADDRESS, self.items_address.raw());
        block
    }

    fn slot(&self, index: u32) -> SharedAddress {
        let stride = round_to_blocks(self.item_size as usize);
        self.items_address.offset(index as usize * stride)
    }
}

/// A bounded FIFO queue of fixed-size items in shared memory, protected by a lock.
///
/// The record lives in its own block:
///
/// | offset | field           | type  |
/// |--------|-----------------|-------|
/// | 0      | `lock`          | `u32` |
/// | 4      | `count`         | `u32` |
/// | 8      | `capacity`      | `u32` |
/// | 12     | `rp`            | `u32` |
/// | 16     | `wp`            | `u32` |
/// | 20     | `item_size`     | `u32` |
/// | 24     | `items_address` | `u64` |
///
/// Items are stored in slots at `items_address`, each slot starting on a block boundary, so an item is always moved with whole-block transfers.
/// Every operation takes the record lock, the blocking variants release it between polls while the queue is full or empty.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Queue {
    addr : SharedAddress,
}

impl Queue {
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

    /// Check that `params` describe a queue the record can hold, returning the capacity and item size as stored
    fn checked_params(params: &QueueParams) -> Result<(u32, u32)> {
        let capacity = u32::try_from(params.capacity).map_err(|_| Error::BadValue("queue capacity does not fit in 32 bits"))?;
        let item_size = u32::try_from(params.item_size).map_err(|_| Error::BadValue("queue item size does not fit in 32 bits"))?;
        if capacity == 0 || item_size == 0 {
            return Err(Error::BadValue("queue capacity and item size must be non-zero"));
        }
        Ok((capacity, item_size))
    }

    /// Get the number of bytes needed to store the items of a queue.
    ///
    /// Returns [`Error::BadValue`] for params [`Queue::init`] would reject, or when the items don't fit in the address space.
    pub fn items_size(params: &QueueParams) -> Result<usize> {
        Self::checked_params(params)?;
        params.item_size.checked_next_multiple_of(BLOCK_SIZE)
            .and_then(|stride| stride.checked_mul(params.capacity))
            .ok_or(Error::BadValue("queue items do not fit in the address space"))
    }

    /// Get the number of bytes needed for the record followed directly by its items
    ///
    /// Returns [`Error::BadValue`] for params [`Queue::init`] would reject, or when the queue doesn't fit in the address space.
    pub fn storage_size(params: &QueueParams) -> Result<usize> {
        Self::items_size(params)?
            .checked_add(BLOCK_SIZE)
            .ok_or(Error::BadValue("queue items do not fit in the address space"))
    }

    #[inline]
    fn lock(&self) -> RemoteMutex {
        RemoteMutex::at(self.addr.offset(layout::LOCK))
    }

    /// Initialize an empty queue, with its items stored at `items_address`.
    ///
    /// Returns [`Error::BadValue`] when the capacity or item size is 0 or does not fit in the record.
    ///
    /// # Panics
    ///
    /// Panics if `items_address` is not block aligned.
    pub fn init(&self, unit: &Unit, params: QueueParams, items_address: SharedAddress) -> Result<()> {
        assert!(items_address.is_block_aligned(), "Queue items need a {BLOCK_SIZE}-byte aligned address, got {items_address}");

        let (capacity, item_size) = match Self::checked_params(&params) {
            Ok(checked) => checked,
            Err(err) => {
                log_warning!(LOG_CAT, "Refused to initialize queue at {} with capacity {} and item size {}", self.addr, params.capacity, params.item_size);
                return Err(err);
            }
        };

        let header = Header {
            block: Block::zeroed(),
            count: 0,
            capacity,
            rp: 0,
            wp: 0,
            item_size,
            items_address,
        };
        unit.put_block(self.addr, &header.into_block());
        Ok(())
    }

    /// Add an item to the back of the queue, waiting while the queue is full.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn enq(&self, unit: &Unit, item: &[u8]) {
        loop {
            match self.try_enq(unit, item) {
                Ok(()) => return,
                Err(_) => unit.wait_for_change(self.addr),
            }
        }
    }

    /// Add an item to the back of the queue, or return [`Error::Retry`] when the queue is full.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn try_enq(&self, unit: &Unit, item: &[u8]) -> Result<()> {
        let lock = self.lock();
        let mut header = Header::from_block(lock.lock_fetch(unit));
        let item_size = header.item_size as usize;
        if item.len() != item_size {
            lock.store_unlock(unit, header.into_block());
            panic!("Queue item needs to be {item_size} bytes, got {}", item.len());
        }

        if header.count >= header.capacity {
            lock.store_unlock(unit, header.into_block());
            return Err(Error::Retry);
        }

        let mut slot = vec![0u8; round_to_blocks(item_size)];
        slot[..item_size].copy_from_slice(item);
        unit.put(header.slot(header.wp), &slot);

        header.wp = (header.wp + 1) % header.capacity;
        header.count += 1;
        lock.store_unlock(unit, header.into_block());
        Ok(())
    }

    /// Remove the item at the front of the queue into `item`, waiting while the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn deq(&self, unit: &Unit, item: &mut [u8]) {
        loop {
            match self.try_deq(unit, item) {
                Ok(()) => return,
                Err(_) => unit.wait_for_change(self.addr),
            }
        }
    }

    /// Remove the item at the front of the queue into `item`, or return [`Error::Retry`] when the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn try_deq(&self, unit: &Unit, item: &mut [u8]) -> Result<()> {
        self.take_front(unit, item, true).map_err(|_| Error::Retry)
    }

    /// Copy the item at the front of the queue into `item` without removing it, or return [`Error::NoData`] when the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not exactly the item size of the queue.
    pub fn peek(&self, unit: &Unit, item: &mut [u8]) -> Result<()> {
        self.take_front(unit, item, false)
    }

    fn take_front(&self, unit: &Unit, item: &mut [u8], remove: bool) -> Result<()> {
        let lock = self.lock();
        let mut header = Header::from_block(lock.lock_fetch(unit));
        let item_size = header.item_size as usize;
        if item.len() != item_size {
            lock.store_unlock(unit, header.into_block());
            panic!("Queue item needs to be {item_size} bytes, got {}", item.len());
        }

        if header.count == 0 {
            lock.store_unlock(unit, header.into_block());
            return Err(Error::NoData);
        }

        let mut slot = vec![0u8; round_to_blocks(item_size)];
        unit.get(header.slot(header.rp), &mut slot);
        item.copy_from_slice(&slot[..item_size]);

        if remove {
            header.rp = (header.rp + 1) % header.capacity;
            header.count -= 1;
        }
        lock.store_unlock(unit, header.into_block());
        Ok(())
    }

    /// Get the number of items currently in the queue
    pub fn len(&self, unit: &Unit) -> usize {
        unit.get_block(self.addr).read_u32(layout::COUNT) as usize
    }

    /// Check if the queue currently holds no items
    #[inline]
    pub fn is_empty(&self, unit: &Unit) -> bool {
        self.len(unit) == 0
    }

    /// Get the maximum number of items in the queue
    pub fn capacity(&self, unit: &Unit) -> usize {
        unit.get_block(self.addr).read_u32(layout::CAPACITY) as usize
    }

    /// Get the size of a single item in bytes
    pub fn item_size(&self, unit: &Unit) -> usize {
        unit.get_block(self.addr).read_u32(layout::ITEM_SIZE) as usize
    }
}

impl Primitive for Queue {
    type Init = QueueParams;

    fn storage_size(params: &QueueParams) -> Result<usize> {
        Queue::storage_size(params)
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

#[cfg(test)]
mod tests {
    use cellsync_mem::{SharedRegion, SharedAddress, Unit, BLOCK_SIZE};
    use crate::Error;
    use super::{Queue, QueueParams};

    fn setup(params: QueueParams) -> (Unit, Queue) {
        let unit = Unit::new(SharedRegion::new(Queue::storage_size(&params).unwrap()));
        let queue = Queue::at(SharedAddress::ZERO);
        queue.init(&unit, params, SharedAddress::new(BLOCK_SIZE as u64)).unwrap();
        (unit, queue)
    }

    #[test]
    fn bad_params() {
        let unit = Unit::new(SharedRegion::new(BLOCK_SIZE));
        let queue = Queue::at(SharedAddress::ZERO);
        let items = SharedAddress::new(BLOCK_SIZE as u64);
        assert!(matches!(queue.init(&unit, QueueParams::new(0, 4), items), Err(Error::BadValue(_))));
        assert!(matches!(queue.init(&unit, QueueParams::new(4, 0), items), Err(Error::BadValue(_))));
    }

    #[test]
    fn oversized_params_are_rejected_when_sizing() {
        assert!(matches!(Queue::storage_size(&QueueParams::new(1 << 58, 8)), Err(Error::BadValue(_))));
        assert!(matches!(Queue::storage_size(&QueueParams::new(0, 8)), Err(Error::BadValue(_))));
        let huge = QueueParams::new(u32::MAX as usize, u32::MAX as usize);
        assert!(matches!(Queue::items_size(&huge), Err(Error::BadValue(_))));
        assert_eq!(Queue::storage_size(&QueueParams::new(3, 200)), Ok(BLOCK_SIZE + 3 * 2 * BLOCK_SIZE));
    }

    #[test]
    fn fifo_order_with_wraparound() {
        let (unit, queue) = setup(QueueParams::new(3, 4));

        for round in 0..3u32 {
            for i in 0..3u32 {
                queue.enq(&unit, &(round * 10 + i).to_le_bytes());
            }
            assert_eq!(queue.len(&unit), 3);

            let mut out = [0u8; 4];
            for i in 0..3u32 {
                queue.deq(&unit, &mut out);
                assert_eq!(u32::from_le_bytes(out), round * 10 + i);
            }
            assert!(queue.is_empty(&unit));
        }
    }

    #[test]
    fn try_variants_leave_state_untouched() {
        let (unit, queue) = setup(QueueParams::new(2, 8));
        let mut out = [0u8; 8];

        assert_eq!(queue.try_deq(&unit, &mut out), Err(Error::Retry));
        assert_eq!(queue.peek(&unit, &mut out), Err(Error::NoData));

        queue.try_enq(&unit, &1u64.to_le_bytes()).unwrap();
        queue.try_enq(&unit, &2u64.to_le_bytes()).unwrap();
        assert_eq!(queue.try_enq(&unit, &3u64.to_le_bytes()), Err(Error::Retry));
        assert_eq!(queue.len(&unit), 2);

        queue.peek(&unit, &mut out).unwrap();
        assert_eq!(u64::from_le_bytes(out), 1);
        assert_eq!(queue.len(&unit), 2);

        queue.try_deq(&unit, &mut out).unwrap();
        assert_eq!(u64::from_le_bytes(out), 1);
        queue.try_deq(&unit, &mut out).unwrap();
        assert_eq!(u64::from_le_bytes(out), 2);
    }

    #[test]
    fn items_larger_than_a_block() {
        let (unit, queue) = setup(QueueParams::new(2, 200));
        assert_eq!(queue.item_size(&unit), 200);
        assert_eq!(queue.capacity(&unit), 2);

        let a = [0xAAu8; 200];
        let b: Vec<u8> = (0..200).map(|i| i as u8).collect();
        queue.enq(&unit, &a);
        queue.enq(&unit, &b);

        let mut out = [0u8; 200];
        queue.deq(&unit, &mut out);
        assert_eq!(out, a);
        queue.deq(&unit, &mut out);
        assert_eq!(&out[..], &b[..]);
    }

    #[test]
    #[should_panic]
    fn wrong_item_size() {
        let (unit, queue) = setup(QueueParams::new(2, 8));
        queue.enq(&unit, &[0u8; 4]);
    }

    #[test]
    #[should_panic]
    fn wrong_item_size_on_full_queue() {
        let (unit, queue) = setup(QueueParams::new(1, 8));
        queue.try_enq(&unit, &[0u8; 8]).unwrap();
        let _ = queue.try_enq(&unit, &[0u8; 4]);
    }

    #[test]
    #[should_panic]
    fn wrong_item_size_on_empty_queue() {
        let (unit, queue) = setup(QueueParams::new(1, 8));
        let _ = queue.peek(&unit, &mut [0u8; 4]);
    }
}
