use core::{
    cell::{Cell, RefCell},
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};
use std::sync::Arc;
use cellsync_logging::log_verbose;

use crate::{
    LOG_CAT, BLOCK_SIZE, Block, SharedAddress, SharedRegion, BackoffConfig,
    backoff::{Backoff, default_backoff},
    reservation::{Reservation, ReservationEvent},
};

static NEXT_UNIT_ID : AtomicU32 = AtomicU32::new(0);

/// Outcome of a single reserve-mutate round in [`Unit::transact`]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step<R> {
    /// Try to commit the (modified) block, return the value when the commit succeeds, otherwise retry
    Commit(R),
    /// Drop the reservation without writing and return the value
    Done(R),
    /// Keep the reservation, wait until it is lost and retry
    Wait,
}

/// An execution unit's view on the shared region.
///
/// This models what an accelerator core can do with shared memory:
/// - plain block transfers ([`get`](Unit::get) and [`put`](Unit::put)) between the region and a local buffer
/// - a single reservation slot: [`load_reserved`](Unit::load_reserved) reads a block and arms the slot,
///   [`try_commit`](Unit::try_commit) writes the block back only if nobody wrote it since
/// - waiting for the reservation-lost event, through an injected [`Backoff`] strategy
///
/// There is exactly one reservation per unit, so a unit is `Send` but not `Sync`: each execution unit owns its own `Unit`.
pub struct Unit {
    region      : Arc<SharedRegion>,
    reservation : Cell<Option<Reservation>>,
    backoff     : RefCell<Box<dyn Backoff>>,
    id          : u32,
}

impl Unit {
    /// Create a unit using the default backoff strategy
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self::with_boxed_backoff(region, default_backoff(&BackoffConfig::default()))
    }

    /// Create a unit using a specific backoff strategy
    pub fn with_backoff<B: Backoff + 'static>(region: Arc<SharedRegion>, backoff: B) -> Self {
        Self::with_boxed_backoff(region, Box::new(backoff))
    }

    /// Create a unit using an already boxed backoff strategy
    pub fn with_boxed_backoff(region: Arc<SharedRegion>, backoff: Box<dyn Backoff>) -> Self {
        Self {
            region,
            reservation: Cell::new(None),
            backoff: RefCell::new(backoff),
            id: NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Get the id of the unit, only used to tell units apart in logs
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get the region the unit transfers to and from
    #[inline]
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Transfer `dst.len()` bytes from the shared region into a local buffer.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside of the region.
    #[inline]
    pub fn get(&self, addr: SharedAddress, dst: &mut [u8]) {
        self.region.read(addr, dst);
    }

    /// Transfer a local buffer into the shared region.
    ///
    /// Every block that is written loses all its reservations, including the one of this unit.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside of the region.
    #[inline]
    pub fn put(&self, addr: SharedAddress, src: &[u8]) {
        self.region.write(addr, src);
    }

    /// Transfer a single block into a local buffer, without reserving it
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not block aligned or outside of the region.
    pub fn get_block(&self, addr: SharedAddress) -> Block {
        self.check_block(addr);
        self.region.read_line(addr.block_index()).0
    }

    /// Transfer a local block into the shared region
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not block aligned or outside of the region.
    pub fn put_block(&self, addr: SharedAddress, block: &Block) {
        self.check_block(addr);
        self.region.write_line(addr.block_index(), block);
    }

    /// Transfer a block into a local buffer and reserve it.
    ///
    /// Any reservation the unit held before is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not block aligned or outside of the region.
    pub fn load_reserved(&self, addr: SharedAddress) -> Block {
        self.check_block(addr);
        let line = addr.block_index();
        let (block, version) = self.region.read_line(line);
        self.reservation.set(Some(Reservation { line, version }));
        block
    }

    /// Write a block back, if the unit still holds a reservation on it.
    ///
    /// Returns `true` when the block was written.
    /// The reservation is consumed whether the commit succeeds or not.
    pub fn try_commit(&self, addr: SharedAddress, block: &Block) -> bool {
        self.check_block(addr);
        match self.reservation.take() {
            Some(res) if res.line == addr.block_index() => self.region.write_line_if(res.line, res.version, block),
            _ => false,
        }
    }

    /// Drop the current reservation without writing anything
    #[inline]
    pub fn release(&self) {
        self.reservation.set(None);
    }

    /// Check if the unit has no live reservation, either because it was never made or because the block was written since
    pub fn reservation_lost(&self) -> bool {
        match self.reservation.get() {
            Some(res) => self.region.stamp(res.line).load() != res.version,
            None => true,
        }
    }

    /// Wait for the current reservation to be lost, as far as the backoff strategy is willing to wait
    pub fn wait_event(&self) {
        let event = match self.reservation.get() {
            Some(res) => ReservationEvent::new(self.region.stamp(res.line), res.version),
            None => ReservationEvent::fired(self.region.stamp(0)),
        };
        self.backoff.borrow_mut().wait(&event);
    }

    /// Reserve the block at `addr` and wait until somebody writes to it, or the backoff gives up.
    ///
    /// The reservation is dropped afterwards.
    pub fn wait_for_change(&self, addr: SharedAddress) {
        self.load_reserved(addr.align_down());
        self.wait_event();
        self.release();
    }

    /// Run a reserve-mutate-commit loop on the block at `addr`.
    ///
    /// Each round the block is loaded under a reservation and handed to `f`, which decides what happens next through a [`Step`].
    /// A failed commit means another unit wrote the block since it was reserved, in which case the round is repeated.
    ///
    /// There is no bound on the number of rounds.
    pub fn transact<R, F>(&self, addr: SharedAddress, mut f: F) -> R
    where
        F : FnMut(&mut Block) -> Step<R>
    {
        let mut failed_commits = 0u32;
        loop {
            let mut block = self.load_reserved(addr);
            match f(&mut block) {
                Step::Commit(res) => {
                    if self.try_commit(addr, &block) {
                        self.backoff.borrow_mut().reset();
                        return res;
                    }
                    failed_commits = failed_commits.wrapping_add(1);
                    self.report_contention(addr, failed_commits);
                    self.wait_event();
                },
                Step::Done(res) => {
                    self.release();
                    return res;
                },
                Step::Wait => self.wait_event(),
            }
        }
    }

    fn report_contention(&self, addr: SharedAddress, failed_commits: u32) {
        let limit = self.region.config().contention_report;
        if limit != 0 && failed_commits % limit == 0 {
            log_verbose!(LOG_CAT, "Unit {} failed to commit block {} {} times in a row", self.id, addr, failed_commits);
        }
    }

    fn check_block(&self, addr: SharedAddress) {
        assert!(addr.is_block_aligned(), "Block transfers need a {BLOCK_SIZE}-byte aligned address, got {addr}");
        self.region.check_range(addr, BLOCK_SIZE);
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("reservation", &self.reservation.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CountingBackoff;

    fn region() -> Arc<SharedRegion> {
        SharedRegion::new(4 * BLOCK_SIZE)
    }

    #[test]
    fn commit_without_interference() {
        let region = region();
        let unit = Unit::new(region.clone());
        let addr = SharedAddress::new(BLOCK_SIZE as u64);

        let mut block = unit.load_reserved(addr);
        assert!(!unit.reservation_lost());
        block.write_u32(0, 42);
        assert!(unit.try_commit(addr, &block));
        assert!(unit.reservation_lost());

        assert_eq!(unit.get_block(addr).read_u32(0), 42);
    }

    #[test]
    fn put_from_other_unit_breaks_reservation() {
        let region = region();
        let a = Unit::new(region.clone());
        let b = Unit::new(region.clone());
        let addr = SharedAddress::ZERO;

        let mut block = a.load_reserved(addr);
        b.put(addr.offset(64), &[1]);
        assert!(a.reservation_lost());

        block.write_u32(0, 1);
        assert!(!a.try_commit(addr, &block));
        assert_eq!(a.get_block(addr).read_u32(0), 0);
        assert_eq!(a.get_block(addr).read_u8(64), 1);
    }

    #[test]
    fn write_to_other_block_keeps_reservation() {
        let region = region();
        let a = Unit::new(region.clone());
        let b = Unit::new(region.clone());

        let block = a.load_reserved(SharedAddress::ZERO);
        b.put(SharedAddress::new(BLOCK_SIZE as u64), &[1, 2, 3]);
        assert!(!a.reservation_lost());
        assert!(a.try_commit(SharedAddress::ZERO, &block));
    }

    #[test]
    fn single_reservation_slot() {
        let region = region();
        let unit = Unit::new(region.clone());
        let first = SharedAddress::ZERO;
        let second = SharedAddress::new(BLOCK_SIZE as u64);

        let block = unit.load_reserved(first);
        unit.load_reserved(second);
        // Reserving the second block dropped the reservation on the first
        assert!(!unit.try_commit(first, &block));
    }

    #[test]
    fn release_drops_reservation() {
        let unit = Unit::new(region());
        let block = unit.load_reserved(SharedAddress::ZERO);
        unit.release();
        assert!(unit.reservation_lost());
        assert!(!unit.try_commit(SharedAddress::ZERO, &block));
    }

    #[test]
    fn transact_retries_after_interference() {
        let region = region();
        let backoff = CountingBackoff::new();
        let waits = backoff.counter();
        let unit = Unit::with_backoff(region.clone(), backoff);
        let other = Unit::new(region.clone());
        let addr = SharedAddress::ZERO;

        let mut rounds = 0;
        let old = unit.transact(addr, |block| {
            rounds += 1;
            if rounds == 1 {
                // Another unit sneaks in a write between reserve and commit
                other.put(addr, &5u32.to_le_bytes());
            }
            let old = block.read_u32(0);
            block.write_u32(0, old + 1);
            Step::Commit(old)
        });

        assert_eq!(rounds, 2);
        assert_eq!(old, 5);
        assert_eq!(unit.get_block(addr).read_u32(0), 6);
        assert_eq!(waits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn transact_done_does_not_write() {
        let region = region();
        let unit = Unit::new(region.clone());
        let addr = SharedAddress::ZERO;

        let (_, before) = region.read_line(0);
        let val = unit.transact(addr, |block| {
            block.write_u32(0, 99);
            Step::Done(block.read_u32(0))
        });
        assert_eq!(val, 99);
        assert_eq!(region.read_line(0).1, before);
        assert_eq!(unit.get_block(addr).read_u32(0), 0);
    }

    #[test]
    fn transact_wait_until_changed() {
        let region = region();
        let backoff = CountingBackoff::new();
        let waits = backoff.counter();
        let unit = Unit::with_backoff(region.clone(), backoff);
        let other = Unit::new(region.clone());
        let addr = SharedAddress::ZERO;

        let mut polls = 0;
        let seen = unit.transact(addr, |block| {
            polls += 1;
            let val = block.read_u32(0);
            if val == 0 {
                other.put(addr, &3u32.to_le_bytes());
                Step::Wait
            } else {
                Step::Done(val)
            }
        });
        assert_eq!(seen, 3);
        assert_eq!(polls, 2);
        assert_eq!(waits.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic]
    fn misaligned_reservation() {
        let unit = Unit::new(region());
        unit.load_reserved(SharedAddress::new(4));
    }
}
