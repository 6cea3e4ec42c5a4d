use core::sync::atomic::{AtomicU64, Ordering, fence};
use std::sync::Arc;
use cellsync_logging::{log_info, log_warning};

use crate::{
    LOG_CAT, BLOCK_SIZE, Block, SharedAddress, RegionConfig,
    address::round_to_blocks,
    alloc::BlockAllocator,
    reservation::Stamp,
};

const WORD_SIZE : usize = 8;
const WORDS_PER_LINE : usize = BLOCK_SIZE / WORD_SIZE;

/// Payload of a single block of the shared region
#[repr(C, align(128))]
struct Line {
    words : [AtomicU64; WORDS_PER_LINE],
}

impl Line {
    fn new() -> Self {
        Self { words: core::array::from_fn(|_| AtomicU64::new(0)) }
    }
}

/// The memory region shared by every execution unit.
///
/// The region is a flat array of 128-byte blocks, each guarded by a reservation stamp.
/// Any transfer is atomic per block: a reader never observes a block while it is half-written.
/// Transfers spanning multiple blocks are not atomic as a whole.
///
/// Units never touch the region directly, they go through a [`Unit`](crate::Unit), which models the transfer engine and reservation slot of a core.
pub struct SharedRegion {
    stamps : Box<[Stamp]>,
    lines  : Box<[Line]>,
    alloc  : BlockAllocator,
    config : RegionConfig,
}

impl SharedRegion {
    /// Create a region of at least `size` bytes
    pub fn new(size: usize) -> Arc<Self> {
        Self::with_config(RegionConfig::with_size(size))
    }

    /// Create a region from a config
    ///
    /// # Panics
    ///
    /// Panics if the configured size is 0.
    pub fn with_config(config: RegionConfig) -> Arc<Self> {
        assert!(config.size != 0, "A shared region needs at least a single block");

        let num_blocks = round_to_blocks(config.size) / BLOCK_SIZE;
        let stamps = (0..num_blocks).map(|_| Stamp::new()).collect();
        let lines = (0..num_blocks).map(|_| Line::new()).collect();

        log_info!(LOG_CAT, "Created shared region with {} blocks ({} bytes)", num_blocks, num_blocks * BLOCK_SIZE);

        Arc::new(Self {
            stamps,
            lines,
            alloc: BlockAllocator::new(num_blocks),
            config: RegionConfig { size: num_blocks * BLOCK_SIZE, ..config },
        })
    }

    /// Get the size of the region in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.lines.len() * BLOCK_SIZE
    }

    /// Get the number of blocks in the region
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.lines.len()
    }

    /// Get the config the region was created with
    #[inline]
    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Allocate zeroed, block-aligned storage of at least `size` bytes
    pub fn alloc(&self, size: usize) -> Option<SharedAddress> {
        let num_blocks = round_to_blocks(size.max(1)) / BLOCK_SIZE;
        match self.alloc.alloc(num_blocks) {
            Some(first) => {
                let zero = Block::zeroed();
                for line in first..first + num_blocks {
                    self.write_line(line, &zero);
                }
                Some(SharedAddress::new((first * BLOCK_SIZE) as u64))
            },
            None => {
                log_warning!(LOG_CAT, "Failed to allocate {} shared blocks, {} of {} in use", num_blocks, self.alloc.used_blocks(), self.num_blocks());
                None
            },
        }
    }

    /// Free storage returned by [`SharedRegion::alloc`], `size` must be the size it was allocated with
    pub fn free(&self, addr: SharedAddress, size: usize) {
        assert!(addr.is_block_aligned(), "Shared allocations are block aligned, got {addr}");
        let num_blocks = round_to_blocks(size.max(1)) / BLOCK_SIZE;
        self.alloc.dealloc(addr.block_index(), num_blocks);
    }

    /// Get the number of bytes currently allocated through [`SharedRegion::alloc`]
    pub fn allocated_bytes(&self) -> usize {
        self.alloc.used_blocks() * BLOCK_SIZE
    }

    pub(crate) fn check_range(&self, addr: SharedAddress, len: usize) {
        let end = addr.raw().checked_add(len as u64);
        assert!(end.map_or(false, |end| end <= self.size() as u64), "Transfer of {len} bytes at {addr} is outside of the shared region ({} bytes)", self.size());
    }

    #[inline]
    pub(crate) fn stamp(&self, line: usize) -> &Stamp {
        &self.stamps[line]
    }

    /// Read a consistent snapshot of a block, together with the version it was read at
    pub(crate) fn read_line(&self, line: usize) -> (Block, u64) {
        let stamp = &self.stamps[line];
        let words = &self.lines[line].words;
        loop {
            let before = stamp.load();
            if before & Stamp::LOCK_BIT != 0 {
                core::hint::spin_loop();
                continue;
            }

            let mut block = Block::zeroed();
            for (word, bytes) in words.iter().zip(block.as_bytes_mut().chunks_exact_mut(WORD_SIZE)) {
                bytes.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
            }

            fence(Ordering::Acquire);
            if stamp.load() == before {
                return (block, before);
            }
        }
    }

    /// Write `src` into a block at `offset`, the caller has to hold the block's stamp lock
    fn store_locked(&self, line: usize, offset: usize, src: &[u8]) {
        fence(Ordering::Release);
        let words = &self.lines[line].words;
        let end = offset + src.len();
        let mut pos = offset;
        while pos < end {
            let word_idx = pos / WORD_SIZE;
            let word_start = word_idx * WORD_SIZE;
            let chunk_end = (word_start + WORD_SIZE).min(end);

            let word = &words[word_idx];
            if pos == word_start && chunk_end == word_start + WORD_SIZE {
                let mut bytes = [0u8; WORD_SIZE];
                bytes.copy_from_slice(&src[pos - offset..chunk_end - offset]);
                word.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
            } else {
                let mut bytes = word.load(Ordering::Relaxed).to_le_bytes();
                bytes[pos - word_start..chunk_end - word_start].copy_from_slice(&src[pos - offset..chunk_end - offset]);
                word.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
            }
            pos = chunk_end;
        }
    }

    /// Unconditionally overwrite a whole block
    pub(crate) fn write_line(&self, line: usize, block: &Block) {
        let stamp = &self.stamps[line];
        stamp.lock();
        self.store_locked(line, 0, block.as_bytes());
        stamp.unlock_and_increment();
    }

    /// Overwrite a whole block, only if it was not written since `version`
    pub(crate) fn write_line_if(&self, line: usize, version: u64, block: &Block) -> bool {
        let stamp = &self.stamps[line];
        if !stamp.try_lock(version) {
            return false;
        }
        self.store_locked(line, 0, block.as_bytes());
        stamp.unlock_and_increment();
        true
    }

    /// Copy an arbitrary byte range out of the region, atomically per block
    pub(crate) fn read(&self, addr: SharedAddress, dst: &mut [u8]) {
        self.check_range(addr, dst.len());

        let mut done = 0;
        while done < dst.len() {
            let cur = addr.offset(done);
            let offset = cur.block_offset();
            let len = (BLOCK_SIZE - offset).min(dst.len() - done);

            let (block, _) = self.read_line(cur.block_index());
            dst[done..done + len].copy_from_slice(&block.as_bytes()[offset..offset + len]);
            done += len;
        }
    }

    /// Copy an arbitrary byte range into the region, atomically per block.
    ///
    /// Every block that is touched gets a new version, invalidating all reservations on it.
    pub(crate) fn write(&self, addr: SharedAddress, src: &[u8]) {
        self.check_range(addr, src.len());

        let mut done = 0;
        while done < src.len() {
            let cur = addr.offset(done);
            let offset = cur.block_offset();
            let len = (BLOCK_SIZE - offset).min(src.len() - done);

            let stamp = &self.stamps[cur.block_index()];
            stamp.lock();
            self.store_locked(cur.block_index(), offset, &src[done..done + len]);
            stamp.unlock_and_increment();
            done += len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_rounded_to_blocks() {
        let region = SharedRegion::new(200);
        assert_eq!(region.size(), 2 * BLOCK_SIZE);
        assert_eq!(region.num_blocks(), 2);
    }

    #[test]
    fn unaligned_write_read() {
        let region = SharedRegion::new(4 * BLOCK_SIZE);
        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();

        let addr = SharedAddress::new(61);
        region.write(addr, &data);

        let mut out = vec![0u8; 200];
        region.read(addr, &mut out);
        assert_eq!(out, data);

        // Bytes around the range are untouched
        let mut edge = [0xFFu8; 1];
        region.read(SharedAddress::new(60), &mut edge);
        assert_eq!(edge[0], 0);
        region.read(SharedAddress::new(261), &mut edge);
        assert_eq!(edge[0], 0);
    }

    #[test]
    fn write_bumps_version() {
        let region = SharedRegion::new(2 * BLOCK_SIZE);
        let (_, before) = region.read_line(1);
        region.write(SharedAddress::new(BLOCK_SIZE as u64 + 4), &[1, 2, 3, 4]);
        let (block, after) = region.read_line(1);
        assert_ne!(before, after);
        assert_eq!(block.read_u32(4), 0x04030201);

        // Block 0 was not touched
        let (_, untouched) = region.read_line(0);
        assert_eq!(untouched, 0);
    }

    #[test]
    fn conditional_write() {
        let region = SharedRegion::new(BLOCK_SIZE);
        let (mut block, version) = region.read_line(0);
        block.write_u32(0, 7);
        assert!(region.write_line_if(0, version, &block));
        // Same version can't be used twice
        assert!(!region.write_line_if(0, version, &block));
        assert_eq!(region.read_line(0).0.read_u32(0), 7);
    }

    #[test]
    fn alloc_zeroes_storage() {
        let region = SharedRegion::new(4 * BLOCK_SIZE);
        region.write(SharedAddress::ZERO, &[0xAB; 256]);

        let addr = region.alloc(200).unwrap();
        assert_eq!(addr, SharedAddress::ZERO);
        assert_eq!(region.allocated_bytes(), 2 * BLOCK_SIZE);

        let mut out = [0xFFu8; 256];
        region.read(addr, &mut out);
        assert!(out.iter().all(|byte| *byte == 0));

        region.free(addr, 200);
        assert_eq!(region.allocated_bytes(), 0);
        assert!(region.alloc(5 * BLOCK_SIZE).is_none());
    }

    #[test]
    #[should_panic]
    fn out_of_range() {
        let region = SharedRegion::new(BLOCK_SIZE);
        region.write(SharedAddress::new(120), &[0; 16]);
    }
}
