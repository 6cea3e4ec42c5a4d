use parking_lot::Mutex;

/// Bitmap block allocator
///
/// Keeps track of which blocks of the shared region are in use.
/// Whenever memory is requested, the allocator will find a spot with enough contiguous blocks to store the allocation,
/// it will then mark these in a bitmap to keep track of which blocks are in use and which are available.
///
/// This only exists to back resource handles, it is not meant as a general purpose allocator.
pub(crate) struct BlockAllocator {
    bitmap     : Mutex<Vec<u8>>,
    num_blocks : usize,
}

impl BlockAllocator {
    /// Create an allocator managing `num_blocks` blocks
    pub fn new(num_blocks: usize) -> Self {
        Self {
            bitmap: Mutex::new(vec![0; (num_blocks + 7) / 8]),
            num_blocks,
        }
    }

    #[inline]
    fn is_set(bitmap: &[u8], bit: usize) -> bool {
        bitmap[bit / 8] & (0x80 >> (bit & 0x7)) != 0
    }

    fn mark_bits(bitmap: &mut [u8], first_bit: usize, num_bits: usize, set: bool) {
        assert!(num_bits != 0, "Can't mark 0 bits");

        for bit in first_bit..first_bit + num_bits {
            let mask = 0x80 >> (bit & 0x7);
            let byte = &mut bitmap[bit / 8];
            *byte = if set { *byte | mask } else { *byte & !mask };
        }
    }

    /// Allocate `num_blocks` contiguous blocks, returns the index of the first block
    pub fn alloc(&self, num_blocks: usize) -> Option<usize> {
        if num_blocks == 0 || num_blocks > self.num_blocks {
            return None;
        }

        let mut bitmap = self.bitmap.lock();
        let mut start = 0;
        'outer: while start + num_blocks <= self.num_blocks {
            for idx in start..start + num_blocks {
                if Self::is_set(&bitmap, idx) {
                    start = idx + 1;
                    continue 'outer;
                }
            }

            // If we get here, we found a space
            Self::mark_bits(&mut bitmap, start, num_blocks, true);
            return Some(start);
        }
        None
    }

    /// Return `num_blocks` blocks starting at `first_block` to the allocator
    pub fn dealloc(&self, first_block: usize, num_blocks: usize) {
        assert!(first_block + num_blocks <= self.num_blocks, "Cannot deallocate blocks that aren't owned by the allocator");

        let mut bitmap = self.bitmap.lock();
        debug_assert!((first_block..first_block + num_blocks).all(|bit| Self::is_set(&bitmap, bit)), "Double free of shared blocks");
        Self::mark_bits(&mut bitmap, first_block, num_blocks, false);
    }

    /// Get the number of blocks currently in use
    pub fn used_blocks(&self) -> usize {
        self.bitmap.lock().iter().map(|byte| byte.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::BlockAllocator;

    #[test]
    fn alloc_dealloc() {
        let alloc = BlockAllocator::new(16);

        let first = alloc.alloc(1).unwrap();
        assert_eq!(first, 0);
        assert_eq!(alloc.used_blocks(), 1);

        alloc.dealloc(first, 1);
        assert_eq!(alloc.used_blocks(), 0);
    }

    #[test]
    fn multi_allocs() {
        let alloc = BlockAllocator::new(16);

        let a = alloc.alloc(3).unwrap();
        let b = alloc.alloc(9).unwrap();
        let c = alloc.alloc(4).unwrap();
        assert_eq!((a, b, c), (0, 3, 12));
        assert!(alloc.alloc(1).is_none());

        alloc.dealloc(b, 9);
        let d = alloc.alloc(5).unwrap();
        assert_eq!(d, 3);
        let e = alloc.alloc(4).unwrap();
        assert_eq!(e, 8);
    }

    #[test]
    fn too_large() {
        let alloc = BlockAllocator::new(4);
        assert!(alloc.alloc(5).is_none());
        assert!(alloc.alloc(0).is_none());
    }
}
