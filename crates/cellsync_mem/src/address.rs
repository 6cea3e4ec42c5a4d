use core::fmt;

/// Size of a block: the unit of atomic transfer and reservation
pub const BLOCK_SIZE : usize = 128;

/// Location in the shared memory region.
///
/// A shared address is valid for every unit, but it can't be dereferenced, the data it points to has to be transferred into a local buffer first.
/// An address carries no ownership, any number of units may refer to the same address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SharedAddress(u64);

impl SharedAddress {
    /// Address of the first byte of the region
    pub const ZERO : SharedAddress = SharedAddress(0);

    /// Create an address from a raw byte offset into the shared region
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw byte offset
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Get the address `bytes` bytes further into the region
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// Align the address down to the start of the block containing it
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(BLOCK_SIZE as u64 - 1))
    }

    /// Get the offset of the address inside of its block
    #[inline]
    pub const fn block_offset(self) -> usize {
        (self.0 & (BLOCK_SIZE as u64 - 1)) as usize
    }

    /// Get the index of the block containing the address
    #[inline]
    pub const fn block_index(self) -> usize {
        (self.0 / BLOCK_SIZE as u64) as usize
    }

    /// Check if the address is aligned to `align` bytes
    #[inline]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 & (align as u64 - 1) == 0
    }

    /// Check if the address lies on a block boundary
    #[inline]
    pub const fn is_block_aligned(self) -> bool {
        self.is_aligned_to(BLOCK_SIZE)
    }
}

impl fmt::Debug for SharedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("SharedAddress({:#x})", self.0))
    }
}

impl fmt::Display for SharedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#010x}", self.0))
    }
}

/// Round `size` up to a multiple of the block size
#[inline]
pub const fn round_to_blocks(size: usize) -> usize {
    (size + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
}
