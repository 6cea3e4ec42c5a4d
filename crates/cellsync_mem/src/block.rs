use core::fmt;
use static_assertions::{assert_eq_size, const_assert_eq};

use crate::BLOCK_SIZE;

/// A block-sized local buffer.
///
/// This is the local copy of a single block of shared memory, the only thing an execution unit can actually work on.
/// Fields inside of a block are stored little-endian, so every unit sees the same record layout.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, align(128))]
pub struct Block([u8; BLOCK_SIZE]);

assert_eq_size!(Block, [u8; BLOCK_SIZE]);
const_assert_eq!(core::mem::align_of::<Block>(), BLOCK_SIZE);

macro_rules! block_field_accessors {
    ($($read:ident, $write:ident, $ty:ty;)*) => {
        $(
            #[doc = concat!("Read a `", stringify!($ty), "` at the given byte offset")]
            #[inline]
            pub fn $read(&self, offset: usize) -> $ty {
                const SIZE : usize = core::mem::size_of::<$ty>();
                debug_assert!(offset % SIZE == 0, "Misaligned block field");
                let mut bytes = [0u8; SIZE];
                bytes.copy_from_slice(&self.0[offset..offset + SIZE]);
                <$ty>::from_le_bytes(bytes)
            }

            #[doc = concat!("Write a `", stringify!($ty), "` at the given byte offset")]
            #[inline]
            pub fn $write(&mut self, offset: usize, val: $ty) {
                const SIZE : usize = core::mem::size_of::<$ty>();
                debug_assert!(offset % SIZE == 0, "Misaligned block field");
                self.0[offset..offset + SIZE].copy_from_slice(&val.to_le_bytes());
            }
        )*
    };
}

impl Block {
    /// Create a block filled with zeros
    #[inline]
    pub const fn zeroed() -> Self {
        Self([0; BLOCK_SIZE])
    }

    /// Get the content of the block
    #[inline]
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    /// Get the content of the block mutably
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.0
    }

    block_field_accessors!{
        read_u8,  write_u8,  u8;
        read_u16, write_u16, u16;
        read_u32, write_u32, u32;
        read_i32, write_i32, i32;
        read_u64, write_u64, u64;
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Block [")?;
        for (idx, chunk) in self.0.chunks(16).enumerate() {
            if idx != 0 {
                f.write_str(" |")?;
            }
            for byte in chunk {
                f.write_fmt(format_args!(" {byte:02x}"))?;
            }
        }
        f.write_str(" ]")
    }
}
