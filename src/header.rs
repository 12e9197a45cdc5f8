//! Block Header - the 16 bytes in front of every allocation.
//!
//! Headers live inside the arena's region and are encoded little-endian at
//! fixed offsets, so reading and writing one is plain slice indexing.
//!
//! # Memory Layout
//!
//! | Field      | Type | Offset | Size |
//! |------------|------|--------|------|
//! | next       | u32  | 0      | 4    |
//! | size       | u32  | 4      | 4    |
//! | magic      | u32  | 8      | 4    |
//! | sub_arena  | u16  | 12     | 2    |
//! | class      | u8   | 14     | 1    |
//! | flags      | u8   | 15     | 1    |
//! | **Total**  |      |        | 16   |

use crate::branchless::SizeClass;

/// Bytes occupied by a header.
pub const HEADER_SIZE: usize = 16;

/// Sentinel for "no block" in free-list links and null pointers.
pub const NULL_OFFSET: u32 = u32::MAX;

/// Magic carried by a live block.
pub const MAGIC_LIVE: u32 = 0xA110_C8ED;

/// Magic carried by a block sitting on a free list.
pub const MAGIC_FREED: u32 = 0xF8EE_D0FF;

/// Header flag bits.
pub mod flags {
    /// Cache priority 0-3, stored for the analyzer; does not affect placement
    pub const PRIORITY_MASK: u8 = 0b0000_0011;
    /// Carved as part of a batch
    pub const BATCH: u8 = 1 << 2;
    /// Alignment shadow: `next` holds the real block's user offset
    pub const SHADOW: u8 = 1 << 3;
    /// Temporal-locality hint was given
    pub const TEMPORAL: u8 = 1 << 4;
    /// Spatial-locality hint was given
    pub const SPATIAL: u8 = 1 << 5;
    /// Payload was zeroed at allocation
    pub const ZEROED: u8 = 1 << 6;
}

/// Decoded block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Next free block (block-start offset) while on a free list
    pub next: u32,
    /// Total block size including this header
    pub size: u32,
    /// [`MAGIC_LIVE`] or [`MAGIC_FREED`]
    pub magic: u32,
    /// Owning sub-arena
    pub sub_arena: u16,
    /// Size class byte
    pub class: u8,
    /// [`flags`] bits
    pub flags: u8,
}

impl BlockHeader {
    /// A header for a freshly handed-out block.
    #[inline]
    pub const fn live(size: u32, sub_arena: u16, class: SizeClass, flags: u8) -> Self {
        Self {
            next: NULL_OFFSET,
            size,
            magic: MAGIC_LIVE,
            sub_arena,
            class: class as u8,
            flags,
        }
    }

    /// Decode the header starting at `at`.
    ///
    /// # Panics
    /// Panics if `at + HEADER_SIZE` exceeds `bytes`; callers bound-check first.
    #[inline]
    pub fn read(bytes: &[u8], at: usize) -> Self {
        let raw = &bytes[at..at + HEADER_SIZE];
        Self {
            next: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            size: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            magic: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            sub_arena: u16::from_le_bytes([raw[12], raw[13]]),
            class: raw[14],
            flags: raw[15],
        }
    }

    /// Encode this header at `at`.
    #[inline]
    pub fn write(&self, bytes: &mut [u8], at: usize) {
        let raw = &mut bytes[at..at + HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.next.to_le_bytes());
        raw[4..8].copy_from_slice(&self.size.to_le_bytes());
        raw[8..12].copy_from_slice(&self.magic.to_le_bytes());
        raw[12..14].copy_from_slice(&self.sub_arena.to_le_bytes());
        raw[14] = self.class;
        raw[15] = self.flags;
    }

    /// Overwrite only the magic field at `at`.
    #[inline]
    pub fn write_magic(bytes: &mut [u8], at: usize, magic: u32) {
        bytes[at + 8..at + 12].copy_from_slice(&magic.to_le_bytes());
    }

    #[inline]
    pub const fn is_live(&self) -> bool {
        self.magic == MAGIC_LIVE
    }

    #[inline]
    pub const fn is_freed(&self) -> bool {
        self.magic == MAGIC_FREED
    }

    #[inline]
    pub const fn is_shadow(&self) -> bool {
        self.flags & flags::SHADOW != 0
    }

    /// Decoded size class, `None` if the byte is garbage.
    #[inline]
    pub const fn size_class(&self) -> Option<SizeClass> {
        SizeClass::from_u8(self.class)
    }

    /// Cache priority recorded at allocation (0-3).
    #[inline]
    pub const fn priority(&self) -> u8 {
        self.flags & flags::PRIORITY_MASK
    }

    /// Bytes the caller may use.
    #[inline]
    pub const fn usable(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }
}
