//! Sub-Arena - one bump-pointer partition with per-class free lists.
//!
//! A sub-arena never owns memory itself; it describes a fixed window of the
//! arena's region. Free lists are threaded through the `next` field of the
//! block headers inside that window, so pushing and popping touch exactly
//! one header.

use std::fmt;

use crate::branchless::{align_up, FREE_LIST_CLASSES};
use crate::bulk::CACHE_LINE;
use crate::error::{ArenaError, CorruptionReason, Result};
use crate::header::{BlockHeader, HEADER_SIZE, MAGIC_FREED, NULL_OFFSET};

/// Smallest block the arena ever carves (header + 1 byte, 16-aligned).
pub const MIN_BLOCK_SIZE: usize = 32;

/// Per-partition metadata: one hot cache line touched on every allocation,
/// one cold line of counters.
///
/// # Memory Layout
///
/// | Field         | Type     | Offset | Size |
/// |---------------|----------|--------|------|
/// | base          | u32      | 0      | 4    |
/// | total_size    | u32      | 4      | 4    |
/// | used_size     | u32      | 8      | 4    |
/// | next_offset   | u32      | 12     | 4    |
/// | free_heads    | [u32; 4] | 16     | 16   |
/// | access_bitmap | u64      | 32     | 8    |
/// | id            | u16      | 40     | 2    |
/// | numa_node     | u16      | 42     | 2    |
/// | align_shift   | u8       | 44     | 1    |
/// | color_cursor  | u8       | 45     | 1    |
/// | _reserved     | [u8; 18] | 46     | 18   |
/// | counters      | 4 x u64  | 64     | 32   |
#[repr(C)]
#[repr(align(64))]
#[derive(Clone, Copy)]
pub struct SubArena {
    // === Hot Data (touched on every allocation) ===
    /// Region offset where this sub-arena's data starts
    pub base: u32,

    /// Bytes available to this sub-arena
    pub total_size: u32,

    /// Bytes held by live blocks
    pub used_size: u32,

    /// Bump cursor, relative to `base`
    pub next_offset: u32,

    /// Free-list heads per size class (block-start region offsets)
    pub free_heads: [u32; FREE_LIST_CLASSES],

    /// One bit per cache line (mod 64) touched since the last reset
    pub access_bitmap: u64,

    pub id: u16,

    pub numa_node: u16,

    /// log2 of the alignment this sub-arena was created with
    pub align_shift: u8,

    /// Rotating cache-coloring slot
    pub color_cursor: u8,

    pub _reserved: [u8; 18],

    // === Cold Data (lifetime counters, survive reset) ===
    pub alloc_count: u64,
    pub free_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

// Compile-time assertion: two cache lines, hot line first
const _: () = assert!(
    std::mem::size_of::<SubArena>() == 2 * CACHE_LINE,
    "SubArena must be exactly two cache lines"
);

const _: () = assert!(
    std::mem::align_of::<SubArena>() == CACHE_LINE,
    "SubArena must be cache-line aligned"
);

impl SubArena {
    /// Describe the window `[base, base + total_size)` of the region.
    pub fn new(id: u16, base: u32, total_size: u32, numa_node: u16, alignment: usize) -> Self {
        Self {
            base,
            total_size,
            used_size: 0,
            next_offset: 0,
            free_heads: [NULL_OFFSET; FREE_LIST_CLASSES],
            access_bitmap: 0,
            id,
            numa_node,
            align_shift: alignment.trailing_zeros() as u8,
            color_cursor: 0,
            _reserved: [0; 18],
            alloc_count: 0,
            free_count: 0,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    /// Bytes left behind the bump cursor.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.total_size - self.next_offset
    }

    /// Region offset one past the last byte of this sub-arena.
    #[inline]
    pub fn end(&self) -> u32 {
        self.base + self.total_size
    }

    /// Returns true if `[start, start + size)` lies inside this sub-arena.
    #[inline]
    pub fn contains(&self, start: u32, size: u32) -> bool {
        start >= self.base && (start as u64 + size as u64) <= self.end() as u64
    }

    /// Where a bump of `size` bytes would start (relative), if it fits.
    #[inline]
    pub fn bump_start(&self, size: u32, alignment: usize, color: u32) -> Option<u32> {
        let start = align_up((self.next_offset + color) as usize, alignment) as u64;
        (start + size as u64 <= self.total_size as u64).then_some(start as u32)
    }

    /// Carve `size` bytes at the bump cursor. Returns the block-start
    /// region offset.
    #[inline]
    pub fn bump(&mut self, size: u32, alignment: usize, color: u32) -> Option<u32> {
        let start = self.bump_start(size, alignment, color)?;
        self.next_offset = start + size;
        self.used_size += size;
        self.alloc_count += 1;
        Some(self.base + start)
    }

    /// Pop the head of a free list if it can serve `size` bytes at
    /// `alignment`. Only the head is inspected.
    ///
    /// Returns the block-start region offset and the block's recorded size.
    #[inline]
    pub fn pop_free(
        &mut self,
        class: usize,
        bytes: &[u8],
        size: u32,
        alignment: usize,
    ) -> Result<Option<(u32, u32)>> {
        let head = self.free_heads[class];
        if head == NULL_OFFSET {
            return Ok(None);
        }
        let header = BlockHeader::read(bytes, head as usize);
        if !header.is_freed() || header.sub_arena != self.id {
            return Err(ArenaError::corruption(head, CorruptionReason::ForeignBlock));
        }
        if header.size < size || (head as usize + HEADER_SIZE) % alignment != 0 {
            return Ok(None);
        }
        self.free_heads[class] = header.next;
        self.used_size += header.size;
        self.alloc_count += 1;
        Ok(Some((head, header.size)))
    }

    /// Push a block (already validated) onto its class's free list.
    #[inline]
    pub fn push_free(&mut self, class: usize, bytes: &mut [u8], start: u32, header: BlockHeader) {
        let freed = BlockHeader {
            next: self.free_heads[class],
            magic: MAGIC_FREED,
            ..header
        };
        freed.write(bytes, start as usize);
        self.free_heads[class] = start;
        self.used_size = self.used_size.saturating_sub(header.size);
        self.free_count += 1;
    }

    /// Account a free of a block that is not recycled (huge class).
    #[inline]
    pub fn retire(&mut self, size: u32) {
        self.used_size = self.used_size.saturating_sub(size);
        self.free_count += 1;
    }

    /// Record a touch of the line holding region offset `offset`.
    ///
    /// Returns true if the line was already touched since the last reset
    /// (an estimated cache hit).
    #[inline]
    pub fn touch(&mut self, offset: u32) -> bool {
        let line = (offset.saturating_sub(self.base) as usize / CACHE_LINE) % 64;
        let bit = 1u64 << line;
        let hit = self.access_bitmap & bit != 0;
        self.access_bitmap |= bit;
        self.cache_hits += hit as u64;
        self.cache_misses += !hit as u64;
        hit
    }

    /// Return to the empty state. Lifetime counters are kept.
    #[inline]
    pub fn reset(&mut self) {
        self.used_size = 0;
        self.next_offset = 0;
        self.free_heads = [NULL_OFFSET; FREE_LIST_CLASSES];
        self.access_bitmap = 0;
        self.color_cursor = 0;
    }

    /// Walk one free list, checking every entry.
    ///
    /// Returns the number of blocks on the list.
    pub fn walk_free_list(&self, class: usize, bytes: &[u8]) -> Result<usize> {
        let bound = self.total_size as usize / MIN_BLOCK_SIZE + 1;
        let mut cursor = self.free_heads[class];
        let mut count = 0;
        while cursor != NULL_OFFSET {
            if count > bound {
                return Err(ArenaError::corruption(cursor, CorruptionReason::FreeListCycle));
            }
            if !self.contains(cursor, HEADER_SIZE as u32) {
                return Err(ArenaError::corruption(cursor, CorruptionReason::OutOfBounds));
            }
            let header = BlockHeader::read(bytes, cursor as usize);
            if !header.is_freed() {
                return Err(ArenaError::corruption(cursor, CorruptionReason::BadMagic));
            }
            if header.sub_arena != self.id || header.class as usize != class {
                return Err(ArenaError::corruption(cursor, CorruptionReason::ForeignBlock));
            }
            if !self.contains(cursor, header.size) {
                return Err(ArenaError::corruption(cursor, CorruptionReason::OutOfBounds));
            }
            cursor = header.next;
            count += 1;
        }
        Ok(count)
    }
}

impl fmt::Debug for SubArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubArena")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("total_size", &self.total_size)
            .field("used_size", &self.used_size)
            .field("next_offset", &self.next_offset)
            .field("free_heads", &self.free_heads)
            .field("numa_node", &self.numa_node)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branchless::SizeClass;
    use crate::error::ErrorKind;

    const BASE: u32 = 48;

    fn sub() -> (SubArena, Vec<u8>) {
        (SubArena::new(0, BASE, 1024, 0, 64), vec![0u8; 2048])
    }

    #[test]
    fn test_sub_arena_size() {
        assert_eq!(std::mem::size_of::<SubArena>(), 128);
        assert_eq!(std::mem::align_of::<SubArena>(), 64);
    }

    #[test]
    fn test_bump_until_full() {
        let (mut sa, _) = sub();
        let mut starts = Vec::new();
        while let Some(start) = sa.bump(64, 64, 0) {
            starts.push(start);
        }
        assert_eq!(starts.len(), 16);
        assert_eq!(starts[0], BASE);
        assert_eq!(starts[15], BASE + 15 * 64);
        assert_eq!(sa.remaining(), 0);
        assert_eq!(sa.used_size, 1024);
        assert!(sa.used_size <= sa.total_size);
    }

    #[test]
    fn test_bump_respects_alignment_and_color() {
        let (mut sa, _) = sub();
        assert_eq!(sa.bump(32, 16, 0), Some(BASE));
        // Cursor at 32 rounds up to 64 for 64-byte alignment
        assert_eq!(sa.bump(64, 64, 0), Some(BASE + 64));
        // Color pushes the next block one further line
        assert_eq!(sa.bump(64, 64, 64), Some(BASE + 192));
    }

    #[test]
    fn test_push_pop_free() {
        let (mut sa, mut bytes) = sub();
        let start = sa.bump(64, 64, 0).unwrap();
        let header = BlockHeader::live(64, 0, SizeClass::Small, 0);
        header.write(&mut bytes, start as usize);

        sa.push_free(1, &mut bytes, start, header);
        assert_eq!(sa.used_size, 0);
        assert_eq!(sa.walk_free_list(1, &bytes).unwrap(), 1);

        // Too big for the head: falls through
        assert_eq!(sa.pop_free(1, &bytes, 128, 64).unwrap(), None);
        assert_eq!(sa.pop_free(1, &bytes, 64, 64).unwrap(), Some((start, 64)));
        assert_eq!(sa.free_heads[1], NULL_OFFSET);
        assert_eq!(sa.used_size, 64);
    }

    #[test]
    fn test_pop_rejects_foreign_head() {
        let (mut sa, mut bytes) = sub();
        let start = sa.bump(64, 64, 0).unwrap();
        // Live header where a freed one is expected
        BlockHeader::live(64, 0, SizeClass::Small, 0).write(&mut bytes, start as usize);
        sa.free_heads[1] = start;
        let err = sa.pop_free(1, &bytes, 64, 64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_walk_detects_cycle() {
        let (mut sa, mut bytes) = sub();
        let a = sa.bump(64, 64, 0).unwrap();
        let b = sa.bump(64, 64, 0).unwrap();
        let mut ha = BlockHeader::live(64, 0, SizeClass::Small, 0);
        ha.magic = MAGIC_FREED;
        ha.next = b;
        let mut hb = ha;
        hb.next = a;
        ha.write(&mut bytes, a as usize);
        hb.write(&mut bytes, b as usize);
        sa.free_heads[1] = a;
        assert!(matches!(
            sa.walk_free_list(1, &bytes),
            Err(ArenaError::Corruption { reason: CorruptionReason::FreeListCycle, .. })
        ));
    }

    #[test]
    fn test_touch_estimates_hits() {
        let (mut sa, _) = sub();
        assert!(!sa.touch(BASE + 16));
        assert!(sa.touch(BASE + 40));
        assert!(!sa.touch(BASE + 80));
        assert_eq!(sa.cache_hits, 1);
        assert_eq!(sa.cache_misses, 2);
    }

    #[test]
    fn test_reset_keeps_counters() {
        let (mut sa, _) = sub();
        sa.bump(64, 64, 0).unwrap();
        sa.touch(BASE);
        sa.reset();
        assert_eq!(sa.next_offset, 0);
        assert_eq!(sa.used_size, 0);
        assert_eq!(sa.access_bitmap, 0);
        assert_eq!(sa.alloc_count, 1);
        assert_eq!(sa.cache_misses, 1);
    }
}
