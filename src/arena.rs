//! Arena Allocator - bounded-latency allocation from an L1-sized region.
//!
//! The arena acquires one region at creation and never grows it. The region
//! is split into equal sub-arenas, each a bump pointer plus four free lists.
//! Every operation on the allocation path does a fixed amount of work: one
//! free-list head check, then at most one pass over the active sub-arenas.
//!
//! # Region Layout
//!
//! ```text
//! offset 0        48                48+S              48+2S
//! | (unused) | sub-arena 0      | sub-arena 1      | ...
//!            | hdr | payload ...| hdr | payload ...|
//! ```
//!
//! Sub-arena data starts 16 bytes before a cache-line boundary and every
//! sub-arena size `S` is a multiple of 64, so a header placed at a
//! 64-aligned relative offset puts the payload exactly on a cache line.
//! Pointers handed out are [`ArenaPtr`]s: offsets into the region.

use std::fmt;
use std::hash::{Hash, Hasher};

use arrayvec::ArrayVec;
use rustc_hash::FxHasher;
use tracing::{debug, info, trace, warn};

use crate::analyzer::{AnalysisMode, AnalyzerConfig, L1Analysis, L1Analyzer, DEFAULT_HISTORY_LINES};
use crate::branchless::{align_up, is_power_of_two, size_class, SizeClass};
use crate::bulk::{self, BulkPath, FillPattern, Locality, CACHE_LINE};
use crate::cache_sim::CacheGeometry;
use crate::config::{
    check_alignment, check_coloring_stride, check_prefetch_distance, check_temporal_locality, ArenaConfig,
    MAX_PREFETCH_DISTANCE,
};
use crate::error::{ArenaError, CorruptionReason, Result};
use crate::event::{EventRing, MemoryAccessEvent};
use crate::header::{flags, BlockHeader, HEADER_SIZE, MAGIC_FREED, NULL_OFFSET};
use crate::region::{current_numa_node, default_provider, BackingProvider, Region, RegionOptions, REGION_ALIGN};
use crate::stats::{Counters, PerformanceMetrics, SubArenaStats};
use crate::sub_arena::SubArena;

/// Region offset where sub-arena 0 begins.
pub const DATA_START: usize = CACHE_LINE - HEADER_SIZE;

/// Lines remembered in the prefetch queue.
pub const PREFETCH_QUEUE_LEN: usize = 2 * MAX_PREFETCH_DISTANCE as usize;

/// Lines hinted on each side of a spatial-locality allocation.
const SPATIAL_NEIGHBOUR_LINES: usize = 2;

/// L1 sets tracked for coloring: one page spans every set of a 32 KiB
/// 8-way cache.
const COLOR_SETS: usize = REGION_ALIGN / CACHE_LINE;

/// A block handed out by an [`Arena`]: the payload's offset in the region.
///
/// Like a 32-bit arena index, it is half the size of a raw pointer and
/// stays meaningful only for the arena that produced it, until that arena
/// is reset or destroyed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaPtr(u32);

impl ArenaPtr {
    /// The null pointer.
    pub const NULL: Self = Self(NULL_OFFSET);

    /// Rebuild a pointer from a stored offset. The arena validates it on use.
    #[inline]
    pub const fn from_offset(offset: u32) -> Self {
        Self(offset)
    }

    /// Region offset of the first payload byte.
    #[inline]
    pub const fn offset(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_OFFSET
    }
}

impl fmt::Debug for ArenaPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ArenaPtr(NULL)")
        } else {
            write!(f, "ArenaPtr({:#x})", self.0)
        }
    }
}

/// Expected lifetime of a hinted allocation. Selects how aggressively its
/// lines are kept in cache when prefetched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// Used once, then dropped
    Transient,
    /// Lives for the current work unit
    #[default]
    Scoped,
    /// Lives until the arena is reset
    Persistent,
}

impl Lifetime {
    #[inline]
    fn locality(self, temporal_hint: u8) -> Locality {
        match self {
            Lifetime::Transient => Locality::NonTemporal,
            Lifetime::Scoped => Locality::from_hint(temporal_hint),
            Lifetime::Persistent => Locality::High,
        }
    }
}

/// An allocation request carrying cache hints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocRequest {
    pub size: usize,
    /// Requested alignment; 0 uses the arena's configured alignment
    pub alignment: usize,
    pub lifetime: Lifetime,
    /// Prefetch the whole block after placing it
    pub temporal_locality: bool,
    /// Prefetch the neighbouring lines as well
    pub spatial_locality: bool,
    /// 0 (lowest) to 3, recorded in the header
    pub cache_priority: u8,
}

impl AllocRequest {
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            alignment: 0,
            lifetime: Lifetime::Scoped,
            temporal_locality: false,
            spatial_locality: false,
            cache_priority: 0,
        }
    }

    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub const fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub const fn with_temporal_locality(mut self) -> Self {
        self.temporal_locality = true;
        self
    }

    pub const fn with_spatial_locality(mut self) -> Self {
        self.spatial_locality = true;
        self
    }

    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.cache_priority = priority;
        self
    }
}

/// Where a block landed.
#[derive(Clone, Copy, Debug)]
struct Placed {
    user: u32,
    sub: usize,
    block: u32,
}

/// A live header found behind a pointer.
#[derive(Clone, Copy, Debug)]
struct Resolved {
    /// User offset of the underlying block
    user: u32,
    header: BlockHeader,
    /// Header offset of the alignment shadow, if the pointer had one
    shadow: Option<u32>,
    /// Bytes usable from the pointer the caller holds
    usable: usize,
}

/// Bounded-latency arena allocator.
///
/// An arena is owned by exactly one worker. It may move between threads
/// but is not `Sync`; share it only through external single-writer
/// handoff.
pub struct Arena {
    config: ArenaConfig,
    region: Region,
    sub_arenas: Vec<SubArena>,
    sub_size: usize,

    // === Placement state ===
    /// Sub-arena tried first
    active: usize,
    /// Sub-arenas eligible for placement (a prefix of `sub_arenas`)
    active_count: usize,
    /// L1 set of the last block handed out; coloring steers the next
    /// bumped block away from it
    last_cache_set: u32,
    /// Incremented on every recorded operation
    sequence: u64,
    /// Region offsets of recently prefetched lines
    prefetch_queue: ArrayVec<u32, PREFETCH_QUEUE_LEN>,

    // === Observability ===
    counters: Counters,
    events: EventRing,

    zero_pattern: FillPattern,
    poison_pattern: FillPattern,
}

impl Arena {
    /// Create an arena on the platform's default backing memory.
    pub fn new(config: ArenaConfig) -> Result<Self> {
        Self::with_provider(config, default_provider())
    }

    /// Create an arena on memory from `provider`.
    pub fn with_provider(config: ArenaConfig, provider: Box<dyn BackingProvider>) -> Result<Self> {
        let config = config.validate()?;
        let sub_size = config.sub_arena_size();
        let count = config.sub_arena_count;
        let numa_node = config.numa_local.then(current_numa_node);
        let options = RegionOptions {
            huge_pages: config.huge_pages,
            numa_node,
        };

        let mut region = Region::new(DATA_START + count * sub_size, options, provider)?;
        region.prefault();

        let sub_arenas = (0..count)
            .map(|i| {
                SubArena::new(
                    i as u16,
                    (DATA_START + i * sub_size) as u32,
                    sub_size as u32,
                    numa_node.unwrap_or(0) as u16,
                    config.alignment,
                )
            })
            .collect();

        debug!(
            arena_id = config.arena_id,
            working_set = config.working_set_size,
            sub_arenas = count,
            sub_arena_size = sub_size,
            provider = region.provider_name(),
            "arena created"
        );

        Ok(Self {
            events: EventRing::with_capacity(if config.track_accesses { config.event_window } else { 1 }),
            config,
            region,
            sub_arenas,
            sub_size,
            active: 0,
            active_count: count,
            last_cache_set: 0,
            sequence: 0,
            prefetch_queue: ArrayVec::new(),
            counters: Counters::default(),
            zero_pattern: FillPattern::ZERO,
            poison_pattern: FillPattern::POISON,
        })
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate `size` bytes aligned to `max(alignment, configured)`.
    /// An `alignment` of 0 means the configured alignment.
    ///
    /// # Complexity
    /// O(1) free-list check, then O(active sub-arenas) bump search.
    #[inline]
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<ArenaPtr> {
        self.place(size, alignment, 0)
    }

    /// Allocate with cache hints. Temporal locality prefetches the whole
    /// block; spatial locality also prefetches two lines either side.
    pub fn allocate_with_hints(&mut self, request: &AllocRequest) -> Result<ArenaPtr> {
        if request.cache_priority > flags::PRIORITY_MASK {
            return Err(ArenaError::invalid("cache priority must be 0-3"));
        }
        let mut hint = request.cache_priority;
        if request.temporal_locality {
            hint |= flags::TEMPORAL;
        }
        if request.spatial_locality {
            hint |= flags::SPATIAL;
        }

        let ptr = self.place(request.size, request.alignment, hint)?;

        let locality = request.lifetime.locality(self.config.temporal_locality);
        let base = self.region.as_slice().as_ptr();
        let offset = ptr.offset() as usize;
        if request.temporal_locality {
            bulk::prefetch_range(base.wrapping_add(offset), request.size, locality);
        }
        if request.spatial_locality {
            let span = SPATIAL_NEIGHBOUR_LINES * CACHE_LINE;
            let from = offset.saturating_sub(span);
            let to = (offset + request.size + span).min(self.region.len());
            bulk::prefetch_range(base.wrapping_add(from), to - from, locality);
        }
        Ok(ptr)
    }

    /// Allocate `size` bytes and zero them.
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<ArenaPtr> {
        let ptr = self.place(size, 0, flags::ZEROED)?;
        let start = ptr.offset() as usize;
        bulk::fill_pattern(&mut self.region.as_mut_slice()[start..start + size], &self.zero_pattern);
        Ok(ptr)
    }

    /// Place every block contiguously in one sub-arena, or none at all.
    ///
    /// Consecutive pointers are exactly one aligned block apart.
    pub fn allocate_batch(&mut self, sizes: &[usize]) -> Result<Vec<ArenaPtr>> {
        if sizes.is_empty() {
            return Err(ArenaError::invalid("empty batch"));
        }
        if sizes.contains(&0) {
            return Err(ArenaError::invalid("zero-sized allocation"));
        }

        let alignment = self.config.alignment;
        let mut total = 0usize;
        for &size in sizes {
            if size > self.sub_size {
                return Err(self.out_of_memory(size));
            }
            total += align_up(size + HEADER_SIZE, alignment);
        }
        if total > self.sub_size {
            return Err(self.out_of_memory(total));
        }

        let Some((idx, color)) = self.find_room(total as u32, alignment) else {
            return Err(self.out_of_memory(total));
        };
        let Some(start) = self.sub_arenas[idx].bump(total as u32, alignment, color) else {
            return Err(self.out_of_memory(total));
        };
        self.advance_color(idx);
        self.active = idx;
        // `bump` counted one allocation for the whole run
        self.sub_arenas[idx].alloc_count += sizes.len() as u64 - 1;

        let mut ptrs = Vec::with_capacity(sizes.len());
        let mut cursor = start;
        for &size in sizes {
            let block = align_up(size + HEADER_SIZE, alignment) as u32;
            BlockHeader::live(block, idx as u16, size_class(size), flags::BATCH)
                .write(self.region.as_mut_slice(), cursor as usize);
            let user = cursor + HEADER_SIZE as u32;
            self.counters.on_alloc(size, block);
            self.sub_arenas[idx].touch(user);
            self.record(user, size, true);
            ptrs.push(ArenaPtr(user));
            cursor += block;
        }

        self.counters.batch_allocations += 1;
        self.counters.bump_allocations += 1;
        self.note_cache_set(start + HEADER_SIZE as u32);
        self.prefetch_ahead(cursor);
        Ok(ptrs)
    }

    /// Free a block. Freeing twice, or freeing something that is not a live
    /// block of this arena, is reported as corruption.
    pub fn free(&mut self, ptr: ArenaPtr) -> Result<()> {
        let found = self.resolve(ptr)?;
        let header = found.header;
        let start = found.user - HEADER_SIZE as u32;
        let bytes = self.region.as_mut_slice();

        if self.config.poison_on_free {
            let end = start as usize + header.size as usize;
            bulk::fill_pattern(&mut bytes[found.user as usize..end], &self.poison_pattern);
        }
        if let Some(at) = found.shadow {
            BlockHeader::write_magic(bytes, at as usize, MAGIC_FREED);
        }

        let sa = &mut self.sub_arenas[header.sub_arena as usize];
        match header.size_class().and_then(SizeClass::free_list) {
            Some(list) => sa.push_free(list, bytes, start, header),
            None => {
                // Huge blocks wait for the next reset
                BlockHeader::write_magic(bytes, start as usize, MAGIC_FREED);
                sa.retire(header.size);
            }
        }
        sa.touch(start);

        self.counters.on_free(header.size);
        self.record(start, HEADER_SIZE, true);
        Ok(())
    }

    /// Resize a block.
    ///
    /// - A null `ptr` behaves like [`allocate`](Self::allocate).
    /// - A `new_size` of 0 frees the block and returns [`ArenaPtr::NULL`].
    /// - A `new_size` within the block's usable capacity returns `ptr`.
    /// - Otherwise a new block is allocated, the old payload copied over and
    ///   the old block freed. On failure the old block is untouched.
    pub fn realloc(&mut self, ptr: ArenaPtr, new_size: usize) -> Result<ArenaPtr> {
        if ptr.is_null() {
            return self.allocate(new_size, 0);
        }
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(ArenaPtr::NULL);
        }

        let found = self.resolve(ptr)?;
        if new_size <= found.usable {
            return Ok(ptr);
        }

        let moved = self.allocate(new_size, 0)?;
        self.move_payload(ptr.offset() as usize, moved.offset() as usize, found.usable);
        self.free(ptr)?;
        self.counters.reallocs += 1;
        Ok(moved)
    }

    /// Bytes the caller may use behind `ptr`.
    pub fn usable_size(&self, ptr: ArenaPtr) -> Result<usize> {
        self.resolve_inner(ptr).map(|found| found.usable)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Forget every allocation. All outstanding pointers become invalid.
    ///
    /// Lifetime counters survive; bump cursors, free lists, the prefetch
    /// queue and the event window do not.
    pub fn reset(&mut self) {
        for sa in &mut self.sub_arenas {
            sa.reset();
        }
        self.active = 0;
        self.last_cache_set = 0;
        self.prefetch_queue.clear();
        self.events.clear();
        self.counters.on_reset();
        debug!(arena_id = self.config.arena_id, resets = self.counters.resets, "arena reset");
    }

    /// Release the region.
    pub fn destroy(self) {
        debug!(
            arena_id = self.config.arena_id,
            allocations = self.counters.allocations,
            "arena destroyed"
        );
        drop(self);
    }

    /// Touch every page of the region so first use does not fault.
    pub fn warm_up(&mut self) {
        self.region.prefault();
    }

    /// Walk every free list and check the sub-arena invariants.
    ///
    /// Returns the number of blocks on free lists.
    pub fn validate(&self) -> Result<usize> {
        let bytes = self.region.as_slice();
        let mut free_blocks = 0;
        for sa in &self.sub_arenas {
            if sa.used_size > sa.total_size || sa.next_offset > sa.total_size {
                return Err(ArenaError::corruption(sa.base, CorruptionReason::OutOfBounds));
            }
            for class in 0..sa.free_heads.len() {
                free_blocks += sa.walk_free_list(class, bytes)?;
            }
        }
        Ok(free_blocks)
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Snapshot of counters and per-sub-arena state.
    pub fn get_stats(&self) -> PerformanceMetrics {
        let sub_arenas: Vec<SubArenaStats> = self.sub_arenas.iter().map(SubArenaStats::from).collect();
        PerformanceMetrics {
            counters: self.counters,
            active_sub_arenas: self.active_count,
            region_bytes: self.region.len(),
            estimated_cache_hits: sub_arenas.iter().map(|s| s.estimated_hits).sum(),
            estimated_cache_misses: sub_arenas.iter().map(|s| s.estimated_misses).sum(),
            sub_arenas,
        }
    }

    /// Run the L1 analyzer over the recent event window.
    pub fn analyze_cache(&self) -> Result<L1Analysis> {
        self.analyze_with(CacheGeometry::default())
    }

    /// Run the L1 analyzer for a specific cache geometry.
    pub fn analyze_with(&self, geometry: CacheGeometry) -> Result<L1Analysis> {
        let mut analyzer = L1Analyzer::new(AnalyzerConfig {
            geometry,
            window: self.events.capacity(),
            mode: AnalysisMode::Batched,
            history_lines: DEFAULT_HISTORY_LINES.max(geometry.lines()),
        })?;
        analyzer.record_batch(self.events.iter());
        Ok(analyzer.analyze())
    }

    /// Access events recorded since the last reset (bounded window).
    #[inline]
    pub fn recent_events(&self) -> &EventRing {
        &self.events
    }

    /// Hash of the placement state, equal for arenas that have seen the
    /// same operation sequence since their last reset.
    pub fn state_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.active.hash(&mut hasher);
        self.active_count.hash(&mut hasher);
        for sa in &self.sub_arenas {
            sa.next_offset.hash(&mut hasher);
            sa.used_size.hash(&mut hasher);
            sa.free_heads.hash(&mut hasher);
        }
        self.counters.bytes_in_use.hash(&mut hasher);
        hasher.finish()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    #[inline]
    pub fn sub_arena(&self, index: usize) -> Option<&SubArena> {
        self.sub_arenas.get(index)
    }

    #[inline]
    pub fn sub_arenas(&self) -> &[SubArena] {
        &self.sub_arenas
    }

    /// Bytes per sub-arena.
    #[inline]
    pub fn sub_arena_size(&self) -> usize {
        self.sub_size
    }

    #[inline]
    pub fn active_sub_arena(&self) -> usize {
        self.active
    }

    #[inline]
    pub fn active_sub_arenas(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn region_len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn is_huge_backed(&self) -> bool {
        self.region.is_huge()
    }

    /// Operations recorded since creation.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// L1 set holding the start of the last block handed out.
    #[inline]
    pub fn last_cache_set(&self) -> u32 {
        self.last_cache_set
    }

    /// L1 set `ptr` falls in.
    #[inline]
    pub fn cache_set_of(&self, ptr: ArenaPtr) -> u32 {
        ((self.address_of(ptr) / CACHE_LINE) % COLOR_SETS) as u32
    }

    /// [`flags`] recorded in a live block's header. For over-aligned
    /// blocks these are the real block's flags, never the shadow bit.
    pub fn block_flags(&self, ptr: ArenaPtr) -> Result<u8> {
        self.resolve_inner(ptr).map(|found| found.header.flags)
    }

    /// Cache priority (0-3) a live block was allocated with.
    pub fn block_priority(&self, ptr: ArenaPtr) -> Result<u8> {
        self.resolve_inner(ptr).map(|found| found.header.priority())
    }

    /// Region offsets of recently prefetched lines, oldest first.
    #[inline]
    pub fn prefetch_queue(&self) -> &[u32] {
        &self.prefetch_queue
    }

    /// Absolute address of `ptr`.
    #[inline]
    pub fn address_of(&self, ptr: ArenaPtr) -> usize {
        self.region.base_addr() + ptr.offset() as usize
    }

    /// `len` bytes starting at `ptr`.
    pub fn bytes(&self, ptr: ArenaPtr, len: usize) -> Result<&[u8]> {
        let start = self.payload_range(ptr, len)?;
        Ok(&self.region.as_slice()[start..start + len])
    }

    /// `len` bytes starting at `ptr`, mutably.
    pub fn bytes_mut(&mut self, ptr: ArenaPtr, len: usize) -> Result<&mut [u8]> {
        let start = self.payload_range(ptr, len)?;
        Ok(&mut self.region.as_mut_slice()[start..start + len])
    }

    // ========================================================================
    // Runtime tunables
    // ========================================================================

    pub fn set_prefetch_distance(&mut self, distance: u8) -> Result<()> {
        check_prefetch_distance(distance)?;
        self.config.prefetch_distance = distance;
        Ok(())
    }

    /// Applies to allocations made from now on.
    pub fn set_alignment(&mut self, alignment: usize) -> Result<()> {
        check_alignment(alignment)?;
        self.config.alignment = alignment;
        for sa in &mut self.sub_arenas {
            sa.align_shift = alignment.trailing_zeros() as u8;
        }
        Ok(())
    }

    pub fn set_cache_coloring(&mut self, enabled: bool, stride: usize) -> Result<()> {
        check_coloring_stride(stride)?;
        self.config.cache_coloring = enabled;
        self.config.coloring_stride = stride;
        Ok(())
    }

    pub fn set_temporal_locality(&mut self, hint: u8) -> Result<()> {
        check_temporal_locality(hint)?;
        self.config.temporal_locality = hint;
        Ok(())
    }

    pub fn set_streaming(&mut self, streaming: bool) {
        self.config.streaming = streaming;
    }

    /// Restrict placement to the first `count` sub-arenas. Resets the
    /// arena first, invalidating every outstanding pointer.
    pub fn set_active_sub_arenas(&mut self, count: usize) -> Result<()> {
        if count == 0 || count > self.sub_arenas.len() {
            return Err(ArenaError::invalid("active sub-arena count out of range"));
        }
        self.reset();
        self.active_count = count;
        info!(arena_id = self.config.arena_id, active = count, "active sub-arenas changed");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn place(&mut self, size: usize, alignment: usize, hint: u8) -> Result<ArenaPtr> {
        if size == 0 {
            return Err(ArenaError::invalid("zero-sized allocation"));
        }
        if !is_power_of_two(alignment) {
            return Err(ArenaError::invalid("alignment must be a power of two"));
        }
        let alignment = alignment.max(self.config.alignment);
        if alignment > REGION_ALIGN {
            return Err(ArenaError::invalid("alignment exceeds the page size"));
        }

        let placed = if alignment <= CACHE_LINE {
            self.carve(size, alignment, hint)?
        } else {
            self.carve_overaligned(size, alignment, hint)?
        };

        self.counters.on_alloc(size, placed.block);
        self.sub_arenas[placed.sub].touch(placed.user);
        self.note_cache_set(placed.user);
        self.record(placed.user, size, true);
        Ok(ArenaPtr(placed.user))
    }

    /// Serve `size` bytes at an alignment of at most one cache line.
    #[inline]
    fn carve(&mut self, size: usize, alignment: usize, hint: u8) -> Result<Placed> {
        if size > self.sub_size {
            return Err(self.out_of_memory(size));
        }
        let class = size_class(size);
        let block = align_up(size + HEADER_SIZE, alignment);
        if block > self.sub_size {
            return Err(self.out_of_memory(size));
        }
        let block = block as u32;

        if let Some(list) = class.free_list() {
            let idx = self.active;
            match self.sub_arenas[idx].pop_free(list, self.region.as_slice(), block, alignment) {
                Ok(Some((start, recorded))) => {
                    BlockHeader::live(recorded, idx as u16, class, hint)
                        .write(self.region.as_mut_slice(), start as usize);
                    self.counters.free_list_hits += 1;
                    return Ok(Placed {
                        user: start + HEADER_SIZE as u32,
                        sub: idx,
                        block: recorded,
                    });
                }
                Ok(None) => {}
                Err(err) => return Err(self.on_corruption(err)),
            }
        }

        let Some((idx, color)) = self.find_room(block, alignment) else {
            return Err(self.out_of_memory(size));
        };
        let Some(start) = self.sub_arenas[idx].bump(block, alignment, color) else {
            return Err(self.out_of_memory(size));
        };
        self.advance_color(idx);
        self.active = idx;
        BlockHeader::live(block, idx as u16, class, hint).write(self.region.as_mut_slice(), start as usize);
        self.counters.bump_allocations += 1;
        self.prefetch_ahead(start + block);
        Ok(Placed {
            user: start + HEADER_SIZE as u32,
            sub: idx,
            block,
        })
    }

    /// Over-allocate by `alignment` bytes and hand out the first aligned
    /// offset inside. A shadow header in front of that offset points back
    /// to the real block.
    fn carve_overaligned(&mut self, size: usize, alignment: usize, hint: u8) -> Result<Placed> {
        let padded = size.saturating_add(alignment);
        let inner = self.carve(padded, self.config.alignment, hint)?;
        let aligned = align_up(inner.user as usize, alignment) as u32;
        if aligned == inner.user {
            return Ok(inner);
        }

        let bytes = self.region.as_mut_slice();
        let real = BlockHeader::read(bytes, (inner.user - HEADER_SIZE as u32) as usize);
        let block_end = inner.user - HEADER_SIZE as u32 + inner.block;
        let shadow = BlockHeader {
            next: inner.user,
            size: block_end - aligned + HEADER_SIZE as u32,
            flags: real.flags | flags::SHADOW,
            ..real
        };
        shadow.write(bytes, (aligned - HEADER_SIZE as u32) as usize);
        Ok(Placed { user: aligned, ..inner })
    }

    /// Round-robin search, starting at the active sub-arena, for one whose
    /// bump cursor can take `size` bytes.
    #[inline]
    fn find_room(&self, size: u32, alignment: usize) -> Option<(usize, u32)> {
        (0..self.active_count)
            .map(|step| (self.active + step) % self.active_count)
            .find_map(|idx| {
                let color = self.color_for(idx, alignment);
                self.sub_arenas[idx]
                    .bump_start(size, alignment, color)
                    .map(|_| (idx, color))
            })
    }

    /// Color offset for the next bump in sub-arena `idx`. The rotating slot
    /// is skipped when it would start the block in the last-used set.
    #[inline]
    fn color_for(&self, idx: usize, alignment: usize) -> u32 {
        if !self.config.cache_coloring {
            return 0;
        }
        let slots = (self.config.coloring_stride / CACHE_LINE).max(1);
        let sa = &self.sub_arenas[idx];
        let slot = sa.color_cursor as usize % slots;
        let color = (slot * CACHE_LINE) as u32;
        if slots > 1 {
            let start = sa.base as usize + align_up((sa.next_offset + color) as usize, alignment);
            if self.cache_set_of(ArenaPtr((start + HEADER_SIZE) as u32)) == self.last_cache_set {
                return (((slot + 1) % slots) * CACHE_LINE) as u32;
            }
        }
        color
    }

    #[inline]
    fn advance_color(&mut self, idx: usize) {
        if self.config.cache_coloring {
            let sa = &mut self.sub_arenas[idx];
            sa.color_cursor = sa.color_cursor.wrapping_add(1);
        }
    }

    #[inline]
    fn note_cache_set(&mut self, user: u32) {
        self.last_cache_set = self.cache_set_of(ArenaPtr(user));
    }

    /// Hint the lines following a freshly bumped block.
    #[inline]
    fn prefetch_ahead(&mut self, from: u32) {
        let distance = self.config.prefetch_distance as usize;
        if distance == 0 {
            return;
        }
        let locality = Locality::from_hint(self.config.temporal_locality);
        let base = self.region.as_slice().as_ptr();
        let first = align_up(from as usize, CACHE_LINE);
        for line in 0..distance {
            let offset = first + line * CACHE_LINE;
            if offset >= self.region.len() {
                break;
            }
            bulk::prefetch(base.wrapping_add(offset), locality);
            if self.prefetch_queue.is_full() {
                self.prefetch_queue.remove(0);
            }
            self.prefetch_queue.push(offset as u32);
        }
    }

    #[inline]
    fn record(&mut self, offset: u32, size: usize, is_write: bool) {
        self.sequence += 1;
        if self.config.track_accesses {
            let address = self.region.base_addr() as u64 + offset as u64;
            let size = size.min(u32::MAX as usize) as u32;
            self.events
                .push(MemoryAccessEvent::new(address, size, is_write, self.sequence));
        }
    }

    fn resolve(&mut self, ptr: ArenaPtr) -> Result<Resolved> {
        let found = self.resolve_inner(ptr);
        found.map_err(|err| self.on_corruption(err))
    }

    fn resolve_inner(&self, ptr: ArenaPtr) -> Result<Resolved> {
        let at = self.header_offset(ptr)?;
        let bytes = self.region.as_slice();
        let header = BlockHeader::read(bytes, at as usize);
        self.check_live(at, &header)?;
        if !header.is_shadow() {
            return Ok(Resolved {
                user: ptr.offset(),
                header,
                shadow: None,
                usable: header.usable(),
            });
        }

        if header.next >= ptr.offset() {
            return Err(ArenaError::corruption(at, CorruptionReason::OutOfBounds));
        }
        let real_at = self.header_offset(ArenaPtr(header.next))?;
        let real = BlockHeader::read(bytes, real_at as usize);
        self.check_live(real_at, &real)?;
        if real.is_shadow() {
            return Err(ArenaError::corruption(real_at, CorruptionReason::BadMagic));
        }
        Ok(Resolved {
            user: header.next,
            header: real,
            shadow: Some(at),
            usable: header.usable(),
        })
    }

    /// Header offset for a pointer, if the header would lie in a sub-arena.
    #[inline]
    fn header_offset(&self, ptr: ArenaPtr) -> Result<u32> {
        if ptr.is_null() {
            return Err(ArenaError::invalid("null pointer"));
        }
        let offset = ptr.offset() as usize;
        let data_end = DATA_START + self.sub_arenas.len() * self.sub_size;
        if offset < DATA_START + HEADER_SIZE || offset > data_end {
            return Err(ArenaError::corruption(ptr.offset(), CorruptionReason::OutOfBounds));
        }
        Ok((offset - HEADER_SIZE) as u32)
    }

    #[inline]
    fn check_live(&self, at: u32, header: &BlockHeader) -> Result<()> {
        if header.is_freed() {
            return Err(ArenaError::corruption(at, CorruptionReason::AlreadyFreed));
        }
        if !header.is_live() {
            return Err(ArenaError::corruption(at, CorruptionReason::BadMagic));
        }
        let Some(sa) = self.sub_arenas.get(header.sub_arena as usize) else {
            return Err(ArenaError::corruption(at, CorruptionReason::UnknownSubArena));
        };
        if header.size_class().is_none() {
            return Err(ArenaError::corruption(at, CorruptionReason::BadSizeClass));
        }
        // Blocks past the bump cursor predate the last reset
        let carved_end = sa.base as u64 + sa.next_offset as u64;
        if (header.size as usize) < HEADER_SIZE
            || !sa.contains(at, header.size)
            || at as u64 + header.size as u64 > carved_end
        {
            return Err(ArenaError::corruption(at, CorruptionReason::OutOfBounds));
        }
        Ok(())
    }

    #[inline]
    fn payload_range(&self, ptr: ArenaPtr, len: usize) -> Result<usize> {
        if ptr.is_null() {
            return Err(ArenaError::invalid("null pointer"));
        }
        let start = ptr.offset() as usize;
        if start.checked_add(len).map_or(true, |end| end > self.region.len()) {
            return Err(ArenaError::invalid("range outside the arena"));
        }
        Ok(start)
    }

    /// Copy `len` payload bytes between two disjoint live blocks. Without
    /// the streaming flag the copy stays in the cache.
    fn move_payload(&mut self, from: usize, to: usize, len: usize) -> BulkPath {
        let streaming = self.config.streaming;
        let bytes = self.region.as_mut_slice();
        let (dst, src) = if from < to {
            let (lo, hi) = bytes.split_at_mut(to);
            (&mut hi[..len], &lo[from..from + len])
        } else {
            let (lo, hi) = bytes.split_at_mut(from);
            (&mut lo[to..to + len], &hi[..len])
        };
        bulk::copy_with(dst, src, streaming)
    }

    #[cold]
    fn out_of_memory(&mut self, requested: usize) -> ArenaError {
        self.counters.out_of_memory += 1;
        trace!(arena_id = self.config.arena_id, requested, "out of memory");
        ArenaError::OutOfMemory {
            requested,
            arena_id: self.config.arena_id,
        }
    }

    #[cold]
    fn on_corruption(&mut self, err: ArenaError) -> ArenaError {
        if let ArenaError::Corruption { offset, reason } = &err {
            self.counters.corruptions += 1;
            warn!(arena_id = self.config.arena_id, offset, %reason, "block corruption detected");
        }
        err
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("arena_id", &self.config.arena_id)
            .field("region", &self.region)
            .field("sub_arenas", &self.sub_arenas.len())
            .field("sub_arena_size", &self.sub_size)
            .field("active", &self.active)
            .field("active_count", &self.active_count)
            .field("bytes_in_use", &self.counters.bytes_in_use)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::region::HeapProvider;

    fn arena(working_set: usize) -> Arena {
        Arena::with_provider(ArenaConfig::with_working_set(working_set), Box::new(HeapProvider)).unwrap()
    }

    fn arena_with(config: ArenaConfig) -> Arena {
        Arena::with_provider(config, Box::new(HeapProvider)).unwrap()
    }

    #[test]
    fn test_arena_creation() {
        let a = arena(4096);
        assert_eq!(a.sub_arenas().len(), 4);
        assert_eq!(a.sub_arena_size(), 1024);
        assert_eq!(a.active_sub_arenas(), 4);
        assert!(a.region_len() >= DATA_START + 4096);
        assert_eq!(a.sub_arena(1).unwrap().base, (DATA_START + 1024) as u32);
        assert!(a.sub_arena(4).is_none());
    }

    #[test]
    fn test_payloads_start_on_cache_lines() {
        let mut a = arena(4096);
        for _ in 0..8 {
            let p = a.allocate(24, 0).unwrap();
            assert_eq!(p.offset() as usize % CACHE_LINE, 0);
            assert_eq!(a.address_of(p) % CACHE_LINE, 0);
        }
    }

    #[test]
    fn test_fill_then_out_of_memory() {
        let mut a = arena(4096);
        for _ in 0..64 {
            a.allocate(32, 0).unwrap();
        }
        let err = a.allocate(4096, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(err.is_recoverable());
        assert_eq!(a.get_stats().counters.out_of_memory, 1);
    }

    #[test]
    fn test_round_robin_moves_to_next_sub_arena() {
        let mut a = arena(4096);
        for _ in 0..16 {
            a.allocate(32, 0).unwrap();
        }
        assert_eq!(a.active_sub_arena(), 0);
        let p = a.allocate(32, 0).unwrap();
        assert_eq!(a.active_sub_arena(), 1);
        assert_eq!(p.offset(), (DATA_START + 1024 + HEADER_SIZE) as u32);
    }

    #[test]
    fn test_free_list_reuse() {
        let mut a = arena(4096);
        let first = a.allocate(40, 0).unwrap();
        a.free(first).unwrap();
        let second = a.allocate(40, 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(a.get_stats().counters.free_list_hits, 1);
    }

    #[test]
    fn test_double_free_detected() {
        let mut a = arena(4096);
        let p = a.allocate(100, 0).unwrap();
        a.free(p).unwrap();
        let err = a.free(p).unwrap_err();
        assert!(matches!(
            err,
            ArenaError::Corruption { reason: CorruptionReason::AlreadyFreed, .. }
        ));
        assert!(err.is_fatal());
        assert_eq!(a.get_stats().counters.corruptions, 1);
    }

    #[test]
    fn test_huge_block_double_free_detected() {
        let mut a = arena(32 * 1024);
        let p = a.allocate(2000, 0).unwrap();
        a.free(p).unwrap();
        assert_eq!(a.free(p).unwrap_err().kind(), ErrorKind::Corruption);
        // Huge blocks are not recycled
        let q = a.allocate(2000, 0).unwrap();
        assert_ne!(p, q);
    }

    #[test]
    fn test_invalid_arguments() {
        let mut a = arena(4096);
        assert_eq!(a.allocate(0, 0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(a.allocate(8, 48).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(a.allocate(8, 8192).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(a.free(ArenaPtr::NULL).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(a.allocate_batch(&[]).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(a.allocate_batch(&[8, 0]).unwrap_err().kind(), ErrorKind::InvalidArgument);
        let req = AllocRequest::new(8).with_priority(4);
        assert_eq!(a.allocate_with_hints(&req).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_foreign_pointers_are_corruption() {
        let mut a = arena(4096);
        let p = a.allocate(32, 0).unwrap();
        // Inside a payload, no header there
        let inner = ArenaPtr(p.offset() + 16);
        assert_eq!(a.free(inner).unwrap_err().kind(), ErrorKind::Corruption);
        // Past the end of the sub-arenas
        assert_eq!(a.free(ArenaPtr(1 << 20)).unwrap_err().kind(), ErrorKind::Corruption);
        assert_eq!(a.free(ArenaPtr(8)).unwrap_err().kind(), ErrorKind::Corruption);
        a.free(p).unwrap();
    }

    #[test]
    fn test_corrupted_sub_arena_id() {
        let mut a = arena(4096);
        let p = a.allocate(32, 0).unwrap();
        let at = p.offset() as usize - HEADER_SIZE;
        let mut header = BlockHeader::read(a.region.as_slice(), at);
        header.sub_arena = 9;
        header.write(a.region.as_mut_slice(), at);
        assert!(matches!(
            a.free(p),
            Err(ArenaError::Corruption { reason: CorruptionReason::UnknownSubArena, .. })
        ));
    }

    #[test]
    fn test_explicit_alignment_within_line() {
        let mut a = arena_with(ArenaConfig {
            alignment: 16,
            ..ArenaConfig::with_working_set(4096)
        });
        let p = a.allocate(8, 0).unwrap();
        let q = a.allocate(8, 0).unwrap();
        assert_eq!(q.offset() - p.offset(), 32);
        let r = a.allocate(8, 64).unwrap();
        assert_eq!(r.offset() % 64, 0);
    }

    #[test]
    fn test_overaligned_allocation() {
        let mut a = arena(32 * 1024);
        let p = a.allocate(100, 256).unwrap();
        assert_eq!(a.address_of(p) % 256, 0);
        assert!(a.usable_size(p).unwrap() >= 100);
        a.bytes_mut(p, 100).unwrap().fill(7);
        a.free(p).unwrap();
        assert!(matches!(
            a.free(p),
            Err(ArenaError::Corruption { reason: CorruptionReason::AlreadyFreed, .. })
        ));
        assert_eq!(a.get_stats().counters.bytes_in_use, 0);
    }

    #[test]
    fn test_realloc_in_place_and_move() {
        let mut a = arena(32 * 1024);
        let p = a.allocate(20, 0).unwrap();
        a.bytes_mut(p, 20).unwrap().copy_from_slice(&[3u8; 20]);
        // 20 + 16 rounds up to 64, so 48 bytes are usable
        assert_eq!(a.realloc(p, 48).unwrap(), p);
        let q = a.realloc(p, 500).unwrap();
        assert_ne!(p, q);
        assert_eq!(a.bytes(q, 20).unwrap(), &[3u8; 20]);
        assert!(a.usable_size(p).is_err());
        assert_eq!(a.get_stats().counters.reallocs, 1);
    }

    #[test]
    fn test_realloc_null_and_zero() {
        let mut a = arena(4096);
        let p = a.realloc(ArenaPtr::NULL, 10).unwrap();
        assert!(!p.is_null());
        assert_eq!(a.realloc(p, 0).unwrap(), ArenaPtr::NULL);
        assert_eq!(a.free(p).unwrap_err().kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_realloc_failure_keeps_block() {
        let mut a = arena(4096);
        let p = a.allocate(32, 0).unwrap();
        a.bytes_mut(p, 4).unwrap().copy_from_slice(b"keep");
        assert_eq!(a.realloc(p, 4096).unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(a.bytes(p, 4).unwrap(), b"keep");
        a.free(p).unwrap();
    }

    #[test]
    fn test_batch_is_contiguous() {
        let mut a = arena(4096);
        let sizes = [10, 100, 30];
        let ptrs = a.allocate_batch(&sizes).unwrap();
        assert_eq!(ptrs.len(), 3);
        for (pair, size) in ptrs.windows(2).zip(sizes) {
            let gap = pair[1].offset() - pair[0].offset();
            assert_eq!(gap as usize, align_up(size + HEADER_SIZE, 64));
        }
        let stats = a.get_stats();
        assert_eq!(stats.counters.allocations, 3);
        assert_eq!(stats.counters.batch_allocations, 1);
        for p in ptrs {
            a.free(p).unwrap();
        }
        assert_eq!(a.validate().unwrap(), 3);
    }

    #[test]
    fn test_batch_all_or_nothing() {
        let mut a = arena(4096);
        let before = a.state_hash();
        // Each 512-byte request takes 576 bytes; two exceed a 1024-byte sub-arena
        let err = a.allocate_batch(&[512, 512]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(a.state_hash(), before);
        assert_eq!(a.get_stats().counters.allocations, 0);
    }

    #[test]
    fn test_reset_is_deterministic() {
        let mut a = arena(8192);
        let run = |a: &mut Arena| -> Vec<ArenaPtr> {
            let mut out = Vec::new();
            for size in [8usize, 40, 200, 700, 16, 90] {
                out.push(a.allocate(size, 0).unwrap());
            }
            a.free(out[1]).unwrap();
            out.push(a.allocate(33, 0).unwrap());
            out
        };
        let first = run(&mut a);
        let used_after: u32 = a.sub_arenas().iter().map(|s| s.used_size).sum();
        a.reset();
        assert!(a.sub_arenas().iter().all(|s| s.used_size == 0));
        let second = run(&mut a);
        assert_eq!(first, second);
        let used_again: u32 = a.sub_arenas().iter().map(|s| s.used_size).sum();
        assert_eq!(used_after, used_again);
    }

    #[test]
    fn test_zeroed_and_poisoned() {
        let mut a = arena_with(ArenaConfig {
            poison_on_free: true,
            ..ArenaConfig::with_working_set(4096)
        });
        let p = a.allocate(48, 0).unwrap();
        a.bytes_mut(p, 48).unwrap().fill(0xAB);
        a.free(p).unwrap();
        assert!(a.bytes(p, 48).unwrap().iter().all(|&b| b == 0xDD));

        let z = a.allocate_zeroed(48).unwrap();
        assert_eq!(z, p);
        assert!(a.bytes(z, 48).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_hinted_allocation() {
        let mut a = arena(32 * 1024);
        let req = AllocRequest::new(300)
            .with_alignment(128)
            .with_temporal_locality()
            .with_spatial_locality()
            .with_lifetime(Lifetime::Persistent)
            .with_priority(3);
        let p = a.allocate_with_hints(&req).unwrap();
        assert_eq!(a.address_of(p) % 128, 0);
        assert!(a.usable_size(p).unwrap() >= 300);
        a.free(p).unwrap();
    }

    #[test]
    fn test_prefetch_queue_is_bounded() {
        let mut a = arena(32 * 1024);
        for _ in 0..20 {
            a.allocate(64, 0).unwrap();
        }
        assert_eq!(a.prefetch_queue().len(), PREFETCH_QUEUE_LEN);
        a.set_prefetch_distance(0).unwrap();
        a.reset();
        a.allocate(64, 0).unwrap();
        assert!(a.prefetch_queue().is_empty());
    }

    #[test]
    fn test_cache_coloring_spreads_blocks() {
        let mut a = arena(32 * 1024);
        a.set_cache_coloring(true, 256).unwrap();
        let p = a.allocate(48, 0).unwrap();
        let q = a.allocate(48, 0).unwrap();
        // Second block is pushed one extra line by the rotating color
        assert_eq!(q.offset() - p.offset(), 128);
        assert_eq!(a.set_cache_coloring(true, 100).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_coloring_avoids_last_used_set() {
        let mut a = arena_with(ArenaConfig {
            cache_coloring: true,
            coloring_stride: 256,
            sub_arena_count: 2,
            ..ArenaConfig::with_working_set(8192)
        });
        assert_eq!(a.sub_arena_size(), 4096);

        let small = a.allocate(48, 0).unwrap();
        assert_eq!(a.last_cache_set(), a.cache_set_of(small));

        // Too big for what is left of sub-arena 0. Sub-arena 1 starts a page
        // later, in the same set, so the block is pushed one line further.
        let large = a.allocate(4000, 0).unwrap();
        assert_eq!(a.active_sub_arena(), 1);
        assert_ne!(a.cache_set_of(large), a.cache_set_of(small));
        assert_eq!(large.offset(), (DATA_START + 4096 + CACHE_LINE + HEADER_SIZE) as u32);
        assert_eq!(a.last_cache_set(), a.cache_set_of(large));
    }

    #[test]
    fn test_consecutive_colored_blocks_change_sets() {
        let mut a = arena(32 * 1024);
        a.set_cache_coloring(true, 512).unwrap();
        let mut previous = None;
        for _ in 0..64 {
            let p = a.allocate(48, 0).unwrap();
            let set = a.cache_set_of(p);
            assert_ne!(Some(set), previous);
            previous = Some(set);
        }
    }

    #[test]
    fn test_block_flags_record_hints() {
        let mut a = arena(32 * 1024);
        let req = AllocRequest::new(40).with_priority(3).with_temporal_locality();
        let p = a.allocate_with_hints(&req).unwrap();
        assert_eq!(a.block_priority(p).unwrap(), 3);
        let f = a.block_flags(p).unwrap();
        assert_ne!(f & flags::TEMPORAL, 0);
        assert_eq!(f & flags::SPATIAL, 0);

        let z = a.allocate_zeroed(16).unwrap();
        assert_eq!(a.block_flags(z).unwrap(), flags::ZEROED);
        let batch = a.allocate_batch(&[8, 8]).unwrap();
        assert_eq!(a.block_flags(batch[1]).unwrap(), flags::BATCH);
        assert_eq!(a.block_priority(batch[1]).unwrap(), 0);

        a.free(p).unwrap();
        assert_eq!(a.block_priority(p).unwrap_err().kind(), ErrorKind::Corruption);
        assert_eq!(a.block_flags(ArenaPtr::NULL).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_block_flags_through_shadow_header() {
        let mut a = arena(32 * 1024);
        let req = AllocRequest::new(100)
            .with_alignment(256)
            .with_priority(2)
            .with_spatial_locality();
        let p = a.allocate_with_hints(&req).unwrap();
        // First block starts at payload offset 64, so 256 alignment needs a shadow
        let at = p.offset() as usize - HEADER_SIZE;
        assert!(BlockHeader::read(a.region.as_slice(), at).is_shadow());

        assert_eq!(a.block_priority(p).unwrap(), 2);
        let f = a.block_flags(p).unwrap();
        assert_ne!(f & flags::SPATIAL, 0);
        assert_eq!(f & flags::SHADOW, 0);
    }

    #[test]
    fn test_realloc_copy_follows_streaming_flag() {
        let mut a = arena(32 * 1024);
        let from = a.allocate(4096, 0).unwrap();
        let to = a.allocate(4096, 0).unwrap();
        a.bytes_mut(from, 4096).unwrap().fill(0x42);

        let cached = a.move_payload(from.offset() as usize, to.offset() as usize, 4096);
        assert_eq!(cached, BulkPath::Scalar);
        assert!(a.bytes(to, 4096).unwrap().iter().all(|&b| b == 0x42));

        a.set_streaming(true);
        a.bytes_mut(from, 4096).unwrap().fill(0x17);
        let streamed = a.move_payload(from.offset() as usize, to.offset() as usize, 4096);
        #[cfg(target_arch = "x86_64")]
        assert_eq!(streamed, BulkPath::Streaming);
        #[cfg(not(target_arch = "x86_64"))]
        assert_eq!(streamed, BulkPath::Scalar);
        assert!(a.bytes(to, 4096).unwrap().iter().all(|&b| b == 0x17));
    }

    #[test]
    fn test_numa_local_huge_page_arena() {
        let mut a = Arena::new(ArenaConfig {
            numa_local: true,
            huge_pages: true,
            ..ArenaConfig::with_working_set(32 * 1024)
        })
        .unwrap();
        let node = current_numa_node() as u16;
        for i in 0..a.sub_arenas().len() {
            assert_eq!(a.sub_arena(i).unwrap().numa_node, node);
        }
        assert!(a.region_len() >= DATA_START + 32 * 1024);

        let p = a.allocate(256, 0).unwrap();
        a.bytes_mut(p, 256).unwrap().fill(1);
        a.free(p).unwrap();
        a.validate().unwrap();
    }

    #[test]
    fn test_tunable_validation() {
        let mut a = arena(4096);
        assert!(a.set_prefetch_distance(5).is_err());
        assert!(a.set_alignment(128).is_err());
        assert!(a.set_temporal_locality(4).is_err());
        a.set_alignment(32).unwrap();
        assert_eq!(a.config().alignment, 32);
        assert_eq!(a.sub_arena(0).unwrap().align_shift, 5);
        assert!(a.set_active_sub_arenas(0).is_err());
        assert!(a.set_active_sub_arenas(5).is_err());
    }

    #[test]
    fn test_shrinking_active_set() {
        let mut a = arena(4096);
        a.set_active_sub_arenas(1).unwrap();
        for _ in 0..16 {
            a.allocate(32, 0).unwrap();
        }
        assert_eq!(a.allocate(32, 0).unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(a.get_stats().active_sub_arenas, 1);
    }

    #[test]
    fn test_events_and_analysis() {
        let mut a = arena(32 * 1024);
        for _ in 0..32 {
            let p = a.allocate(64, 0).unwrap();
            a.free(p).unwrap();
        }
        assert_eq!(a.recent_events().len(), 64);
        assert_eq!(a.sequence(), 64);
        let analysis = a.analyze_cache().unwrap();
        assert_eq!(analysis.events, 64);
        assert!(analysis.hit_rate > 0.9);
        a.reset();
        assert!(a.recent_events().is_empty());
    }

    #[test]
    fn test_untracked_arena_records_nothing() {
        let mut a = arena_with(ArenaConfig {
            track_accesses: false,
            ..ArenaConfig::with_working_set(4096)
        });
        a.allocate(16, 0).unwrap();
        assert!(a.recent_events().is_empty());
        assert_eq!(a.analyze_cache().unwrap().sim.accesses, 0);
    }

    #[test]
    fn test_stats_snapshot() {
        let mut a = arena(4096);
        let p = a.allocate(10, 0).unwrap();
        a.allocate(10, 0).unwrap();
        a.free(p).unwrap();
        let s = a.get_stats();
        assert_eq!(s.counters.allocations, 2);
        assert_eq!(s.counters.frees, 1);
        assert_eq!(s.counters.bytes_in_use, 64);
        assert_eq!(s.counters.peak_bytes_in_use, 128);
        assert_eq!(s.sub_arenas.len(), 4);
        assert!(s.utilization() > 0.0);
        assert_eq!(s.estimated_cache_hits + s.estimated_cache_misses, 3);
    }

    #[test]
    fn test_bytes_bounds() {
        let a = arena(4096);
        assert!(a.bytes(ArenaPtr::NULL, 1).is_err());
        assert!(a.bytes(ArenaPtr(0), a.region_len() + 1).is_err());
        assert!(a.bytes(ArenaPtr(0), a.region_len()).is_ok());
    }

    #[test]
    fn test_warm_up_and_destroy() {
        let mut a = Arena::new(ArenaConfig::default()).unwrap();
        a.warm_up();
        let p = a.allocate(128, 0).unwrap();
        a.free(p).unwrap();
        a.validate().unwrap();
        a.destroy();
    }
}
