//! Performance Metrics - counters the arena keeps as it runs.
//!
//! Counters are plain integers bumped on the owning thread; a snapshot is
//! a copy, never a live view.

use serde::Serialize;

use crate::sub_arena::SubArena;

/// Aggregate counters owned by an arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub allocations: u64,
    pub frees: u64,
    pub reallocs: u64,
    pub batch_allocations: u64,
    pub free_list_hits: u64,
    pub bump_allocations: u64,
    pub out_of_memory: u64,
    pub corruptions: u64,
    pub resets: u64,
    pub bytes_requested: u64,
    /// Bytes held by live blocks since the last reset
    pub bytes_in_use: u64,
    /// High-water mark of `bytes_in_use` since the last reset
    pub peak_bytes_in_use: u64,
}

impl Counters {
    #[inline]
    pub(crate) fn on_alloc(&mut self, requested: usize, block: u32) {
        self.allocations += 1;
        self.bytes_requested += requested as u64;
        self.bytes_in_use += block as u64;
        self.peak_bytes_in_use = self.peak_bytes_in_use.max(self.bytes_in_use);
    }

    #[inline]
    pub(crate) fn on_free(&mut self, block: u32) {
        self.frees += 1;
        self.bytes_in_use = self.bytes_in_use.saturating_sub(block as u64);
    }

    pub(crate) fn on_reset(&mut self) {
        self.resets += 1;
        self.bytes_in_use = 0;
        self.peak_bytes_in_use = 0;
    }
}

/// Snapshot of one sub-arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SubArenaStats {
    pub id: u16,
    pub numa_node: u16,
    pub total_size: u32,
    pub used_size: u32,
    pub next_offset: u32,
    /// Number of free lists with at least one block
    pub nonempty_free_lists: u8,
    pub alloc_count: u64,
    pub free_count: u64,
    pub estimated_hits: u64,
    pub estimated_misses: u64,
}

impl From<&SubArena> for SubArenaStats {
    fn from(sa: &SubArena) -> Self {
        Self {
            id: sa.id,
            numa_node: sa.numa_node,
            total_size: sa.total_size,
            used_size: sa.used_size,
            next_offset: sa.next_offset,
            nonempty_free_lists: sa
                .free_heads
                .iter()
                .filter(|&&head| head != crate::header::NULL_OFFSET)
                .count() as u8,
            alloc_count: sa.alloc_count,
            free_count: sa.free_count,
            estimated_hits: sa.cache_hits,
            estimated_misses: sa.cache_misses,
        }
    }
}

/// Everything `get_stats` reports.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub counters: Counters,
    /// Sub-arenas currently eligible for allocation
    pub active_sub_arenas: usize,
    /// Bytes in the backing region
    pub region_bytes: usize,
    pub estimated_cache_hits: u64,
    pub estimated_cache_misses: u64,
    pub sub_arenas: Vec<SubArenaStats>,
}

impl PerformanceMetrics {
    /// Estimated hit rate from the sub-arena access bitmaps, in `[0, 1]`.
    pub fn estimated_hit_rate(&self) -> f64 {
        let total = self.estimated_cache_hits + self.estimated_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.estimated_cache_hits as f64 / total as f64
        }
    }

    /// Fraction of the working set held by live blocks, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        let total: u64 = self.sub_arenas.iter().map(|s| s.total_size as u64).sum();
        let used: u64 = self.sub_arenas.iter().map(|s| s.used_size as u64).sum();
        if total == 0 {
            0.0
        } else {
            used as f64 / total as f64
        }
    }
}
