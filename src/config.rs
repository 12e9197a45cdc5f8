//! Arena configuration - defaults, validation, and workload presets.
//!
//! A configuration is validated once when the arena is created. After that
//! only the tunables listed on [`crate::Arena`] (`set_*`) may change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::branchless::is_power_of_two;
use crate::bulk::CACHE_LINE;
use crate::error::{ArenaError, Result};

/// Largest working set accepted (covers large L1s and L2 slices).
pub const L1_CAPACITY_MAX: usize = 1 << 20;

/// Smallest working set accepted.
pub const MIN_WORKING_SET: usize = 1024;

/// Every sub-arena holds at least this many bytes.
pub const MIN_SUB_ARENA_SIZE: usize = 256;

/// Upper bound on the number of sub-arenas.
pub const MAX_SUB_ARENAS: usize = 64;

/// Smallest and largest configurable alignment.
pub const MIN_ALIGNMENT: usize = 16;
pub const MAX_ALIGNMENT: usize = CACHE_LINE;

/// Prefetch distance bound, in cache lines. Zero disables prefetch.
pub const MAX_PREFETCH_DISTANCE: u8 = 4;

/// Coloring stride bounds, in bytes.
pub const MIN_COLORING_STRIDE: usize = CACHE_LINE;
pub const MAX_COLORING_STRIDE: usize = 4096;

/// Highest temporal-locality hint.
pub const MAX_TEMPORAL_LOCALITY: u8 = 3;

/// Arena configuration.
///
/// Every field has a default, so partial TOML documents are accepted:
///
/// ```
/// use flash_arena::ArenaConfig;
///
/// let config = ArenaConfig::from_toml_str("working_set_size = 8192\nprefetch_distance = 3").unwrap();
/// assert_eq!(config.working_set_size, 8192);
/// assert_eq!(config.alignment, 64);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Identifier reported in out-of-memory errors
    pub arena_id: u32,
    /// Usable bytes across all sub-arenas (target: fits in L1)
    pub working_set_size: usize,
    /// Number of sub-arenas the working set is split into
    pub sub_arena_count: usize,
    /// Cache lines hinted ahead of each bump allocation (0 = off)
    pub prefetch_distance: u8,
    /// Minimum alignment of every returned pointer
    pub alignment: usize,
    /// Bind backing memory to the creating thread's NUMA node
    pub numa_local: bool,
    /// Offset bump allocations to spread them over cache sets
    pub cache_coloring: bool,
    /// Upper bound of the coloring offset, in bytes
    pub coloring_stride: usize,
    /// Back the region with huge pages when available
    pub huge_pages: bool,
    /// Use non-temporal stores for large copies
    pub streaming: bool,
    /// Temporal-locality hint, 0 (none) to 3 (keep in L1)
    pub temporal_locality: u8,
    /// Record an access event per allocation/free for analysis
    pub track_accesses: bool,
    /// Capacity of the recent-event ring
    pub event_window: usize,
    /// Overwrite freed payloads with a poison pattern
    pub poison_on_free: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            arena_id: 0,
            working_set_size: 32 * 1024,
            sub_arena_count: 4,
            prefetch_distance: 2,
            alignment: 64,
            numa_local: false,
            cache_coloring: false,
            coloring_stride: 256,
            huge_pages: false,
            streaming: false,
            temporal_locality: 1,
            track_accesses: true,
            event_window: 4096,
            poison_on_free: false,
        }
    }
}

impl ArenaConfig {
    /// Default configuration with the given working-set size.
    pub fn with_working_set(working_set_size: usize) -> Self {
        Self {
            working_set_size,
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()
    }

    /// Check every field and normalize the sub-arena count.
    ///
    /// The sub-arena count is lowered, never raised, so that each
    /// sub-arena holds at least [`MIN_SUB_ARENA_SIZE`] bytes.
    pub fn validate(mut self) -> Result<Self> {
        if self.working_set_size < MIN_WORKING_SET || self.working_set_size > L1_CAPACITY_MAX {
            return Err(ArenaError::config(format!(
                "working_set_size {} outside {}..={}",
                self.working_set_size, MIN_WORKING_SET, L1_CAPACITY_MAX
            )));
        }
        if self.sub_arena_count == 0 || self.sub_arena_count > MAX_SUB_ARENAS {
            return Err(ArenaError::config(format!(
                "sub_arena_count {} outside 1..={}",
                self.sub_arena_count, MAX_SUB_ARENAS
            )));
        }
        check_alignment(self.alignment)?;
        check_prefetch_distance(self.prefetch_distance)?;
        check_coloring_stride(self.coloring_stride)?;
        check_temporal_locality(self.temporal_locality)?;
        if self.event_window == 0 {
            return Err(ArenaError::config("event_window must be non-zero"));
        }

        let fit = (self.working_set_size / MIN_SUB_ARENA_SIZE).max(1);
        self.sub_arena_count = self.sub_arena_count.min(fit);
        Ok(self)
    }

    /// Bytes per sub-arena: an even split, rounded down to a cache line.
    #[inline]
    pub fn sub_arena_size(&self) -> usize {
        (self.working_set_size / self.sub_arena_count) & !(CACHE_LINE - 1)
    }
}

pub(crate) fn check_alignment(alignment: usize) -> Result<()> {
    if !is_power_of_two(alignment) || !(MIN_ALIGNMENT..=MAX_ALIGNMENT).contains(&alignment) {
        return Err(ArenaError::config(format!(
            "alignment {} must be a power of two in {}..={}",
            alignment, MIN_ALIGNMENT, MAX_ALIGNMENT
        )));
    }
    Ok(())
}

pub(crate) fn check_prefetch_distance(distance: u8) -> Result<()> {
    if distance > MAX_PREFETCH_DISTANCE {
        return Err(ArenaError::config(format!(
            "prefetch_distance {} exceeds {}",
            distance, MAX_PREFETCH_DISTANCE
        )));
    }
    Ok(())
}

pub(crate) fn check_coloring_stride(stride: usize) -> Result<()> {
    if !is_power_of_two(stride) || !(MIN_COLORING_STRIDE..=MAX_COLORING_STRIDE).contains(&stride) {
        return Err(ArenaError::config(format!(
            "coloring_stride {} must be a power of two in {}..={}",
            stride, MIN_COLORING_STRIDE, MAX_COLORING_STRIDE
        )));
    }
    Ok(())
}

pub(crate) fn check_temporal_locality(hint: u8) -> Result<()> {
    if hint > MAX_TEMPORAL_LOCALITY {
        return Err(ArenaError::config(format!(
            "temporal_locality {} exceeds {}",
            hint, MAX_TEMPORAL_LOCALITY
        )));
    }
    Ok(())
}

// ============================================================================
// Workload presets
// ============================================================================

/// Named workload shapes with a known-good tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadProfile {
    /// Large one-pass scans
    Streaming,
    /// Scattered accesses with little reuse
    Random,
    /// Forward walks with reuse
    Sequential,
    /// Pointer chasing over nodes and edges
    Graph,
}

/// The tunables a workload profile sets together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkloadPreset {
    pub prefetch_distance: u8,
    pub cache_coloring: bool,
    pub coloring_stride: usize,
    pub temporal_locality: u8,
    pub streaming: bool,
}

impl WorkloadProfile {
    /// All profiles, in declaration order.
    pub const ALL: [WorkloadProfile; 4] = [
        WorkloadProfile::Streaming,
        WorkloadProfile::Random,
        WorkloadProfile::Sequential,
        WorkloadProfile::Graph,
    ];

    /// The tunables applied for this profile.
    pub const fn preset(self) -> WorkloadPreset {
        match self {
            WorkloadProfile::Streaming => WorkloadPreset {
                prefetch_distance: 4,
                cache_coloring: false,
                coloring_stride: 256,
                temporal_locality: 0,
                streaming: true,
            },
            WorkloadProfile::Random => WorkloadPreset {
                prefetch_distance: 1,
                cache_coloring: true,
                coloring_stride: 256,
                temporal_locality: 2,
                streaming: false,
            },
            WorkloadProfile::Sequential => WorkloadPreset {
                prefetch_distance: 3,
                cache_coloring: false,
                coloring_stride: 256,
                temporal_locality: 1,
                streaming: false,
            },
            WorkloadProfile::Graph => WorkloadPreset {
                prefetch_distance: 2,
                cache_coloring: true,
                coloring_stride: 512,
                temporal_locality: 3,
                streaming: false,
            },
        }
    }

    /// Lowercase name, as accepted by `FromStr`.
    pub const fn name(self) -> &'static str {
        match self {
            WorkloadProfile::Streaming => "streaming",
            WorkloadProfile::Random => "random",
            WorkloadProfile::Sequential => "sequential",
            WorkloadProfile::Graph => "graph",
        }
    }
}

impl fmt::Display for WorkloadProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkloadProfile {
    type Err = ArenaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.name().eq_ignore_ascii_case(s.trim()))
            .ok_or(ArenaError::invalid("unknown workload profile"))
    }
}
