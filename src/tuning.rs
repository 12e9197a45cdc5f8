//! Adaptive Tuning - closes the loop from analysis back to the arena.
//!
//! Tuning only touches the runtime tunables an arena exposes. Every change
//! is bounded, logged at `info`, and listed in the returned report. Nothing
//! here runs implicitly; callers invoke it between work units.
//!
//! | Condition                                   | Adjustment                              |
//! |---------------------------------------------|-----------------------------------------|
//! | hit rate < 0.90                             | prefetch 4 lines if spatial >= 0.5, else 2 |
//! | `ChangeAlignment` recommended               | alignment = cache line                  |
//! | conflict misses > 10% of accesses           | coloring on, stride doubled (256..=4096) |
//! | working set > cache, > 1 active sub-arena   | reset, then halve active sub-arenas     |

use std::fmt;

use serde::Serialize;
use tracing::info;

use crate::analyzer::{L1Analysis, RecommendationKind, CONFLICT_THRESHOLD, GOOD_SPATIAL, LOW_HIT_RATE};
use crate::arena::Arena;
use crate::bulk::CACHE_LINE;
use crate::cache_sim::ratio;
use crate::config::{WorkloadProfile, MAX_COLORING_STRIDE};
use crate::error::Result;

/// Smallest stride coloring is strengthened to.
const MIN_TUNED_STRIDE: usize = 256;

/// One applied adjustment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TuningChange {
    PrefetchDistance { from: u8, to: u8 },
    Alignment { from: usize, to: usize },
    CacheColoring { enabled: bool, stride: usize },
    TemporalLocality { from: u8, to: u8 },
    Streaming { enabled: bool },
    /// The arena was reset before this change took effect
    ActiveSubArenas { from: usize, to: usize },
}

impl fmt::Display for TuningChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuningChange::PrefetchDistance { from, to } => write!(f, "prefetch distance {from} -> {to}"),
            TuningChange::Alignment { from, to } => write!(f, "alignment {from} -> {to}"),
            TuningChange::CacheColoring { enabled, stride } => {
                write!(f, "cache coloring {} (stride {stride})", if *enabled { "on" } else { "off" })
            }
            TuningChange::TemporalLocality { from, to } => write!(f, "temporal locality {from} -> {to}"),
            TuningChange::Streaming { enabled } => write!(f, "streaming {}", if *enabled { "on" } else { "off" }),
            TuningChange::ActiveSubArenas { from, to } => write!(f, "active sub-arenas {from} -> {to} (reset)"),
        }
    }
}

/// What a tuning pass saw and did.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TuningReport {
    /// The analysis the decisions were based on (absent for presets)
    pub analysis: Option<L1Analysis>,
    pub changes: Vec<TuningChange>,
}

impl TuningReport {
    /// Returns true if nothing was changed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns true if the arena was reset by this pass.
    pub fn did_reset(&self) -> bool {
        self.changes
            .iter()
            .any(|c| matches!(c, TuningChange::ActiveSubArenas { .. }))
    }
}

/// Analyze the arena's recent accesses and apply bounded adjustments.
///
/// May reset the arena (see [`TuningChange::ActiveSubArenas`]); check
/// [`TuningReport::did_reset`] before using outstanding pointers.
pub fn optimize_layout(arena: &mut Arena) -> Result<TuningReport> {
    let analysis = arena.analyze_cache()?;
    apply_analysis(arena, analysis)
}

/// Apply the adjustments an analysis calls for.
pub fn apply_analysis(arena: &mut Arena, analysis: L1Analysis) -> Result<TuningReport> {
    let mut changes = Vec::new();
    if analysis.sim.accesses == 0 {
        return Ok(TuningReport {
            analysis: Some(analysis),
            changes,
        });
    }
    let arena_id = arena.config().arena_id;

    if analysis.hit_rate < LOW_HIT_RATE {
        let from = arena.config().prefetch_distance;
        let to = if analysis.spatial_score >= GOOD_SPATIAL { 4 } else { 2 };
        if from != to {
            arena.set_prefetch_distance(to)?;
            changes.push(TuningChange::PrefetchDistance { from, to });
        }
    }

    if analysis.recommends(RecommendationKind::ChangeAlignment) {
        let from = arena.config().alignment;
        if from < CACHE_LINE {
            arena.set_alignment(CACHE_LINE)?;
            changes.push(TuningChange::Alignment { from, to: CACHE_LINE });
        }
    }

    if ratio(analysis.conflict_misses, analysis.sim.accesses) > CONFLICT_THRESHOLD {
        let config = arena.config();
        let stride = if config.cache_coloring {
            (config.coloring_stride * 2).clamp(MIN_TUNED_STRIDE, MAX_COLORING_STRIDE)
        } else {
            config.coloring_stride.max(MIN_TUNED_STRIDE)
        };
        if !config.cache_coloring || stride != config.coloring_stride {
            arena.set_cache_coloring(true, stride)?;
            changes.push(TuningChange::CacheColoring { enabled: true, stride });
        }
    }

    let active = arena.active_sub_arenas();
    if analysis.working_set_fit > 1.0 && active > 1 {
        let to = (active / 2).max(1);
        arena.set_active_sub_arenas(to)?;
        changes.push(TuningChange::ActiveSubArenas { from: active, to });
    }

    for change in &changes {
        info!(arena_id, %change, hit_rate = analysis.hit_rate, "layout tuned");
    }
    Ok(TuningReport {
        analysis: Some(analysis),
        changes,
    })
}

/// Apply a workload preset without measuring first.
pub fn tune_for_workload(arena: &mut Arena, profile: WorkloadProfile) -> Result<TuningReport> {
    let preset = profile.preset();
    let config = arena.config().clone();
    let mut changes = Vec::new();

    if config.prefetch_distance != preset.prefetch_distance {
        arena.set_prefetch_distance(preset.prefetch_distance)?;
        changes.push(TuningChange::PrefetchDistance {
            from: config.prefetch_distance,
            to: preset.prefetch_distance,
        });
    }
    if config.cache_coloring != preset.cache_coloring || config.coloring_stride != preset.coloring_stride {
        arena.set_cache_coloring(preset.cache_coloring, preset.coloring_stride)?;
        changes.push(TuningChange::CacheColoring {
            enabled: preset.cache_coloring,
            stride: preset.coloring_stride,
        });
    }
    if config.temporal_locality != preset.temporal_locality {
        arena.set_temporal_locality(preset.temporal_locality)?;
        changes.push(TuningChange::TemporalLocality {
            from: config.temporal_locality,
            to: preset.temporal_locality,
        });
    }
    if config.streaming != preset.streaming {
        arena.set_streaming(preset.streaming);
        changes.push(TuningChange::Streaming {
            enabled: preset.streaming,
        });
    }

    info!(arena_id = config.arena_id, %profile, changes = changes.len(), "workload preset applied");
    Ok(TuningReport {
        analysis: None,
        changes,
    })
}

/// [`tune_for_workload`] by profile name (case-insensitive).
pub fn tune_for_workload_named(arena: &mut Arena, name: &str) -> Result<TuningReport> {
    tune_for_workload(arena, name.parse()?)
}

/// Pin the calling thread to `core`, or to the last core when `None`.
///
/// The last core is typically the one kept clear of OS interrupts. Returns
/// false if the core does not exist or the OS refused.
pub fn pin_current_thread(core: Option<usize>) -> bool {
    let Some(cores) = core_affinity::get_core_ids() else {
        return false;
    };
    let target = match core {
        Some(id) => cores.into_iter().find(|c| c.id == id),
        None => cores.last().copied(),
    };
    target.map_or(false, core_affinity::set_for_current)
}
