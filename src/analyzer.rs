//! L1 Analyzer - miss attribution, locality scores and recommendations.
//!
//! The analyzer owns a [`CacheSimulator`] and a bounded window of recent
//! [`MemoryAccessEvent`]s. Every simulated line access is classified:
//!
//! - **Compulsory**: the line was never touched before.
//! - **Capacity**: the distinct lines in the current window exceed what the
//!   cache can hold.
//! - **Conflict**: anything else; the window would fit, but the set did not.
//!
//! In [`AnalysisMode::RealTime`] each event is simulated as it arrives. In
//! [`AnalysisMode::Batched`] events queue in the window and are simulated on
//! [`L1Analyzer::analyze`]; an unsimulated event about to fall out of the
//! window is simulated first, so nothing is skipped.

use arrayvec::ArrayVec;
use hdrhistogram::Histogram;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::cache_sim::{ratio, CacheGeometry, CacheSimulator, SimStats};
use crate::error::{ArenaError, Result};
use crate::event::{EventRing, MemoryAccessEvent};

/// Page granularity used for the TLB-pressure estimate.
const PAGE_SIZE: u64 = 4096;

/// Distinct pages in the window above which huge pages are suggested
/// (a typical first-level DTLB holds 64 entries).
const TLB_ENTRIES: usize = 64;

/// Hit rate below which prefetch tuning is suggested.
pub const LOW_HIT_RATE: f64 = 0.90;

/// Conflict misses, as a share of accesses, above which padding is suggested.
pub const CONFLICT_THRESHOLD: f64 = 0.10;

/// Spatial score below which data reordering is suggested.
pub const POOR_SPATIAL: f64 = 0.30;

/// Spatial score at which a deeper prefetch pays off.
pub const GOOD_SPATIAL: f64 = 0.50;

/// Largest reuse distance recorded exactly.
const MAX_REUSE_DISTANCE: u64 = 1 << 32;

/// Default bound on the per-line touch history.
pub const DEFAULT_HISTORY_LINES: usize = 1 << 16;

/// How events are simulated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum AnalysisMode {
    /// Simulate each event as it is recorded
    RealTime,
    /// Simulate queued events when an analysis is requested
    #[default]
    Batched,
}

/// Analyzer construction parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnalyzerConfig {
    pub geometry: CacheGeometry,
    /// Events kept in the window
    pub window: usize,
    pub mode: AnalysisMode,
    /// Distinct lines remembered for first-touch and reuse tracking. When
    /// exceeded the history starts over, so a returning line counts as
    /// compulsory again. Must cover at least the cache's line count.
    pub history_lines: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            geometry: CacheGeometry::default(),
            window: 4096,
            mode: AnalysisMode::Batched,
            history_lines: DEFAULT_HISTORY_LINES,
        }
    }
}

/// Why a line access missed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum MissKind {
    Compulsory,
    Capacity,
    Conflict,
}

/// What a recommendation proposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RecommendationKind {
    ReorderData,
    AddPadding,
    ChangeAlignment,
    AdjustPrefetch,
    LoopBlocking,
    HugePages,
    NumaBinding,
    ThreadAffinity,
}

/// How much work acting on a recommendation takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Difficulty {
    Easy,
    Moderate,
    Hard,
}

/// One suggested change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    /// Heuristic speedup factor (1.0 = none)
    pub estimated_speedup: f64,
    pub difficulty: Difficulty,
    /// Kind-specific value: padding or alignment bytes, prefetch distance,
    /// block size in bytes
    pub parameter: Option<usize>,
    pub description: String,
}

/// Every kind appears at most once, so eight slots always suffice.
pub type Recommendations = ArrayVec<Recommendation, 8>;

/// Result of one analysis pass.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct L1Analysis {
    pub geometry: CacheGeometry,
    /// Events simulated since the analyzer was created or reset
    pub events: u64,
    /// Line accesses and their outcomes
    pub sim: SimStats,
    pub hit_rate: f64,
    pub read_hit_rate: f64,
    pub write_hit_rate: f64,
    pub compulsory_misses: u64,
    pub capacity_misses: u64,
    pub conflict_misses: u64,
    /// Distinct lines in the window, in bytes
    pub working_set_bytes: usize,
    /// `working_set_bytes / cache size`; above 1.0 the window does not fit
    pub working_set_fit: f64,
    /// Distinct 4 KiB pages in the window
    pub distinct_pages: usize,
    pub distinct_threads: usize,
    pub mean_reuse_distance: f64,
    pub p99_reuse_distance: u64,
    /// In `[0, 1]`; 1 means lines are reused soon after use
    pub temporal_score: f64,
    /// In `[0, 1]`; 1 means accesses walk long runs of adjacent lines
    pub spatial_score: f64,
    pub recommendations: Recommendations,
}

impl L1Analysis {
    pub fn miss_rate(&self) -> f64 {
        ratio(self.sim.misses, self.sim.accesses)
    }

    /// Share of accesses for each miss kind.
    pub fn miss_breakdown(&self) -> (f64, f64, f64) {
        let total = self.sim.accesses;
        (
            ratio(self.compulsory_misses, total),
            ratio(self.capacity_misses, total),
            ratio(self.conflict_misses, total),
        )
    }

    /// The recommendation of `kind`, if one was made.
    pub fn recommendation(&self, kind: RecommendationKind) -> Option<&Recommendation> {
        self.recommendations.iter().find(|r| r.kind == kind)
    }

    #[inline]
    pub fn recommends(&self, kind: RecommendationKind) -> bool {
        self.recommendation(kind).is_some()
    }
}

/// Runs of accesses that stay on the same or an adjacent line.
///
/// Each step moves at most one line, so the lines a run touched form a
/// contiguous range and the unique count is `hi - lo + 1`.
#[derive(Clone, Copy, Debug, Default)]
struct RunTracker {
    last_line: Option<u64>,
    lo: u64,
    hi: u64,
    closed_runs: u64,
    closed_lines: u64,
}

impl RunTracker {
    #[inline]
    fn observe(&mut self, line: u64) {
        match self.last_line {
            Some(last) if line.abs_diff(last) <= 1 => {
                self.lo = self.lo.min(line);
                self.hi = self.hi.max(line);
            }
            Some(_) => {
                self.closed_runs += 1;
                self.closed_lines += self.hi - self.lo + 1;
                self.lo = line;
                self.hi = line;
            }
            None => {
                self.lo = line;
                self.hi = line;
            }
        }
        self.last_line = Some(line);
    }

    fn mean_lines_per_run(&self) -> f64 {
        if self.last_line.is_none() {
            return 0.0;
        }
        let lines = self.closed_lines + (self.hi - self.lo + 1);
        lines as f64 / (self.closed_runs + 1) as f64
    }
}

/// L1 behaviour analyzer over a bounded event window.
pub struct L1Analyzer {
    config: AnalyzerConfig,
    sim: CacheSimulator,
    window: EventRing,
    /// Newest events in the window not yet simulated
    pending: usize,
    simulated: u64,

    /// Simulated events per line still in the window
    window_lines: FxHashMap<u64, u32>,
    window_pages: FxHashMap<u64, u32>,
    threads: FxHashSet<u32>,

    /// Line-access ordinal of each line's last touch, bounded by
    /// `history_lines`
    last_touch: FxHashMap<u64, u64>,
    /// Times the touch history was dropped for exceeding its bound
    history_rollovers: u64,
    ordinal: u64,
    reuses: u64,
    reuse_distances: Histogram<u64>,

    compulsory: u64,
    capacity: u64,
    conflict: u64,
    runs: RunTracker,
}

impl L1Analyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self> {
        if config.window == 0 {
            return Err(ArenaError::config("analyzer window must be non-zero"));
        }
        if config.history_lines < config.geometry.lines() {
            return Err(ArenaError::config("analyzer history must cover every cache line"));
        }
        let sim = CacheSimulator::new(config.geometry)?;
        let reuse_distances = Histogram::new_with_bounds(1, MAX_REUSE_DISTANCE, 3)
            .map_err(|e| ArenaError::config(format!("reuse histogram: {e}")))?;
        Ok(Self {
            config,
            sim,
            window: EventRing::with_capacity(config.window),
            pending: 0,
            simulated: 0,
            window_lines: FxHashMap::default(),
            window_pages: FxHashMap::default(),
            threads: FxHashSet::default(),
            last_touch: FxHashMap::default(),
            history_rollovers: 0,
            ordinal: 0,
            reuses: 0,
            reuse_distances,
            compulsory: 0,
            capacity: 0,
            conflict: 0,
            runs: RunTracker::default(),
        })
    }

    /// Default geometry and window, in the given mode.
    pub fn with_mode(mode: AnalysisMode) -> Result<Self> {
        Self::new(AnalyzerConfig {
            mode,
            ..AnalyzerConfig::default()
        })
    }

    #[inline]
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    #[inline]
    pub fn simulator(&self) -> &CacheSimulator {
        &self.sim
    }

    /// Events currently in the window, oldest first.
    #[inline]
    pub fn window(&self) -> &EventRing {
        &self.window
    }

    /// Events recorded but not yet simulated.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Lines currently held in the touch history.
    #[inline]
    pub fn history_len(&self) -> usize {
        self.last_touch.len()
    }

    /// Times the touch history exceeded `history_lines` and was dropped.
    #[inline]
    pub fn history_rollovers(&self) -> u64 {
        self.history_rollovers
    }

    /// Add one event to the window.
    pub fn record(&mut self, event: MemoryAccessEvent) {
        if self.window.is_full() && self.pending == self.window.len() {
            self.simulate_oldest_pending();
        }
        if let Some(old) = self.window.push(event) {
            self.forget(&old);
        }
        self.pending += 1;
        if self.config.mode == AnalysisMode::RealTime {
            self.flush();
        }
    }

    /// Add events in order.
    pub fn record_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a MemoryAccessEvent>) {
        for event in events {
            self.record(*event);
        }
    }

    /// Simulate everything pending.
    pub fn flush(&mut self) {
        while self.pending > 0 {
            self.simulate_oldest_pending();
        }
    }

    /// Simulate pending events and summarize the current state.
    pub fn analyze(&mut self) -> L1Analysis {
        self.flush();
        let geometry = self.config.geometry;
        let sim = self.sim.stats();

        let working_set_bytes = self.window_lines.len() * geometry.line_size;
        let working_set_fit = working_set_bytes as f64 / geometry.size as f64;

        let (mean_reuse_distance, p99_reuse_distance) = if self.reuse_distances.is_empty() {
            (0.0, 0)
        } else {
            (
                self.reuse_distances.mean(),
                self.reuse_distances.value_at_quantile(0.99),
            )
        };
        let reuse_fraction = ratio(self.reuses, self.ordinal);
        let temporal_score = reuse_fraction / (1.0 + mean_reuse_distance / geometry.lines() as f64);

        let mean_run = self.runs.mean_lines_per_run();
        let spatial_score = if mean_run > 0.0 { 1.0 - 1.0 / mean_run } else { 0.0 };

        let mut analysis = L1Analysis {
            geometry,
            events: self.simulated,
            sim,
            hit_rate: sim.hit_rate(),
            read_hit_rate: sim.read_hit_rate(),
            write_hit_rate: sim.write_hit_rate(),
            compulsory_misses: self.compulsory,
            capacity_misses: self.capacity,
            conflict_misses: self.conflict,
            working_set_bytes,
            working_set_fit,
            distinct_pages: self.window_pages.len(),
            distinct_threads: self.threads.len(),
            mean_reuse_distance,
            p99_reuse_distance,
            temporal_score,
            spatial_score,
            recommendations: Recommendations::new(),
        };
        analysis.recommendations = recommend(&analysis);
        analysis
    }

    /// Drop all state, keeping the configuration.
    pub fn reset(&mut self) {
        self.sim.reset();
        self.window.clear();
        self.pending = 0;
        self.simulated = 0;
        self.window_lines.clear();
        self.window_pages.clear();
        self.threads.clear();
        self.last_touch.clear();
        self.history_rollovers = 0;
        self.ordinal = 0;
        self.reuses = 0;
        self.reuse_distances.reset();
        self.compulsory = 0;
        self.capacity = 0;
        self.conflict = 0;
        self.runs = RunTracker::default();
    }

    fn simulate_oldest_pending(&mut self) {
        let index = self.window.len() - self.pending;
        if let Some(&event) = self.window.get(index) {
            self.simulate(&event);
        }
        self.pending -= 1;
    }

    fn simulate(&mut self, event: &MemoryAccessEvent) {
        let geometry = self.config.geometry;
        let (first, last) = event.line_span(geometry.line_size as u64);
        for line in first..=last {
            *self.window_lines.entry(line).or_insert(0) += 1;
            *self.window_pages.entry(line * geometry.line_size as u64 / PAGE_SIZE).or_insert(0) += 1;

            let outcome = self.sim.access_line(line, event.is_write);
            let previous = self.last_touch.insert(line, self.ordinal);
            if !outcome.hit {
                match self.classify_miss(previous.is_none()) {
                    MissKind::Compulsory => self.compulsory += 1,
                    MissKind::Capacity => self.capacity += 1,
                    MissKind::Conflict => self.conflict += 1,
                }
            }
            if let Some(previous) = previous {
                self.reuses += 1;
                self.reuse_distances.saturating_record(self.ordinal - previous);
            }
            self.ordinal += 1;
            self.runs.observe(line);

            if self.last_touch.len() > self.config.history_lines {
                self.last_touch.clear();
                self.history_rollovers += 1;
            }
        }

        if let Some(thread) = event.thread_id {
            self.threads.insert(thread);
        }
        self.simulated += 1;
    }

    #[inline]
    fn classify_miss(&self, first_touch: bool) -> MissKind {
        if first_touch {
            MissKind::Compulsory
        } else if self.window_lines.len() > self.config.geometry.lines() {
            MissKind::Capacity
        } else {
            MissKind::Conflict
        }
    }

    /// Remove an event leaving the window from the per-window counts.
    fn forget(&mut self, event: &MemoryAccessEvent) {
        let line_size = self.config.geometry.line_size as u64;
        let (first, last) = event.line_span(line_size);
        for line in first..=last {
            release(&mut self.window_lines, line);
            release(&mut self.window_pages, line * line_size / PAGE_SIZE);
        }
    }
}

#[inline]
fn release(counts: &mut FxHashMap<u64, u32>, key: u64) {
    if let Some(count) = counts.get_mut(&key) {
        *count -= 1;
        if *count == 0 {
            counts.remove(&key);
        }
    }
}

/// Derive the recommendation set from a finished analysis.
///
/// Each kind is produced at most once; the result is ordered by estimated
/// speedup, largest first.
pub fn recommend(analysis: &L1Analysis) -> Recommendations {
    let mut out = Recommendations::new();
    if analysis.sim.accesses == 0 {
        return out;
    }
    let geometry = analysis.geometry;
    let (_, capacity_rate, conflict_rate) = analysis.miss_breakdown();
    let miss_rate = analysis.miss_rate();

    if conflict_rate > CONFLICT_THRESHOLD {
        push(
            &mut out,
            RecommendationKind::AddPadding,
            1.0 + conflict_rate,
            Difficulty::Easy,
            Some(geometry.line_size),
            format!(
                "{:.1}% of accesses are conflict misses; pad hot structures by one line",
                conflict_rate * 100.0
            ),
        );
        push(
            &mut out,
            RecommendationKind::ChangeAlignment,
            1.0 + conflict_rate / 2.0,
            Difficulty::Easy,
            Some(geometry.line_size),
            format!("align allocations to {} bytes", geometry.line_size),
        );
    }

    if analysis.working_set_fit > 1.0 && analysis.capacity_misses > 0 {
        let block = geometry.size / 2;
        push(
            &mut out,
            RecommendationKind::LoopBlocking,
            1.0 + capacity_rate * 2.0,
            Difficulty::Hard,
            Some(block),
            format!(
                "working set is {:.2}x the cache; process data in {} byte tiles",
                analysis.working_set_fit, block
            ),
        );
    }

    if analysis.spatial_score < POOR_SPATIAL && miss_rate > 0.0 {
        push(
            &mut out,
            RecommendationKind::ReorderData,
            1.0 + miss_rate / 2.0,
            Difficulty::Moderate,
            None,
            format!(
                "spatial score {:.2}; group fields and records that are used together",
                analysis.spatial_score
            ),
        );
    }

    if analysis.hit_rate < LOW_HIT_RATE && analysis.spatial_score >= POOR_SPATIAL {
        let distance = if analysis.spatial_score >= GOOD_SPATIAL { 4 } else { 2 };
        push(
            &mut out,
            RecommendationKind::AdjustPrefetch,
            1.0 + (LOW_HIT_RATE - analysis.hit_rate),
            Difficulty::Easy,
            Some(distance),
            format!(
                "hit rate {:.1}% with sequential runs; prefetch {} lines ahead",
                analysis.hit_rate * 100.0,
                distance
            ),
        );
    }

    if analysis.distinct_pages > TLB_ENTRIES {
        push(
            &mut out,
            RecommendationKind::HugePages,
            1.05 + miss_rate / 10.0,
            Difficulty::Moderate,
            None,
            format!("{} distinct pages in the window exceed the TLB", analysis.distinct_pages),
        );
    }

    if analysis.distinct_threads > 1 {
        push(
            &mut out,
            RecommendationKind::ThreadAffinity,
            1.10,
            Difficulty::Easy,
            None,
            format!("{} threads share this window; pin each to a core", analysis.distinct_threads),
        );
        push(
            &mut out,
            RecommendationKind::NumaBinding,
            1.05,
            Difficulty::Moderate,
            None,
            "bind backing memory to the node of the pinned core".to_string(),
        );
    }

    out.sort_by(|a, b| b.estimated_speedup.total_cmp(&a.estimated_speedup));
    out
}

fn push(
    out: &mut Recommendations,
    kind: RecommendationKind,
    estimated_speedup: f64,
    difficulty: Difficulty,
    parameter: Option<usize>,
    description: String,
) {
    if out.iter().any(|r| r.kind == kind) {
        return;
    }
    let _ = out.try_push(Recommendation {
        kind,
        estimated_speedup,
        difficulty,
        parameter,
        description,
    });
}
