//! # Flash-Arena
//!
//! A bounded-latency arena allocator sized to fit the L1 data cache, with a
//! cache simulator that watches its own access stream and tunes it.
//!
//! ## Design Principles
//!
//! - **Single-Owner**: One thread owns an arena exclusively (no locks)
//! - **Bounded Work**: Allocate and free do a fixed number of steps
//! - **Cache-Aligned**: Every payload starts on a 64-byte line
//! - **One Region**: Memory is acquired once at creation and never grows
//!
//! ## Architecture
//!
//! ```text
//! [Arena] --allocate/free--> [Sub-Arenas: bump + 4 free lists]
//!    |
//!    +--access events--> [EventRing] --> [L1Analyzer + CacheSimulator]
//!                                                 |
//!                            [Recommendations] --> [tuning::optimize_layout]
//! ```

pub mod analyzer;
pub mod arena;
pub mod branchless;
pub mod bulk;
pub mod cache_sim;
pub mod config;
pub mod error;
pub mod event;
pub mod header;
pub mod region;
pub mod stats;
pub mod sub_arena;
pub mod tuning;

#[cfg(feature = "runtime")]
pub mod feed;

// Re-exports for convenience
pub use analyzer::{
    AnalysisMode, AnalyzerConfig, Difficulty, L1Analysis, L1Analyzer, MissKind, Recommendation, RecommendationKind,
};
pub use arena::{AllocRequest, Arena, ArenaPtr, Lifetime};
pub use cache_sim::{AccessResult, CacheGeometry, CacheSimulator, SimStats};
pub use config::{ArenaConfig, WorkloadProfile};
pub use error::{ArenaError, CorruptionReason, ErrorKind, Result};
pub use event::{EventRing, MemoryAccessEvent};
pub use region::{BackingProvider, HeapProvider};
#[cfg(unix)]
pub use region::MmapProvider;
pub use stats::{Counters, PerformanceMetrics};
pub use tuning::{optimize_layout, pin_current_thread, tune_for_workload, tune_for_workload_named, TuningChange, TuningReport};

#[cfg(feature = "runtime")]
pub use feed::{event_channel, EventSink, EventSource};
