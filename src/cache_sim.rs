//! Cache Simulator - a set-associative L1 model with true LRU replacement.
//!
//! The simulator only ever sees addresses. It keeps `sets x ways` line
//! entries and a per-set age vector, and answers hit or miss per access.
//! Replaying the same address sequence from the same initial state always
//! yields the same classifications.
//!
//! # LRU Ages
//!
//! Within a set, age 0 is the most recently used way. On a hit, every way
//! younger than the hit way ages by one and the hit way becomes 0. On a
//! miss, the victim is the first invalid way or else the oldest valid way
//! (lowest index on ties); all other ways age by one and the victim becomes 0.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::branchless::is_power_of_two;
use crate::error::{ArenaError, Result};
use crate::event::MemoryAccessEvent;

/// Target cache geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheGeometry {
    /// Capacity in bytes
    pub size: usize,
    /// Line size in bytes
    pub line_size: usize,
    /// Associativity
    pub ways: usize,
}

impl Default for CacheGeometry {
    /// A typical 32 KiB, 64-byte line, 8-way L1 data cache.
    fn default() -> Self {
        Self {
            size: 32 * 1024,
            line_size: 64,
            ways: 8,
        }
    }
}

impl CacheGeometry {
    pub const fn new(size: usize, line_size: usize, ways: usize) -> Self {
        Self { size, line_size, ways }
    }

    /// Check that every dimension is a power of two and that the cache
    /// holds at least one full set.
    pub fn validate(self) -> Result<Self> {
        if !is_power_of_two(self.size) || !is_power_of_two(self.line_size) || !is_power_of_two(self.ways) {
            return Err(ArenaError::config(format!(
                "cache geometry {}B/{}B/{}-way must use powers of two",
                self.size, self.line_size, self.ways
            )));
        }
        if self.size == 0 || self.line_size == 0 || self.ways == 0 || self.size < self.line_size * self.ways {
            return Err(ArenaError::config(format!(
                "cache geometry {}B/{}B/{}-way has no complete set",
                self.size, self.line_size, self.ways
            )));
        }
        Ok(self)
    }

    #[inline]
    pub const fn sets(&self) -> usize {
        self.size / (self.line_size * self.ways)
    }

    /// Total number of lines the cache holds.
    #[inline]
    pub const fn lines(&self) -> usize {
        self.size / self.line_size
    }

    /// Line index of an address.
    #[inline]
    pub const fn line_of(&self, address: u64) -> u64 {
        address / self.line_size as u64
    }

    /// Set a line index maps to.
    #[inline]
    pub const fn set_of_line(&self, line: u64) -> usize {
        (line % self.sets() as u64) as usize
    }

    /// Tag of a line index.
    #[inline]
    pub const fn tag_of_line(&self, line: u64) -> u64 {
        line / self.sets() as u64
    }
}

/// One way of one set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LineState {
    /// Address of the first byte of the cached line
    pub address: u64,
    pub set: u32,
    pub tag: u64,
    pub way: u32,
    pub valid: bool,
    /// Written since it was filled
    pub dirty: bool,
    /// Accesses since it was filled
    pub access_count: u64,
    /// Simulator clock at the most recent access
    pub last_access: u64,
}

/// All ways of one set plus their LRU ages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetState {
    pub lines: Vec<LineState>,
    pub ages: Vec<u32>,
}

impl SetState {
    fn new(set: u32, ways: usize) -> Self {
        let lines = (0..ways)
            .map(|way| LineState {
                set,
                way: way as u32,
                ..LineState::default()
            })
            .collect();
        Self {
            lines,
            ages: vec![0; ways],
        }
    }

    /// Way holding `tag`, if any.
    #[inline]
    pub fn find(&self, tag: u64) -> Option<usize> {
        self.lines.iter().position(|l| l.valid && l.tag == tag)
    }

    /// Way a miss would fill.
    #[inline]
    pub fn victim(&self) -> usize {
        if let Some(way) = self.lines.iter().position(|l| !l.valid) {
            return way;
        }
        let mut victim = 0;
        for way in 1..self.ages.len() {
            if self.ages[way] > self.ages[victim] {
                victim = way;
            }
        }
        victim
    }

    /// Number of valid ways.
    pub fn occupancy(&self) -> usize {
        self.lines.iter().filter(|l| l.valid).count()
    }
}

/// Hit or miss for one access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessResult {
    Hit,
    Miss,
}

impl AccessResult {
    #[inline]
    pub const fn is_hit(self) -> bool {
        matches!(self, AccessResult::Hit)
    }
}

/// Outcome of touching a single line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineAccess {
    /// Line index touched
    pub line: u64,
    pub set: usize,
    pub way: usize,
    pub hit: bool,
    /// Line index evicted to make room, if a valid line was replaced
    pub evicted: Option<u64>,
    /// The evicted line was dirty
    pub writeback: bool,
}

/// Running totals of a simulator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    /// Line accesses (a multi-line access counts once per line)
    pub accesses: u64,
    pub hits: u64,
    pub misses: u64,
    pub reads: u64,
    pub read_hits: u64,
    pub writes: u64,
    pub write_hits: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

impl SimStats {
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits, self.accesses)
    }

    #[inline]
    pub fn read_hit_rate(&self) -> f64 {
        ratio(self.read_hits, self.reads)
    }

    #[inline]
    pub fn write_hit_rate(&self) -> f64 {
        ratio(self.write_hits, self.writes)
    }
}

#[inline]
pub(crate) fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Set-associative LRU cache model.
#[derive(Clone)]
pub struct CacheSimulator {
    geometry: CacheGeometry,
    sets: Vec<SetState>,
    clock: u64,
    stats: SimStats,
}

impl CacheSimulator {
    /// An empty (all ways invalid) cache of the given geometry.
    pub fn new(geometry: CacheGeometry) -> Result<Self> {
        let geometry = geometry.validate()?;
        let sets = (0..geometry.sets())
            .map(|set| SetState::new(set as u32, geometry.ways))
            .collect();
        Ok(Self {
            geometry,
            sets,
            clock: 0,
            stats: SimStats::default(),
        })
    }

    #[inline]
    pub fn geometry(&self) -> CacheGeometry {
        self.geometry
    }

    #[inline]
    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Simulate one access. Spanning accesses touch every line they
    /// overlap and report a miss if any of those lines missed.
    pub fn access(&mut self, address: u64, size: u32, is_write: bool) -> AccessResult {
        let event = MemoryAccessEvent::new(address, size, is_write, 0);
        let (first, last) = event.line_span(self.geometry.line_size as u64);
        let mut result = AccessResult::Hit;
        for line in first..=last {
            if !self.access_line(line, is_write).hit {
                result = AccessResult::Miss;
            }
        }
        result
    }

    /// Simulate a batch of events in order. Returns how many hit.
    pub fn access_batch(&mut self, events: &[MemoryAccessEvent]) -> usize {
        events
            .iter()
            .filter(|e| self.access(e.address, e.size, e.is_write).is_hit())
            .count()
    }

    /// Simulate a touch of one line index.
    ///
    /// # Complexity
    /// O(ways)
    pub fn access_line(&mut self, line: u64, is_write: bool) -> LineAccess {
        self.clock += 1;
        let set_idx = self.geometry.set_of_line(line);
        let tag = self.geometry.tag_of_line(line);
        let line_size = self.geometry.line_size as u64;
        let sets = self.geometry.sets() as u64;
        let clock = self.clock;
        let set = &mut self.sets[set_idx];

        self.stats.accesses += 1;
        if is_write {
            self.stats.writes += 1;
        } else {
            self.stats.reads += 1;
        }

        if let Some(way) = set.find(tag) {
            let age = set.ages[way];
            for (other, other_age) in set.ages.iter_mut().enumerate() {
                if other != way && *other_age < age {
                    *other_age += 1;
                }
            }
            set.ages[way] = 0;
            let entry = &mut set.lines[way];
            entry.access_count += 1;
            entry.last_access = clock;
            entry.dirty |= is_write;

            self.stats.hits += 1;
            if is_write {
                self.stats.write_hits += 1;
            } else {
                self.stats.read_hits += 1;
            }
            return LineAccess {
                line,
                set: set_idx,
                way,
                hit: true,
                evicted: None,
                writeback: false,
            };
        }

        let way = set.victim();
        let old = set.lines[way];
        let evicted = old.valid.then(|| old.tag * sets + set_idx as u64);
        let writeback = old.valid && old.dirty;

        for (other, other_age) in set.ages.iter_mut().enumerate() {
            if other != way {
                *other_age = other_age.saturating_add(1);
            }
        }
        set.ages[way] = 0;
        set.lines[way] = LineState {
            address: line * line_size,
            set: set_idx as u32,
            tag,
            way: way as u32,
            valid: true,
            dirty: is_write,
            access_count: 1,
            last_access: clock,
        };

        self.stats.misses += 1;
        self.stats.evictions += evicted.is_some() as u64;
        self.stats.writebacks += writeback as u64;
        LineAccess {
            line,
            set: set_idx,
            way,
            hit: false,
            evicted,
            writeback,
        }
    }

    /// Look up the line holding `address` without touching LRU state.
    pub fn probe(&self, address: u64) -> Option<&LineState> {
        let line = self.geometry.line_of(address);
        let set = &self.sets[self.geometry.set_of_line(line)];
        set.find(self.geometry.tag_of_line(line)).map(|way| &set.lines[way])
    }

    /// Per-set inspection.
    #[inline]
    pub fn set(&self, index: usize) -> Option<&SetState> {
        self.sets.get(index)
    }

    /// Per-line inspection.
    #[inline]
    pub fn line(&self, set: usize, way: usize) -> Option<&LineState> {
        self.sets.get(set).and_then(|s| s.lines.get(way))
    }

    /// Valid lines across all sets.
    pub fn occupancy(&self) -> usize {
        self.sets.iter().map(SetState::occupancy).sum()
    }

    /// Invalidate every line and zero the statistics.
    pub fn reset(&mut self) {
        for (idx, set) in self.sets.iter_mut().enumerate() {
            *set = SetState::new(idx as u32, self.geometry.ways);
        }
        self.clock = 0;
        self.stats = SimStats::default();
    }
}

impl fmt::Debug for CacheSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSimulator")
            .field("geometry", &self.geometry)
            .field("occupancy", &self.occupancy())
            .field("stats", &self.stats)
            .finish()
    }
}
