//! Configuration for Keyhive
//!
//! Centralized options with sensible defaults.

use std::fmt;
use std::time::Duration;

use crate::error::{KeyhiveError, Result};
use crate::hash::{self, HashFn};

/// Options for opening a store
#[derive(Clone)]
pub struct Options {
    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------
    /// When buffered segment writes are flushed to disk
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Datalog
    // -------------------------------------------------------------------------
    /// Segment size (in bytes, excluding the header) that triggers rotation
    pub max_segment_size: u32,

    // -------------------------------------------------------------------------
    // Compaction
    // -------------------------------------------------------------------------
    /// How often the background worker runs compaction. Zero disables it.
    pub compaction_interval: Duration,

    /// Segments smaller than this are never compacted
    pub compaction_min_segment_size: u32,

    /// Minimum share of superseded bytes (0.0..=1.0) before a segment is compacted
    pub compaction_min_fragmentation: f32,

    // -------------------------------------------------------------------------
    // Hashing
    // -------------------------------------------------------------------------
    /// Seeded 32-bit hash applied to keys
    pub hasher: HashFn,
}

/// Sync strategy for the writable segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync from the background worker. A zero interval never fires.
    Interval(Duration),

    /// Only on explicit `Engine::sync` and on close
    Manual,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_strategy: SyncStrategy::Manual,
            max_segment_size: u32::MAX,
            compaction_interval: Duration::ZERO,
            compaction_min_segment_size: 32 * 1024 * 1024, // 32 MB
            compaction_min_fragmentation: 0.5,
            hasher: hash::xxh32_with_seed,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("sync_strategy", &self.sync_strategy)
            .field("max_segment_size", &self.max_segment_size)
            .field("compaction_interval", &self.compaction_interval)
            .field("compaction_min_segment_size", &self.compaction_min_segment_size)
            .field("compaction_min_fragmentation", &self.compaction_min_fragmentation)
            .finish_non_exhaustive()
    }
}

impl Options {
    /// Create a new options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// Interval for background syncs, if any
    pub(crate) fn background_sync_interval(&self) -> Duration {
        match self.sync_strategy {
            SyncStrategy::Interval(every) => every,
            _ => Duration::ZERO,
        }
    }

    pub(crate) fn sync_writes(&self) -> bool {
        self.sync_strategy == SyncStrategy::EveryWrite
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size == 0 {
            return Err(KeyhiveError::Config(
                "max_segment_size must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction_min_fragmentation) {
            return Err(KeyhiveError::Config(format!(
                "compaction_min_fragmentation must be within 0.0..=1.0, got {}",
                self.compaction_min_fragmentation
            )));
        }
        Ok(())
    }
}

/// Builder for Options
#[derive(Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.options.sync_strategy = strategy;
        self
    }

    /// Set the segment rotation threshold (in bytes)
    pub fn max_segment_size(mut self, size: u32) -> Self {
        self.options.max_segment_size = size;
        self
    }

    /// Set the background compaction interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.options.compaction_interval = interval;
        self
    }

    /// Set the minimum segment size eligible for compaction (in bytes)
    pub fn compaction_min_segment_size(mut self, size: u32) -> Self {
        self.options.compaction_min_segment_size = size;
        self
    }

    /// Set the minimum fragmentation ratio eligible for compaction
    pub fn compaction_min_fragmentation(mut self, ratio: f32) -> Self {
        self.options.compaction_min_fragmentation = ratio;
        self
    }

    /// Replace the key hash function
    pub fn hasher(mut self, hasher: HashFn) -> Self {
        self.options.hasher = hasher;
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}
