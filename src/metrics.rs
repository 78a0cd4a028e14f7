//! Engine counters
//!
//! Lock-free counters updated on the hot path and readable at any time.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters for one open engine
#[derive(Debug, Default)]
pub struct Metrics {
    puts: AtomicU64,
    gets: AtomicU64,
    hash_collisions: AtomicU64,
    compactions: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub hash_collisions: u64,
    pub compactions: u64,
}

impl Metrics {
    /// Keys written (including `has_or_put` inserts)
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Existence checks
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Slots whose hash matched but whose key did not
    pub fn hash_collisions(&self) -> u64 {
        self.hash_collisions.load(Ordering::Relaxed)
    }

    /// Compaction runs that rewrote at least one segment
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts(),
            gets: self.gets(),
            hash_collisions: self.hash_collisions(),
            compactions: self.compactions(),
        }
    }

    pub(crate) fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hash_collision(&self) {
        self.hash_collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }
}
