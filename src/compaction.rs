//! Compaction
//!
//! Rewrites the live records of fragmented segments into the writable
//! segment and deletes the originals.
//!
//! ## Candidate Selection
//! A segment qualifies when it holds data, is at least
//! `compaction_min_segment_size` bytes and at least
//! `compaction_min_fragmentation` of it is superseded records.
//!
//! ## Concurrency
//! Only one compaction runs at a time; a second caller gets `Busy`. The
//! engine lock is taken per record, so readers and writers interleave with
//! a running compaction.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::engine::{Shared, State};
use crate::error::{KeyhiveError, Result};
use crate::index::Slot;

/// Outcome of one compaction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Segments rewritten and deleted
    pub compacted_segments: u32,
    /// Superseded records dropped
    pub reclaimed_records: u64,
    /// Bytes held by those records
    pub reclaimed_bytes: u64,
}

/// Clears the running flag when compaction ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| KeyhiveError::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) fn compact(shared: &Shared) -> Result<CompactionResult> {
    let _running = RunningGuard::acquire(&shared.compaction_running)?;
    let mut result = CompactionResult::default();

    let candidates = pick_candidates(shared);
    if candidates.is_empty() {
        return Ok(result);
    }
    debug!(segments = ?candidates, "compaction candidates");

    for id in candidates {
        compact_segment(shared, id, &mut result)?;
        result.compacted_segments += 1;
    }

    if result.compacted_segments > 0 {
        shared.metrics.record_compaction();
        info!(
            segments = result.compacted_segments,
            reclaimed_records = result.reclaimed_records,
            reclaimed_bytes = result.reclaimed_bytes,
            "compaction finished"
        );
    }
    Ok(result)
}

fn pick_candidates(shared: &Shared) -> Vec<u16> {
    let min_size = shared.options.compaction_min_segment_size as u64;
    let min_fragmentation = shared.options.compaction_min_fragmentation;
    let state = shared.state.read();
    state
        .datalog
        .segments_by_sequence_id()
        .into_iter()
        .filter(|s| s.size() > 0 && s.size() >= min_size && s.fragmentation() >= min_fragmentation)
        .map(|s| s.id())
        .collect()
}

fn compact_segment(shared: &Shared, id: u16, result: &mut CompactionResult) -> Result<()> {
    // Seal the segment so no new records land in it while it is copied
    let records = {
        let mut state = shared.state.write();
        let Some(segment) = state.datalog.segment_mut(id) else {
            return Ok(());
        };
        segment.meta.full = true;
        state.datalog.iter_segment(id)
    };
    let Some(records) = records else {
        return Ok(());
    };

    let mut moved = 0u64;
    for record in records {
        let record = record?;
        let hash = shared.hash(record.key());

        let mut state = shared.state.write();
        let State { index, datalog, .. } = &mut *state;
        let at_record = |slot: &Slot| Ok(slot.segment_id == record.segment_id && slot.offset == record.offset);

        if !index.get(hash, at_record)? {
            result.reclaimed_records += 1;
            result.reclaimed_bytes += record.encoded_size() as u64;
            continue;
        }

        let (segment_id, offset) = datalog.write_record(&record.data)?;
        let slot = Slot {
            hash,
            segment_id,
            key_size: record.key_size(),
            offset,
        };
        index.put(slot, at_record)?;
        moved += 1;
    }

    // Copies must be durable before the originals go away
    let mut state = shared.state.write();
    if moved > 0 {
        state.datalog.sync()?;
    }
    state.datalog.remove_segment(id)?;
    debug!(segment = id, moved, "compacted segment");
    Ok(())
}
