//! Key enumeration
//!
//! Walks every segment's records in write order and yields the ones the
//! index still points at, so each live key comes out exactly once.
//!
//! The set of segments and their lengths is fixed when the iterator is
//! created. Keys first written afterwards are not seen. A key that existed
//! at creation but was rewritten past the snapshot since (by `put` or by
//! compaction) is yielded at one of its old records instead.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::datalog::{Datalog, SegmentIterator};
use crate::engine::Shared;
use crate::error::Result;
use crate::index::Slot;

/// Iterator over all keys of an engine
///
/// Yields `Ok(key)` per live key. After the last key, or after the first
/// error, it returns `None` forever.
pub struct ItemIterator<'a> {
    shared: &'a Shared,
    segments: VecDeque<SegmentIterator>,
    current: Option<SegmentIterator>,
    /// Segment id → (sequence id, length) at creation
    snapshot: HashMap<u16, (u64, u64)>,
    /// Keys already yielded from a record the index no longer points at
    moved: HashSet<Vec<u8>>,
    done: bool,
}

impl<'a> ItemIterator<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        let mut segments = VecDeque::new();
        let mut snapshot = HashMap::new();
        {
            let state = shared.state.read();
            for segment in state.datalog.segments_by_sequence_id() {
                snapshot.insert(segment.id(), (segment.sequence_id(), segment.size()));
                if let Some(records) = state.datalog.iter_segment(segment.id()) {
                    segments.push_back(records);
                }
            }
        }
        Self {
            shared,
            segments,
            current: None,
            snapshot,
            moved: HashSet::new(),
            done: false,
        }
    }

    /// Whether `slot` addresses a record this iterator will scan
    fn in_snapshot(&self, datalog: &Datalog, slot: &Slot) -> bool {
        let Some(segment) = datalog.segment(slot.segment_id) else {
            return false;
        };
        match self.snapshot.get(&slot.segment_id) {
            Some(&(sequence_id, end)) => {
                sequence_id == segment.sequence_id() && (slot.offset as u64) < end
            }
            None => false,
        }
    }

    /// Pull the next live key, or None once every segment is exhausted
    fn next_key(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.current.is_none() {
                match self.segments.pop_front() {
                    Some(next) => self.current = Some(next),
                    None => return Ok(None),
                }
            }
            let next = match self.current.as_mut() {
                Some(segment) => segment.next().transpose()?,
                None => continue,
            };

            let Some(record) = next else {
                self.current = None;
                continue;
            };

            let hash = self.shared.hash(record.key());
            let mut moved_out = false;
            let state = self.shared.state.read();
            let found = state.index.get(hash, |slot| {
                if slot.segment_id == record.segment_id && slot.offset == record.offset {
                    return Ok(true);
                }
                if self.in_snapshot(&state.datalog, slot) {
                    return Ok(false);
                }
                if state.datalog.read_key(slot)? == record.key() {
                    moved_out = true;
                    return Ok(true);
                }
                Ok(false)
            })?;
            drop(state);
            if !found {
                continue;
            }
            if !moved_out {
                return Ok(Some(record.into_key()));
            }
            let key = record.into_key();
            if self.moved.insert(key.clone()) {
                return Ok(Some(key));
            }
        }
    }
}

impl Iterator for ItemIterator<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_key() {
            Ok(Some(key)) => Some(Ok(key)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for ItemIterator<'_> {}
