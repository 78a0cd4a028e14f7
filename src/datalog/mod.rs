//! Datalog Module
//!
//! The write-ahead log: an ordered collection of append-only segments.
//!
//! ## Responsibilities
//! - Append key records to the single writable segment
//! - Rotate to a fresh segment when the writable one fills up
//! - Resolve index slots back to key bytes (checksum verified)
//! - Track per-segment statistics for compaction
//!
//! ## Directory Layout
//! ```text
//! {dir}/
//!   ├── 00000-1.psg        (segment 0, sequence 1)
//!   ├── 00000-1.psg.pmt    (its metadata, written on close)
//!   ├── 00001-2.psg
//!   └── ...
//! ```

mod iterator;
pub mod record;
mod segment;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{KeyhiveError, Result};
use crate::index::Slot;

pub use iterator::SegmentIterator;
pub use record::{decode_record, encode_record, encoded_record_size, Record};
pub use segment::{parse_segment_name, segment_name, Segment, SegmentMeta, MAX_SEGMENTS, SEGMENT_EXT};

/// Append-only segmented log of key records
pub struct Datalog {
    dir: PathBuf,
    max_segment_size: u32,
    /// Open segments indexed by physical id
    segments: Vec<Option<Segment>>,
    /// Physical id of the writable segment
    current: u16,
    max_sequence_id: u64,
}

impl Datalog {
    /// Open every segment in `dir` and pick (or create) the writable one
    pub fn open(dir: &Path, max_segment_size: u32) -> Result<Self> {
        let mut datalog = Self {
            dir: dir.to_path_buf(),
            max_segment_size,
            segments: Vec::new(),
            current: 0,
            max_sequence_id: 0,
        };

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((id, sequence_id)) = name.to_str().and_then(parse_segment_name) else {
                continue;
            };
            let segment = Segment::open(dir, id, sequence_id)?;
            datalog.max_sequence_id = datalog.max_sequence_id.max(sequence_id);
            datalog.insert(segment);
        }

        datalog.swap_segment()?;
        Ok(datalog)
    }

    /// Append a key, returning `(segment_id, offset)` of its record
    pub fn put(&mut self, key: &[u8]) -> Result<(u16, u32)> {
        let data = encode_record(key)?;
        self.write_record(&data)
    }

    /// Append an already-encoded record
    pub(crate) fn write_record(&mut self, data: &[u8]) -> Result<(u16, u32)> {
        let max = self.max_segment_size as u64;
        let needs_rotation = {
            let current = self.current_segment()?;
            let size = current.size();
            current.meta.full || (size > 0 && size + data.len() as u64 > max)
        };
        if needs_rotation {
            let sealed = self.current_segment_mut()?;
            sealed.meta.full = true;
            sealed.file.sync()?;
            self.swap_segment()?;
        }

        let current = self.current_segment_mut()?;
        let offset = current.file.append(data)?;
        current.meta.put_records += 1;
        let offset = u32::try_from(offset).map_err(|_| {
            KeyhiveError::Full(format!("segment {} exceeds addressable size", current.name))
        })?;
        Ok((current.id, offset))
    }

    /// Read the key a slot points at
    pub fn read_key(&self, slot: &Slot) -> Result<Vec<u8>> {
        let segment = self.segment(slot.segment_id).ok_or_else(|| {
            KeyhiveError::Corrupted(format!("slot references missing segment {}", slot.segment_id))
        })?;

        let size = encoded_record_size(slot.key_size as u32) as usize;
        let mut data = vec![0u8; size];
        segment.file.read_at(&mut data, slot.offset as u64)?;

        let stored_size = u16::from_le_bytes([data[0], data[1]]);
        if stored_size != slot.key_size {
            return Err(KeyhiveError::Corrupted(format!(
                "key size mismatch in segment {} at offset {}: slot {}, record {}",
                slot.segment_id, slot.offset, slot.key_size, stored_size
            )));
        }
        record::verify_checksum(&data, slot.segment_id, slot.offset)?;

        data.truncate(size - 4);
        data.drain(..2);
        Ok(data)
    }

    /// Account for a record whose key was written again elsewhere
    pub(crate) fn track_superseded(&mut self, slot: &Slot) {
        if let Some(segment) = self.segment_mut(slot.segment_id) {
            segment.meta.deleted_keys += 1;
            segment.meta.deleted_bytes += encoded_record_size(slot.key_size as u32);
        }
    }

    /// Flush the writable segment to disk
    pub fn sync(&self) -> Result<()> {
        self.current_segment()?.file.sync()
    }

    /// Persist segment metadata and release all segment handles.
    ///
    /// Every segment is attempted; the first failure is returned.
    pub fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for segment in self.segments.drain(..).flatten() {
            let result = segment.file.sync().and_then(|_| segment.save_meta(&self.dir));
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sync every segment and persist its metadata without closing
    pub(crate) fn persist(&self) -> Result<()> {
        for segment in self.segments.iter().flatten() {
            segment.file.sync()?;
            segment.save_meta(&self.dir)?;
        }
        Ok(())
    }

    /// Drop everything past `size` bytes of a segment's records
    pub(crate) fn truncate_segment(&self, id: u16, size: u32) -> Result<()> {
        let segment = self
            .segment(id)
            .ok_or_else(|| KeyhiveError::Corrupted(format!("no segment with id {}", id)))?;
        segment.file.truncate(size as u64)
    }

    /// Mark every segment but the newest full and make the newest writable
    pub(crate) fn seal_all_but_newest(&mut self) {
        let ids: Vec<u16> = self.segments_by_sequence_id().iter().map(|s| s.id).collect();
        if let Some((&newest, older)) = ids.split_last() {
            for &id in older {
                if let Some(segment) = self.segment_mut(id) {
                    segment.meta.full = true;
                }
            }
            if let Some(segment) = self.segment_mut(newest) {
                segment.meta.full = false;
            }
            self.current = newest;
        }
    }

    /// Segments in write order (ascending sequence id)
    pub fn segments_by_sequence_id(&self) -> Vec<&Segment> {
        let mut segments: Vec<&Segment> = self.segments.iter().flatten().collect();
        segments.sort_by_key(|s| s.sequence_id);
        segments
    }

    pub fn segment(&self, id: u16) -> Option<&Segment> {
        self.segments.get(id as usize).and_then(Option::as_ref)
    }

    pub(crate) fn segment_mut(&mut self, id: u16) -> Option<&mut Segment> {
        self.segments.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Physical id of the writable segment
    pub fn current_segment_id(&self) -> u16 {
        self.current
    }

    /// Iterate the records of a segment as of now
    pub fn iter_segment(&self, id: u16) -> Option<SegmentIterator> {
        self.segment(id)
            .map(|s| SegmentIterator::new(s.id, Arc::clone(&s.file), s.size()))
    }

    /// Delete a segment and its metadata from disk
    pub(crate) fn remove_segment(&mut self, id: u16) -> Result<()> {
        let segment = self
            .segments
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or_else(|| KeyhiveError::Corrupted(format!("no segment with id {}", id)))?;
        segment.remove_files(&self.dir)?;
        info!(segment = %segment.name, "removed segment");

        if self.current == id {
            self.swap_segment()?;
        }
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn insert(&mut self, segment: Segment) {
        let id = segment.id as usize;
        if self.segments.len() <= id {
            self.segments.resize_with(id + 1, || None);
        }
        self.segments[id] = Some(segment);
    }

    fn current_segment(&self) -> Result<&Segment> {
        self.segment(self.current)
            .ok_or_else(|| KeyhiveError::Corrupted("no writable segment".to_string()))
    }

    fn current_segment_mut(&mut self) -> Result<&mut Segment> {
        let current = self.current;
        self.segment_mut(current)
            .ok_or_else(|| KeyhiveError::Corrupted("no writable segment".to_string()))
    }

    /// Make the oldest non-full segment writable, creating one if needed
    fn swap_segment(&mut self) -> Result<()> {
        let open = self
            .segments_by_sequence_id()
            .into_iter()
            .find(|s| !s.meta.full)
            .map(|s| s.id);
        if let Some(id) = open {
            self.current = id;
            return Ok(());
        }

        let id = self.segments.iter().position(Option::is_none).unwrap_or(self.segments.len());
        if id >= MAX_SEGMENTS {
            return Err(KeyhiveError::Full(format!(
                "number of segments exceeds {}",
                MAX_SEGMENTS
            )));
        }
        self.max_sequence_id += 1;
        let segment = Segment::open(&self.dir, id as u16, self.max_sequence_id)?;
        debug!(segment = %segment.name, "created segment");
        self.insert(segment);
        self.current = id as u16;
        Ok(())
    }
}
