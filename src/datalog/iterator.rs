//! Segment Iterator
//!
//! Sequential scan over the records of one segment.

use std::io::BufReader;
use std::iter::FusedIterator;
use std::sync::Arc;

use crate::error::Result;
use crate::file::{DataFile, DataFileReader};

use super::record::{decode_record, Record};

/// Iterator over the records of a segment, in write order.
///
/// Holds its own handle on the segment file, so it stays valid while the
/// datalog keeps changing. Yields `Truncated`/`Corrupted` errors once and
/// then stops.
pub struct SegmentIterator {
    segment_id: u16,
    /// Offset of the next record; after an error, the end of the valid prefix
    offset: u32,
    reader: BufReader<DataFileReader>,
    done: bool,
}

impl SegmentIterator {
    /// Scan `file` from the first record up to `end` bytes
    pub(crate) fn new(segment_id: u16, file: Arc<DataFile>, end: u64) -> Self {
        Self {
            segment_id,
            offset: 0,
            reader: BufReader::new(DataFileReader::new(file, 0, end)),
            done: false,
        }
    }

    pub fn segment_id(&self) -> u16 {
        self.segment_id
    }

    /// Bytes of well-formed records consumed so far
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl Iterator for SegmentIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match decode_record(&mut self.reader, self.segment_id, self.offset) {
            Ok(Some(record)) => {
                self.offset += record.encoded_size();
                Some(Ok(record))
            }
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

impl FusedIterator for SegmentIterator {}
