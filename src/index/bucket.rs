//! Index buckets and slots
//!
//! ## Bucket Layout (512 bytes)
//! ```text
//! ┌───────────┬───────────┬─────────┬───────────────────────────┐
//! │ Next (8)  │ Count (2) │ Pad (2) │ Slots: 41 × 12 bytes      │
//! └───────────┴───────────┴─────────┴───────────────────────────┘
//! ```
//! `Next` is the absolute file position of the next overflow bucket, or 0.
//!
//! ## Slot Layout (12 bytes)
//! ```text
//! ┌───────────┬────────────────┬──────────────┬────────────┐
//! │ Hash (4)  │ Segment ID (2) │ Key Size (2) │ Offset (4) │
//! └───────────┴────────────────┴──────────────┴────────────┘
//! ```

use bytes::{Buf, BufMut};

use crate::error::{KeyhiveError, Result};
use crate::file::HEADER_SIZE;

/// Slots held by one bucket
pub const SLOTS_PER_BUCKET: usize = 41;

/// On-disk bucket size
pub const BUCKET_SIZE: u64 = 512;

const SLOT_SIZE: usize = 12;
const BUCKET_HEADER_SIZE: usize = 12;

/// Location of a key's record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Slot {
    pub hash: u32,
    pub segment_id: u16,
    pub key_size: u16,
    /// Record start, relative to the end of the segment header
    pub offset: u32,
}

/// Where a bucket lives: a main bucket or an overflow bucket, by payload offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BucketLoc {
    Main(u64),
    Overflow(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Bucket {
    pub slots: Vec<Slot>,
    /// Payload offset of the next overflow bucket
    pub next: Option<u64>,
}

impl Bucket {
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.slots.len() <= SLOTS_PER_BUCKET);
        let mut buf = Vec::with_capacity(BUCKET_SIZE as usize);
        buf.put_u64_le(self.next.map_or(0, |offset| offset + HEADER_SIZE));
        buf.put_u16_le(self.slots.len() as u16);
        buf.put_u16_le(0);
        for slot in &self.slots {
            buf.put_u32_le(slot.hash);
            buf.put_u16_le(slot.segment_id);
            buf.put_u16_le(slot.key_size);
            buf.put_u32_le(slot.offset);
        }
        buf.resize(BUCKET_SIZE as usize, 0);
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < BUCKET_HEADER_SIZE {
            return Err(KeyhiveError::Corrupted("short index bucket".to_string()));
        }
        let next = match data.get_u64_le() {
            0 => None,
            pos if pos < HEADER_SIZE => {
                return Err(KeyhiveError::Corrupted(format!(
                    "index bucket links into file header at {}",
                    pos
                )))
            }
            pos => Some(pos - HEADER_SIZE),
        };
        let count = data.get_u16_le() as usize;
        data.advance(2);
        if count > SLOTS_PER_BUCKET || data.len() < count * SLOT_SIZE {
            return Err(KeyhiveError::Corrupted(format!(
                "index bucket holds {} slots",
                count
            )));
        }

        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(Slot {
                hash: data.get_u32_le(),
                segment_id: data.get_u16_le(),
                key_size: data.get_u16_le(),
                offset: data.get_u32_le(),
            });
        }
        Ok(Self { slots, next })
    }
}
