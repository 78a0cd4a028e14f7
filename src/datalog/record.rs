//! Segment records
//!
//! ```text
//! +---------------+------------------+------------------+
//! | Key Size (2B) | Key              |         CRC (4B) |
//! +---------------+------------------+------------------+
//! ```
//!
//! Sizes and the checksum are little-endian; the CRC32 (IEEE) covers the key
//! size and the key bytes.

use std::io::Read;

use bytes::BufMut;

use crate::error::{KeyhiveError, Result};
use crate::file::read_full;
use crate::MAX_KEY_LENGTH;

/// Bytes read before the key size is known: the smallest possible record
pub const RECORD_PREFIX_SIZE: usize = 6;

/// On-disk size of a record holding a key of `key_size` bytes
pub fn encoded_record_size(key_size: u32) -> u32 {
    // key size, key, crc32
    2 + key_size + 4
}

/// Encode a key as a segment record
pub fn encode_record(key: &[u8]) -> Result<Vec<u8>> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(KeyhiveError::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_LENGTH,
        });
    }
    let mut data = Vec::with_capacity(encoded_record_size(key.len() as u32) as usize);
    data.put_u16_le(key.len() as u16);
    data.put_slice(key);
    let checksum = crc32fast::hash(&data);
    data.put_u32_le(checksum);
    Ok(data)
}

/// A decoded record and its location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Physical id of the segment holding the record
    pub segment_id: u16,
    /// Offset from the end of the segment header
    pub offset: u32,
    /// The full encoded record
    pub data: Vec<u8>,
}

impl Record {
    pub fn key(&self) -> &[u8] {
        &self.data[2..self.data.len() - 4]
    }

    pub fn into_key(mut self) -> Vec<u8> {
        self.data.truncate(self.data.len() - 4);
        self.data.drain(..2);
        self.data
    }

    pub fn key_size(&self) -> u16 {
        (self.data.len() - RECORD_PREFIX_SIZE) as u16
    }

    pub fn encoded_size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Decode one record from `reader`.
///
/// Returns `Ok(None)` when the reader is exhausted before the first byte,
/// `Truncated` when it ends inside the record and `Corrupted` when a
/// complete record fails its checksum.
pub fn decode_record<R: Read>(reader: &mut R, segment_id: u16, offset: u32) -> Result<Option<Record>> {
    let mut prefix = [0u8; RECORD_PREFIX_SIZE];
    let n = read_full(reader, &mut prefix)?;
    if n == 0 {
        return Ok(None);
    }
    if n < RECORD_PREFIX_SIZE {
        return Err(KeyhiveError::Truncated { segment: segment_id, offset });
    }

    let key_size = u16::from_le_bytes([prefix[0], prefix[1]]) as usize;
    let mut data = vec![0u8; RECORD_PREFIX_SIZE + key_size];
    data[..RECORD_PREFIX_SIZE].copy_from_slice(&prefix);
    if read_full(reader, &mut data[RECORD_PREFIX_SIZE..])? < key_size {
        return Err(KeyhiveError::Truncated { segment: segment_id, offset });
    }

    verify_checksum(&data, segment_id, offset)?;
    Ok(Some(Record { segment_id, offset, data }))
}

pub(crate) fn verify_checksum(data: &[u8], segment_id: u16, offset: u32) -> Result<()> {
    let split = data.len() - 4;
    let stored = u32::from_le_bytes([data[split], data[split + 1], data[split + 2], data[split + 3]]);
    if stored != crc32fast::hash(&data[..split]) {
        return Err(KeyhiveError::Corrupted(format!(
            "checksum mismatch in segment {} at offset {}",
            segment_id, offset
        )));
    }
    Ok(())
}
