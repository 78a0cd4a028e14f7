//! Tests for the Datalog
//!
//! These tests verify:
//! - Record encoding limits and checksum validation
//! - Segment rotation and sequence ordering
//! - Segment scans stopping at a torn tail
//! - Metadata surviving a close/open cycle

use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::path::Path;

use keyhive::datalog::{decode_record, encode_record, segment_name, Datalog};
use keyhive::index::Slot;
use keyhive::{KeyhiveError, MAX_KEY_LENGTH};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn key(i: usize) -> Vec<u8> {
    format!("key-{:02}", i).into_bytes()
}

fn append_raw(dir: &Path, id: u16, sequence_id: u64, data: &[u8]) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.join(segment_name(id, sequence_id)))
        .unwrap();
    file.write_all(data).unwrap();
}

fn slot_for(key: &[u8], segment_id: u16, offset: u32) -> Slot {
    Slot {
        hash: 0,
        segment_id,
        key_size: key.len() as u16,
        offset,
    }
}

// =============================================================================
// Record Tests
// =============================================================================

#[test]
fn test_record_boundary_key_sizes() {
    for len in [0usize, 1, MAX_KEY_LENGTH] {
        let key = vec![0x5A; len];
        let data = encode_record(&key).unwrap();
        assert_eq!(data.len(), len + 6);

        let record = decode_record(&mut Cursor::new(&data), 3, 42).unwrap().unwrap();
        assert_eq!(record.key(), key.as_slice());
        assert_eq!(record.segment_id, 3);
        assert_eq!(record.offset, 42);
    }
}

#[test]
fn test_record_rejects_oversized_key() {
    let key = vec![0u8; MAX_KEY_LENGTH + 1];
    assert!(matches!(
        encode_record(&key),
        Err(KeyhiveError::KeyTooLarge { size, max }) if size == MAX_KEY_LENGTH + 1 && max == MAX_KEY_LENGTH
    ));
}

#[test]
fn test_record_detects_any_flipped_bit() {
    let data = encode_record(b"checksummed").unwrap();
    for byte in 0..data.len() {
        for bit in 0..8 {
            let mut damaged = data.clone();
            damaged[byte] ^= 1 << bit;
            let result = decode_record(&mut Cursor::new(&damaged), 0, 0);
            match result {
                Err(e) => assert!(e.is_corruption(), "byte {} bit {}: {}", byte, bit, e),
                Ok(record) => panic!("byte {} bit {} decoded as {:?}", byte, bit, record),
            }
        }
    }
}

#[test]
fn test_record_sequence_ends_cleanly() {
    let mut data = encode_record(b"first").unwrap();
    data.extend(encode_record(b"second").unwrap());
    let mut reader = Cursor::new(data);

    let first = decode_record(&mut reader, 0, 0).unwrap().unwrap();
    let second = decode_record(&mut reader, 0, first.encoded_size()).unwrap().unwrap();
    assert_eq!(second.key(), b"second");
    assert!(decode_record(&mut reader, 0, 0).unwrap().is_none());
}

// =============================================================================
// Datalog Tests
// =============================================================================

#[test]
fn test_put_and_read_key() {
    let temp = TempDir::new().unwrap();
    let mut datalog = Datalog::open(temp.path(), u32::MAX).unwrap();

    let (seg_a, off_a) = datalog.put(b"alpha").unwrap();
    let (seg_b, off_b) = datalog.put(b"").unwrap();
    assert_eq!((seg_a, off_a), (0, 0));
    assert_eq!((seg_b, off_b), (0, 11));

    assert_eq!(datalog.read_key(&slot_for(b"alpha", seg_a, off_a)).unwrap(), b"alpha");
    assert_eq!(datalog.read_key(&slot_for(b"", seg_b, off_b)).unwrap(), b"");
}

#[test]
fn test_read_key_with_wrong_size_is_corruption() {
    let temp = TempDir::new().unwrap();
    let mut datalog = Datalog::open(temp.path(), u32::MAX).unwrap();
    datalog.put(b"alpha").unwrap();
    datalog.put(b"beta").unwrap();

    let wrong = Slot { hash: 0, segment_id: 0, key_size: 4, offset: 0 };
    assert!(datalog.read_key(&wrong).unwrap_err().is_corruption());

    let missing_segment = Slot { hash: 0, segment_id: 9, key_size: 5, offset: 0 };
    assert!(datalog.read_key(&missing_segment).is_err());
}

#[test]
fn test_read_key_detects_flipped_bit_on_disk() {
    let temp = TempDir::new().unwrap();
    {
        let mut datalog = Datalog::open(temp.path(), u32::MAX).unwrap();
        datalog.put(b"abc").unwrap();
        datalog.close().unwrap();
    }
    let path = temp.path().join(segment_name(0, 1));
    let original = fs::read(&path).unwrap();

    // Size field, key and checksum of the 9-byte record after the header
    for pos in 0..9 {
        for bit in [0x01u8, 0x80] {
            let mut damaged = original.clone();
            damaged[512 + pos] ^= bit;
            fs::write(&path, &damaged).unwrap();

            let datalog = Datalog::open(temp.path(), u32::MAX).unwrap();
            let err = datalog.read_key(&slot_for(b"abc", 0, 0)).unwrap_err();
            assert!(err.is_corruption(), "byte {} bit {:#x}: {}", pos, bit, err);
        }
    }

    fs::write(&path, &original).unwrap();
    let datalog = Datalog::open(temp.path(), u32::MAX).unwrap();
    assert_eq!(datalog.read_key(&slot_for(b"abc", 0, 0)).unwrap(), b"abc");
}

#[test]
fn test_rotation_on_segment_size() {
    let temp = TempDir::new().unwrap();
    // Each record is 12 bytes; two do not fit in 20
    let mut datalog = Datalog::open(temp.path(), 20).unwrap();

    let locations: Vec<(u16, u32)> = (0..3).map(|i| datalog.put(&key(i)).unwrap()).collect();
    assert_eq!(locations, vec![(0, 0), (1, 0), (2, 0)]);

    let order: Vec<(u16, u64, bool)> = datalog
        .segments_by_sequence_id()
        .iter()
        .map(|s| (s.id(), s.sequence_id(), s.meta().full))
        .collect();
    assert_eq!(order, vec![(0, 1, true), (1, 2, true), (2, 3, false)]);
    assert_eq!(datalog.current_segment_id(), 2);
}

#[test]
fn test_oversized_record_goes_to_empty_segment() {
    let temp = TempDir::new().unwrap();
    let mut datalog = Datalog::open(temp.path(), 8).unwrap();

    // Larger than the rotation threshold but the segment is empty
    assert_eq!(datalog.put(&key(0)).unwrap(), (0, 0));
    assert_eq!(datalog.put(&key(1)).unwrap(), (1, 0));
}

#[test]
fn test_segment_iterator_yields_in_order() {
    let temp = TempDir::new().unwrap();
    let mut datalog = Datalog::open(temp.path(), u32::MAX).unwrap();
    for i in 0..10 {
        datalog.put(&key(i)).unwrap();
    }

    let keys: Vec<Vec<u8>> = datalog
        .iter_segment(0)
        .unwrap()
        .map(|r| r.unwrap().key().to_vec())
        .collect();
    assert_eq!(keys, (0..10).map(key).collect::<Vec<_>>());
}

#[test]
fn test_segment_iterator_stops_at_torn_tail() {
    let temp = TempDir::new().unwrap();
    let mut datalog = Datalog::open(temp.path(), u32::MAX).unwrap();
    datalog.put(b"a").unwrap();
    datalog.put(b"b").unwrap();
    datalog.close().unwrap();

    // Record claiming 5 key bytes but holding one
    append_raw(temp.path(), 0, 1, &[5, 0, b'x']);

    let datalog = Datalog::open(temp.path(), u32::MAX).unwrap();
    let mut it = datalog.iter_segment(0).unwrap();
    assert_eq!(it.next().unwrap().unwrap().key(), b"a");
    assert_eq!(it.next().unwrap().unwrap().key(), b"b");
    assert!(matches!(
        it.next(),
        Some(Err(KeyhiveError::Truncated { segment: 0, offset: 14 }))
    ));
    assert!(it.next().is_none());
    assert!(it.next().is_none());
    assert_eq!(it.offset(), 14);
}

#[test]
fn test_segment_iterator_reports_bad_checksum() {
    let temp = TempDir::new().unwrap();
    let mut datalog = Datalog::open(temp.path(), u32::MAX).unwrap();
    datalog.put(b"good").unwrap();
    datalog.close().unwrap();

    let mut bad = encode_record(b"bad").unwrap();
    bad[2] ^= 0xFF;
    append_raw(temp.path(), 0, 1, &bad);

    let datalog = Datalog::open(temp.path(), u32::MAX).unwrap();
    let results: Vec<_> = datalog.iter_segment(0).unwrap().collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(KeyhiveError::Corrupted(_))));
}

#[test]
fn test_reopen_keeps_segments_and_metadata() {
    let temp = TempDir::new().unwrap();
    {
        let mut datalog = Datalog::open(temp.path(), 20).unwrap();
        for i in 0..3 {
            datalog.put(&key(i)).unwrap();
        }
        datalog.close().unwrap();
    }

    let mut datalog = Datalog::open(temp.path(), 20).unwrap();
    let segments = datalog.segments_by_sequence_id();
    assert_eq!(segments.len(), 3);
    assert!(segments.iter().all(|s| s.meta().put_records == 1));
    assert_eq!(datalog.current_segment_id(), 2);

    // The writable segment still has no room, so the next put rotates
    assert_eq!(datalog.put(&key(3)).unwrap(), (3, 0));
    assert_eq!(datalog.segments_by_sequence_id().last().unwrap().sequence_id(), 4);
}
