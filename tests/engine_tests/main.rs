//! Tests for Engine
//!
//! These tests verify:
//! - Basic put/has/has_or_put operations
//! - Key enumeration
//! - Crash recovery from the datalog
//! - Compaction
//! - Concurrent access patterns
//! - Engine lifecycle (open/close/lock)

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use keyhive::{Engine, KeyhiveError, Options, SyncStrategy, MAX_KEY_LENGTH};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(temp_dir.path(), Options::default()).unwrap();
    (temp_dir, engine)
}

/// Five 12-byte records per segment, everything eligible for compaction
fn small_segment_options() -> Options {
    Options::builder()
        .max_segment_size(64)
        .compaction_min_segment_size(0)
        .compaction_min_fragmentation(0.5)
        .build()
}

fn key(i: usize) -> Vec<u8> {
    format!("key-{:02}", i).into_bytes()
}

fn collect_keys(engine: &Engine) -> HashSet<Vec<u8>> {
    engine.items().map(|k| k.unwrap()).collect()
}

fn append_to_file(path: &Path, data: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(data).unwrap();
}

fn constant_hash(_key: &[u8], _seed: u32) -> u32 {
    7
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_engine_open_creates_directory() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("mydb");

    let engine = Engine::open(&data_dir, Options::default()).unwrap();

    assert!(data_dir.exists());
    assert!(data_dir.join("lock").exists());
    assert!(data_dir.join("00000-1.psg").exists());
    assert!(engine.file_size().unwrap() > 0);
    engine.close().unwrap();
    assert!(!data_dir.join("lock").exists());
}

#[test]
fn test_engine_put_has() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"hello").unwrap();

    assert!(engine.has(b"hello").unwrap());
    assert!(!engine.has(b"world").unwrap());
    assert_eq!(engine.count(), 1);
}

#[test]
fn test_engine_put_is_idempotent() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"a").unwrap();
    engine.put(b"a").unwrap();
    engine.put(b"a").unwrap();

    assert_eq!(engine.count(), 1);
    assert_eq!(engine.items().count(), 1);
    assert_eq!(engine.metrics().puts(), 3);
}

#[test]
fn test_engine_has_or_put() {
    let (_temp, engine) = setup_temp_engine();

    assert!(!engine.has_or_put(b"a").unwrap());
    assert!(engine.has_or_put(b"a").unwrap());
    assert!(engine.has(b"a").unwrap());
    assert_eq!(engine.count(), 1);
    // The second call wrote nothing
    assert_eq!(engine.metrics().puts(), 1);
}

#[test]
fn test_engine_empty_and_max_length_keys() {
    let (_temp, engine) = setup_temp_engine();
    let longest = vec![0xEE; MAX_KEY_LENGTH];

    engine.put(b"").unwrap();
    engine.put(&longest).unwrap();

    assert!(engine.has(b"").unwrap());
    assert!(engine.has(&longest).unwrap());
    assert_eq!(engine.count(), 2);
}

#[test]
fn test_engine_rejects_key_too_large() {
    let (_temp, engine) = setup_temp_engine();
    let too_long = vec![0u8; MAX_KEY_LENGTH + 1];

    assert!(matches!(engine.put(&too_long), Err(KeyhiveError::KeyTooLarge { .. })));
    assert!(matches!(engine.has_or_put(&too_long), Err(KeyhiveError::KeyTooLarge { .. })));
    assert_eq!(engine.count(), 0);
}

#[test]
fn test_engine_hash_collisions() {
    let temp = TempDir::new().unwrap();
    let options = Options::builder().hasher(constant_hash).build();
    let engine = Engine::open(temp.path(), options.clone()).unwrap();

    for i in 0..100 {
        engine.put(&key(i)).unwrap();
    }
    engine.put(&key(50)).unwrap();

    assert_eq!(engine.count(), 100);
    for i in 0..100 {
        assert!(engine.has(&key(i)).unwrap());
    }
    assert!(!engine.has(b"missing").unwrap());
    assert!(engine.metrics().hash_collisions() > 0);
    assert_eq!(collect_keys(&engine).len(), 100);

    engine.close().unwrap();
    let engine = Engine::open(temp.path(), options).unwrap();
    assert_eq!(engine.count(), 100);
    assert!(engine.has(&key(99)).unwrap());
}

#[test]
fn test_engine_sync_every_write() {
    let temp = TempDir::new().unwrap();
    let options = Options::builder().sync_strategy(SyncStrategy::EveryWrite).build();
    let engine = Engine::open(temp.path(), options).unwrap();

    engine.put(b"durable").unwrap();
    engine.sync().unwrap();
    assert!(engine.has(b"durable").unwrap());
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_items_on_empty_store() {
    let (_temp, engine) = setup_temp_engine();

    let mut items = engine.items();
    assert!(items.next().is_none());
    assert!(items.next().is_none());
}

#[test]
fn test_items_yields_each_key_once() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(temp.path(), small_segment_options()).unwrap();

    for i in 0..30 {
        engine.put(&key(i)).unwrap();
    }
    // Overwrites leave stale records behind in older segments
    for i in (0..30).step_by(3) {
        engine.put(&key(i)).unwrap();
    }

    let keys: Vec<Vec<u8>> = engine.items().map(|k| k.unwrap()).collect();
    let unique: HashSet<Vec<u8>> = keys.iter().cloned().collect();
    assert_eq!(keys.len(), 30);
    assert_eq!(unique, (0..30).map(key).collect::<HashSet<_>>());
}

#[test]
fn test_items_is_fused() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"only").unwrap();

    let mut items = engine.items();
    assert_eq!(items.next().unwrap().unwrap(), b"only");
    assert!(items.next().is_none());
    assert!(items.next().is_none());
}

#[test]
fn test_items_sees_key_refreshed_mid_iteration() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"a").unwrap();
    engine.put(b"a").unwrap();
    engine.put(b"b").unwrap();

    let items = engine.items();
    // Moves "a" past the end of the iteration snapshot
    engine.put(b"a").unwrap();
    engine.put(b"c").unwrap();

    let mut keys: Vec<Vec<u8>> = items.map(|k| k.unwrap()).collect();
    keys.sort();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn test_items_sees_keys_compacted_mid_iteration() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(temp.path(), small_segment_options()).unwrap();
    for i in 0..10 {
        engine.put(&key(i)).unwrap();
    }
    for i in 0..3 {
        engine.put(&key(i)).unwrap();
    }

    let mut items = engine.items();
    let first = items.next().unwrap().unwrap();
    // Relocates key-03 and key-04 and deletes the first segment
    assert_eq!(engine.compact().unwrap().compacted_segments, 1);

    let mut keys = vec![first];
    keys.extend(items.map(|k| k.unwrap()));
    let unique: HashSet<Vec<u8>> = keys.iter().cloned().collect();
    assert_eq!(keys.len(), 10);
    assert_eq!(unique, (0..10).map(key).collect::<HashSet<_>>());
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_engine_reopen_persists_keys() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp.path(), Options::default()).unwrap();
        for i in 0..50 {
            engine.put(&key(i)).unwrap();
        }
        engine.close().unwrap();
    }

    let engine = Engine::open(temp.path(), Options::default()).unwrap();
    assert!(engine.recovery_report().is_none());
    assert_eq!(engine.count(), 50);
    for i in 0..50 {
        assert!(engine.has(&key(i)).unwrap());
    }
}

#[test]
fn test_engine_is_locked_while_open() {
    let (temp, engine) = setup_temp_engine();

    assert!(matches!(
        Engine::open(temp.path(), Options::default()),
        Err(KeyhiveError::Locked)
    ));

    // The failed open must not disturb the owner
    engine.put(b"still mine").unwrap();
    engine.close().unwrap();
    let engine = Engine::open(temp.path(), Options::default()).unwrap();
    assert!(engine.has(b"still mine").unwrap());
}

#[test]
fn test_engine_rejects_invalid_options() {
    let temp = TempDir::new().unwrap();

    let zero_segment = Options::builder().max_segment_size(0).build();
    assert!(matches!(Engine::open(temp.path(), zero_segment), Err(KeyhiveError::Config(_))));

    let bad_ratio = Options::builder().compaction_min_fragmentation(1.5).build();
    assert!(matches!(Engine::open(temp.path(), bad_ratio), Err(KeyhiveError::Config(_))));
}

#[test]
fn test_engine_zero_intervals_disable_background_work() {
    let temp = TempDir::new().unwrap();
    let options = Options::builder()
        .sync_strategy(SyncStrategy::Interval(Duration::ZERO))
        .compaction_interval(Duration::ZERO)
        .build();

    let engine = Engine::open(temp.path(), options).unwrap();
    engine.put(b"a").unwrap();
    assert!(engine.has(b"a").unwrap());
    engine.close().unwrap();
}

#[test]
fn test_engine_missing_metadata_is_corruption() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp.path(), Options::default()).unwrap();
        engine.put(b"a").unwrap();
        engine.close().unwrap();
    }
    fs::remove_file(temp.path().join("db.pmt")).unwrap();

    assert!(matches!(
        Engine::open(temp.path(), Options::default()),
        Err(KeyhiveError::Corrupted(_))
    ));

    // The failed open left the lock file, so the next one rebuilds
    let engine = Engine::open(temp.path(), Options::default()).unwrap();
    assert!(engine.recovery_report().is_some());
    assert!(engine.has(b"a").unwrap());
}

// =============================================================================
// Crash Recovery Tests
// =============================================================================

#[test]
fn test_engine_recovers_after_crash() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp.path(), Options::default()).unwrap();
        engine.put(b"a").unwrap();
        engine.put(b"b").unwrap();
        engine.put(b"c").unwrap();
        engine.sync().unwrap();
        // Dropped without close: the lock file stays behind
    }
    assert!(temp.path().join("lock").exists());

    // A torn write at the tail of the active segment
    append_to_file(&temp.path().join("00000-1.psg"), &[5, 0, b'x']);

    let engine = Engine::open(temp.path(), Options::default()).unwrap();
    let report = engine.recovery_report().unwrap().clone();
    assert_eq!(report.segments_scanned, 1);
    assert_eq!(report.records_replayed, 3);
    assert_eq!(report.segments_truncated, 1);
    assert_eq!(report.bytes_dropped, 3);

    assert_eq!(engine.count(), 3);
    for k in [b"a", b"b", b"c"] {
        assert!(engine.has(k).unwrap());
    }
    // 512-byte header plus three 7-byte records
    assert_eq!(fs::metadata(temp.path().join("00000-1.psg")).unwrap().len(), 512 + 21);
    let leftover_backups = fs::read_dir(temp.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".bac"))
        .count();
    assert_eq!(leftover_backups, 0);

    engine.put(b"d").unwrap();
    engine.close().unwrap();

    let engine = Engine::open(temp.path(), Options::default()).unwrap();
    assert!(engine.recovery_report().is_none());
    assert_eq!(engine.count(), 4);
    assert_eq!(collect_keys(&engine).len(), 4);
}

#[test]
fn test_engine_recovery_counts_overwrites_once() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp.path(), small_segment_options()).unwrap();
        for i in 0..12 {
            engine.put(&key(i)).unwrap();
        }
        for i in 0..12 {
            engine.put(&key(i)).unwrap();
        }
    }

    let engine = Engine::open(temp.path(), small_segment_options()).unwrap();
    let report = engine.recovery_report().unwrap();
    assert_eq!(report.records_replayed, 24);
    assert_eq!(report.segments_truncated, 0);
    assert_eq!(engine.count(), 12);
    assert_eq!(engine.items().count(), 12);
}

#[test]
fn test_engine_checksum_failure_aborts_recovery() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp.path(), Options::default()).unwrap();
        engine.put(b"aaaa").unwrap();
        engine.put(b"bbbb").unwrap();
    }

    // Flip a key byte of the first record
    let segment = temp.path().join("00000-1.psg");
    let mut data = fs::read(&segment).unwrap();
    data[512 + 2] ^= 0xFF;
    fs::write(&segment, data).unwrap();

    match Engine::open(temp.path(), Options::default()) {
        Err(e) => assert!(e.is_corruption(), "unexpected error: {}", e),
        Ok(_) => panic!("opened a store with a corrupted record"),
    }
}

#[test]
fn test_engine_bit_flip_detected_on_lookup() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp.path(), Options::default()).unwrap();
        engine.put(b"aaaa").unwrap();
        engine.put(b"bbbb").unwrap();
        engine.close().unwrap();
    }

    let segment = temp.path().join("00000-1.psg");
    let mut data = fs::read(&segment).unwrap();
    data[512 + 3] ^= 0x01;
    fs::write(&segment, data).unwrap();

    // Clean shutdown, so no recovery runs and the damage is only seen on read
    let engine = Engine::open(temp.path(), Options::default()).unwrap();
    assert!(engine.recovery_report().is_none());
    match engine.has(b"aaaa") {
        Err(e) => assert!(e.is_corruption(), "unexpected error: {}", e),
        Ok(found) => panic!("lookup over a damaged record returned {}", found),
    }
    assert!(engine.has(b"bbbb").unwrap());
    assert!(engine.items().any(|k| k.is_err()));
}

#[test]
fn test_engine_failed_recoveries_keep_first_backup() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp.path(), Options::default()).unwrap();
        for i in 0..200 {
            engine.put(&key(i)).unwrap();
        }
        engine.close().unwrap();
    }
    {
        let engine = Engine::open(temp.path(), Options::default()).unwrap();
        engine.put(b"extra").unwrap();
        // Dropped without close
    }
    let last_good_index = fs::read(temp.path().join("main.pix")).unwrap();

    let segment = temp.path().join("00000-1.psg");
    let mut data = fs::read(&segment).unwrap();
    data[512 + 2] ^= 0xFF;
    fs::write(&segment, data).unwrap();

    for attempt in 0..2 {
        assert!(
            Engine::open(temp.path(), Options::default()).is_err(),
            "attempt {} opened a corrupted store",
            attempt
        );
        assert_eq!(
            fs::read(temp.path().join("main.pix.bac")).unwrap(),
            last_good_index,
            "backup replaced on attempt {}",
            attempt
        );
        assert!(temp.path().join("lock").exists());
    }
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_compaction_drops_superseded_segments() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(temp.path(), small_segment_options()).unwrap();

    for i in 0..20 {
        engine.put(&key(i)).unwrap();
    }
    for i in 0..20 {
        engine.put(&key(i)).unwrap();
    }
    let size_before = engine.file_size().unwrap();

    let result = engine.compact().unwrap();
    assert_eq!(result.compacted_segments, 4);
    assert_eq!(result.reclaimed_records, 20);
    assert_eq!(result.reclaimed_bytes, 240);
    assert_eq!(engine.metrics().compactions(), 1);

    assert!(engine.file_size().unwrap() < size_before);
    assert_eq!(engine.count(), 20);
    assert_eq!(collect_keys(&engine), (0..20).map(key).collect::<HashSet<_>>());

    // Nothing left to do
    assert_eq!(engine.compact().unwrap().compacted_segments, 0);
}

#[test]
fn test_compaction_moves_live_records() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp.path(), small_segment_options()).unwrap();
        for i in 0..10 {
            engine.put(&key(i)).unwrap();
        }
        for i in 0..3 {
            engine.put(&key(i)).unwrap();
        }

        let result = engine.compact().unwrap();
        assert_eq!(result.compacted_segments, 1);
        assert_eq!(result.reclaimed_records, 3);
        assert_eq!(result.reclaimed_bytes, 36);

        assert_eq!(engine.count(), 10);
        for i in 0..10 {
            assert!(engine.has(&key(i)).unwrap());
        }
        assert!(!temp.path().join("00000-1.psg").exists());
        // Dropped without close to rebuild from the compacted segments
    }

    let engine = Engine::open(temp.path(), small_segment_options()).unwrap();
    assert!(engine.recovery_report().is_some());
    assert_eq!(engine.count(), 10);
    assert_eq!(collect_keys(&engine), (0..10).map(key).collect::<HashSet<_>>());
}

#[test]
fn test_compaction_relocation_across_rotation_survives_crash() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp.path(), small_segment_options()).unwrap();
        for i in 0..16 {
            engine.put(&key(i)).unwrap();
        }
        // The writable segment now holds key-15 and key-00..02
        for i in 0..3 {
            engine.put(&key(i)).unwrap();
        }

        // key-03 fills the writable segment and key-04 rotates to a new one
        let result = engine.compact().unwrap();
        assert_eq!(result.compacted_segments, 1);
        assert_eq!(result.reclaimed_records, 3);
        // Dropped without close
    }

    let engine = Engine::open(temp.path(), small_segment_options()).unwrap();
    assert_eq!(engine.recovery_report().unwrap().segments_truncated, 0);
    assert_eq!(engine.count(), 16);
    assert_eq!(collect_keys(&engine), (0..16).map(key).collect::<HashSet<_>>());
}

#[test]
fn test_compaction_skips_unfragmented_segments() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::open(temp.path(), small_segment_options()).unwrap();
    for i in 0..20 {
        engine.put(&key(i)).unwrap();
    }

    assert_eq!(engine.compact().unwrap().compacted_segments, 0);
    assert_eq!(engine.metrics().compactions(), 0);
}

#[test]
fn test_background_compaction() {
    let temp = TempDir::new().unwrap();
    let options = Options::builder()
        .max_segment_size(64)
        .compaction_min_segment_size(0)
        .compaction_interval(Duration::from_millis(10))
        .sync_strategy(SyncStrategy::Interval(Duration::from_millis(10)))
        .build();
    let engine = Engine::open(temp.path(), options).unwrap();

    for i in 0..20 {
        engine.put(&key(i)).unwrap();
    }
    for i in 0..20 {
        engine.put(&key(i)).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.metrics().compactions() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(engine.metrics().compactions() > 0);

    for i in 0..20 {
        assert!(engine.has(&key(i)).unwrap());
    }
    assert_eq!(engine.count(), 20);
    engine.close().unwrap();
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_has_or_put_inserts_once() {
    let (_temp, engine) = setup_temp_engine();
    let threads = 8;
    let keys = 200;

    let inserted: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let engine = &engine;
                s.spawn(move || {
                    (0..keys)
                        .filter(|&i| !engine.has_or_put(&key(i)).unwrap())
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(inserted, keys);
    assert_eq!(engine.count() as usize, keys);
}

#[test]
fn test_concurrent_readers_and_writer() {
    let (_temp, engine) = setup_temp_engine();
    for i in 0..50 {
        engine.put(&key(i)).unwrap();
    }

    thread::scope(|s| {
        s.spawn(|| {
            for i in 50..100 {
                engine.put(&key(i)).unwrap();
            }
        });
        for _ in 0..4 {
            s.spawn(|| {
                for i in 0..50 {
                    assert!(engine.has(&key(i)).unwrap());
                }
                let seen = engine.items().map(|k| k.unwrap()).count();
                assert!(seen >= 50);
            });
        }
    });

    assert_eq!(engine.count(), 100);
}
