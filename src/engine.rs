//! Engine Module
//!
//! The storage engine that coordinates all components.
//!
//! ## Responsibilities
//! - Open/close lifecycle and the advisory lock
//! - Hash seed management
//! - Coordinate Datalog and Index on every read and write
//! - Run crash recovery on startup after an unclean shutdown
//! - Schedule background sync and compaction

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::compaction::{self, CompactionResult};
use crate::config::Options;
use crate::datalog::Datalog;
use crate::error::{KeyhiveError, Result};
use crate::hash;
use crate::index::{Index, Slot};
use crate::iterator::ItemIterator;
use crate::lock::LockFile;
use crate::meta::{read_meta_file, write_meta_file, DbMeta, DB_META_NAME};
use crate::metrics::Metrics;
use crate::recovery::{self, RecoveryReport};
use crate::MAX_KEY_LENGTH;

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Reads** (has/items/count): share the engine lock
/// - **Writes** (put/has_or_put/sync/close): take it exclusively, so
///   `has_or_put` checks and inserts without anyone observing in between
/// - **Compaction**: single-flight; holds the exclusive lock only while
///   moving one record at a time
///
/// Dropping an engine without calling [`Engine::close`] stops background
/// work but leaves the store marked as not cleanly shut down; the next open
/// runs recovery.
pub struct Engine {
    shared: Arc<Shared>,
    worker: Option<BackgroundWorker>,
    recovery: Option<RecoveryReport>,
}

/// State shared with the background worker
pub(crate) struct Shared {
    pub(crate) path: PathBuf,
    pub(crate) options: Options,
    pub(crate) state: RwLock<State>,
    pub(crate) metrics: Metrics,
    pub(crate) compaction_running: AtomicBool,
    hash_seed: u32,
}

/// Everything the engine lock protects
pub(crate) struct State {
    pub(crate) index: Index,
    pub(crate) datalog: Datalog,
    lock: Option<LockFile>,
}

impl Engine {
    /// Open or create a store at `path`
    ///
    /// On startup:
    /// 1. Create the directory and take the advisory lock
    /// 2. Back up index and metadata if the last session crashed
    /// 3. Open index and datalog, load or generate the hash seed
    /// 4. Rebuild the index from the datalog if the last session crashed
    /// 5. Start background maintenance if configured
    ///
    /// A failed open unlocks but keeps the lock file, so the next open runs
    /// recovery.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let (lock, stale_lock) = LockFile::acquire(&path)?;
        if stale_lock {
            info!(path = %path.display(), "store was not closed cleanly, starting recovery");
            recovery::backup_non_segment_files(&path)?;
        }

        let index = Index::open(&path)?;
        let datalog = Datalog::open(&path, options.max_segment_size)?;

        let hash_seed = if index.count() == 0 {
            hash::rand_seed()
        } else {
            read_meta_file::<DbMeta>(&path.join(DB_META_NAME))?
                .ok_or_else(|| KeyhiveError::Corrupted("missing engine metadata".to_string()))?
                .hash_seed
        };

        let shared = Shared {
            path,
            options,
            state: RwLock::new(State { index, datalog, lock: None }),
            metrics: Metrics::default(),
            compaction_running: AtomicBool::new(false),
            hash_seed,
        };

        let recovery = if stale_lock {
            Some(recovery::recover(&shared)?)
        } else {
            None
        };
        shared.write_db_meta()?;

        shared.state.write().lock = Some(lock);
        let shared = Arc::new(shared);

        let sync_interval = shared.options.background_sync_interval();
        let compaction_interval = shared.options.compaction_interval;
        let worker = if !sync_interval.is_zero() || !compaction_interval.is_zero() {
            Some(BackgroundWorker::spawn(Arc::clone(&shared), sync_interval, compaction_interval)?)
        } else {
            None
        };

        info!(
            path = %shared.path.display(),
            keys = shared.state.read().index.count(),
            "engine opened"
        );

        Ok(Self {
            shared,
            worker,
            recovery,
        })
    }

    /// Check whether the store contains `key`
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.shared.metrics.record_get();
        let hash = self.shared.hash(key);
        let state = self.shared.state.read();
        state
            .index
            .get(hash, |slot| key_matches(&state.datalog, key, slot, &self.shared.metrics))
    }

    /// Insert `key`, refreshing its location if it already exists
    pub fn put(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        self.shared.metrics.record_put();
        let hash = self.shared.hash(key);

        let mut state = self.shared.state.write();
        let State { index, datalog, .. } = &mut *state;
        let (segment_id, offset) = datalog.put(key)?;
        let slot = Slot {
            hash,
            segment_id,
            key_size: key.len() as u16,
            offset,
        };
        insert_slot(index, datalog, key, slot, &self.shared.metrics)?;

        if self.shared.options.sync_writes() {
            datalog.sync()?;
        }
        Ok(())
    }

    /// Insert `key` unless it exists, atomically.
    ///
    /// Returns true if the key already existed, in which case nothing was
    /// written.
    pub fn has_or_put(&self, key: &[u8]) -> Result<bool> {
        check_key(key)?;
        let hash = self.shared.hash(key);

        let mut state = self.shared.state.write();
        let State { index, datalog, .. } = &mut *state;
        let found = index.get(hash, |slot| key_matches(datalog, key, slot, &self.shared.metrics))?;
        if found {
            return Ok(true);
        }

        self.shared.metrics.record_put();
        let (segment_id, offset) = datalog.put(key)?;
        let slot = Slot {
            hash,
            segment_id,
            key_size: key.len() as u16,
            offset,
        };
        insert_slot(index, datalog, key, slot, &self.shared.metrics)?;

        if self.shared.options.sync_writes() {
            datalog.sync()?;
        }
        Ok(false)
    }

    /// Iterate over all keys
    pub fn items(&self) -> ItemIterator<'_> {
        ItemIterator::new(&self.shared)
    }

    /// Flush buffered writes to disk
    pub fn sync(&self) -> Result<()> {
        self.shared.sync()
    }

    /// Reclaim space held by superseded records
    pub fn compact(&self) -> Result<CompactionResult> {
        compaction::compact(&self.shared)
    }

    /// Number of keys in the store
    pub fn count(&self) -> u32 {
        self.shared.state.read().index.count()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Total size of all files in the store directory
    pub fn file_size(&self) -> Result<u64> {
        let mut size = 0;
        for entry in fs::read_dir(&self.shared.path)? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                size += metadata.len();
            }
        }
        Ok(size)
    }

    /// Report of the recovery run at open, if there was one
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Close the engine gracefully
    ///
    /// Stops background work, then persists engine metadata, closes the
    /// datalog and the index and releases the lock. Every step runs even if
    /// an earlier one fails; the first failure is returned.
    pub fn close(mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }

        let mut state = self.shared.state.write();
        let mut first_err = self.shared.write_db_meta().err();
        if let Err(e) = state.datalog.close() {
            first_err.get_or_insert(e);
        }
        if let Err(e) = state.index.close() {
            first_err.get_or_insert(e);
        }
        if let Some(lock) = state.lock.take() {
            if let Err(e) = lock.release() {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!(path = %self.shared.path.display(), "engine closed");
                Ok(())
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Shared {
    pub(crate) fn hash(&self, key: &[u8]) -> u32 {
        (self.options.hasher)(key, self.hash_seed)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.state.write().datalog.sync()
    }

    pub(crate) fn write_db_meta(&self) -> Result<()> {
        write_meta_file(
            &self.path.join(DB_META_NAME),
            &DbMeta { hash_seed: self.hash_seed },
        )
    }
}

/// Index `slot` for `key`, replacing the slot of an existing copy of the key.
///
/// The replaced record is accounted as superseded in its segment.
pub(crate) fn insert_slot(
    index: &mut Index,
    datalog: &mut Datalog,
    key: &[u8],
    slot: Slot,
    metrics: &Metrics,
) -> Result<bool> {
    index.put(slot, |current| {
        if key_matches(datalog, key, current, metrics)? {
            datalog.track_superseded(current);
            return Ok(true);
        }
        Ok(false)
    })
}

/// Whether `slot` (already known to share the key's hash) holds `key`
fn key_matches(datalog: &Datalog, key: &[u8], slot: &Slot, metrics: &Metrics) -> Result<bool> {
    if slot.key_size as usize != key.len() {
        metrics.record_hash_collision();
        return Ok(false);
    }
    if datalog.read_key(slot)? == key {
        return Ok(true);
    }
    metrics.record_hash_collision();
    Ok(false)
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(KeyhiveError::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_LENGTH,
        });
    }
    Ok(())
}

// =============================================================================
// Background Maintenance
// =============================================================================

/// Thread running periodic sync and compaction until cancelled
struct BackgroundWorker {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundWorker {
    fn spawn(shared: Arc<Shared>, sync_interval: Duration, compaction_interval: Duration) -> Result<Self> {
        let (cancel, cancelled) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("keyhive-maintenance".to_string())
            .spawn(move || run_maintenance(&shared, cancelled, sync_interval, compaction_interval))?;
        Ok(Self { cancel, handle })
    }

    /// Signal the loop and wait for it to exit
    fn stop(self) {
        drop(self.cancel);
        if self.handle.join().is_err() {
            error!("background worker panicked");
        }
    }
}

/// A ticker that never fires for a zero interval
fn ticker(interval: Duration) -> Receiver<std::time::Instant> {
    if interval.is_zero() {
        channel::never()
    } else {
        channel::tick(interval)
    }
}

fn run_maintenance(
    shared: &Shared,
    cancelled: Receiver<()>,
    sync_interval: Duration,
    compaction_interval: Duration,
) {
    let sync_tick = ticker(sync_interval);
    let compaction_tick = ticker(compaction_interval);
    debug!(?sync_interval, ?compaction_interval, "background worker started");

    loop {
        select! {
            recv(cancelled) -> _ => break,
            recv(sync_tick) -> _ => {
                if let Err(e) = shared.sync() {
                    error!("error synchronizing database: {}", e);
                }
            }
            recv(compaction_tick) -> _ => {
                match compaction::compact(shared) {
                    Ok(result) if result.compacted_segments > 0 => {
                        info!(?result, "compacted database");
                    }
                    Ok(_) => {}
                    Err(KeyhiveError::Busy) => debug!("compaction already running"),
                    Err(e) => error!("error compacting database: {}", e),
                }
            }
        }
    }
    debug!("background worker stopped");
}
