//! Crash Recovery
//!
//! Rebuilds the index from the datalog after an unclean shutdown.
//!
//! ## Recovery Process
//! 1. Rename every non-segment file to `{name}.bac` (before anything opens them)
//! 2. Open an empty index and the existing segments
//! 3. Replay segment records in sequence order, re-inserting every key
//! 4. Cut a segment off at the first truncated record
//! 5. Persist everything, then delete the backups
//!
//! A record that is complete but fails its checksum aborts recovery. Only a
//! torn tail is treated as an interrupted write.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::datalog::SEGMENT_EXT;
use crate::engine::{insert_slot, Shared, State};
use crate::error::{KeyhiveError, Result};
use crate::index::Slot;
use crate::lock::LOCK_NAME;

/// Backup file suffix
const BACKUP_EXT: &str = ".bac";

/// Outcome of a recovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Segments replayed
    pub segments_scanned: u32,
    /// Records re-inserted into the index
    pub records_replayed: u64,
    /// Segments cut back to their last complete record
    pub segments_truncated: u32,
    /// Bytes removed by those cuts
    pub bytes_dropped: u64,
}

/// Move index and metadata files out of the way before they are opened.
///
/// An existing backup is never replaced: it predates any failed recovery,
/// while the file it would be replaced with was written by one.
pub(crate) fn backup_non_segment_files(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name == LOCK_NAME || name.ends_with(SEGMENT_EXT) || name.ends_with(BACKUP_EXT) {
            continue;
        }
        let backup = dir.join(format!("{}{}", name, BACKUP_EXT));
        if backup.exists() {
            warn!(file = name, "keeping backup from an earlier recovery attempt");
            fs::remove_file(entry.path())?;
            continue;
        }
        fs::rename(entry.path(), &backup)?;
        info!(file = name, "backed up before recovery");
    }
    Ok(())
}

fn remove_backup_files(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_backup = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(BACKUP_EXT));
        if is_backup {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Rebuild the (empty) index from every segment and make the result durable
pub(crate) fn recover(shared: &Shared) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    {
        let mut state = shared.state.write();
        let State { index, datalog, .. } = &mut *state;

        let ids: Vec<u16> = datalog.segments_by_sequence_id().iter().map(|s| s.id()).collect();
        for id in ids {
            let Some(mut records) = datalog.iter_segment(id) else {
                continue;
            };
            report.segments_scanned += 1;

            for record in records.by_ref() {
                let record = match record {
                    Ok(record) => record,
                    Err(KeyhiveError::Truncated { .. }) => break,
                    Err(e) => return Err(e),
                };
                if let Some(segment) = datalog.segment_mut(id) {
                    segment.meta.put_records += 1;
                }
                let slot = Slot {
                    hash: shared.hash(record.key()),
                    segment_id: record.segment_id,
                    key_size: record.key_size(),
                    offset: record.offset,
                };
                insert_slot(index, datalog, record.key(), slot, &shared.metrics)?;
                report.records_replayed += 1;
            }

            let valid = records.offset();
            let size = datalog.segment(id).map_or(0, |s| s.size());
            if (valid as u64) < size {
                warn!(
                    segment = id,
                    offset = valid,
                    dropped = size - valid as u64,
                    "truncating segment at incomplete record"
                );
                datalog.truncate_segment(id, valid)?;
                report.segments_truncated += 1;
                report.bytes_dropped += size - valid as u64;
            }
        }

        datalog.seal_all_but_newest();
        datalog.persist()?;
        index.persist()?;
    }

    shared.write_db_meta()?;
    remove_backup_files(&shared.path)?;

    info!(
        segments = report.segments_scanned,
        records = report.records_replayed,
        truncated = report.segments_truncated,
        "recovery complete"
    );
    Ok(report)
}
