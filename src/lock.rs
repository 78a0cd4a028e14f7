//! Advisory lock on the store directory
//!
//! The lock file is removed on a clean close. Finding it on open while
//! still being able to lock it means the previous owner died without
//! closing, which is what triggers recovery.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{KeyhiveError, Result};

/// Lock file name within the store directory
pub const LOCK_NAME: &str = "lock";

/// An exclusively locked lock file
#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Lock the store in `dir`.
    ///
    /// Returns the lock and whether the lock file was left behind by a
    /// previous owner.
    pub fn acquire(dir: &Path) -> Result<(Self, bool)> {
        let path = dir.join(LOCK_NAME);
        let (file, existed) = match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
            Ok(file) => (file, false),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                (file, true)
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(KeyhiveError::Locked);
            }
            return Err(e.into());
        }

        Ok((Self { path, file }, existed))
    }

    /// Remove the lock file and drop the lock
    pub fn release(self) -> Result<()> {
        let removed = fs::remove_file(&self.path);
        let unlocked = FileExt::unlock(&self.file);
        removed?;
        unlocked?;
        Ok(())
    }
}
