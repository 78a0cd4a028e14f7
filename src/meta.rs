//! Metadata files
//!
//! Engine, index and segment metadata are small serde structs stored as
//! bincode in `*.pmt` files. Writes go to a temporary file that is synced
//! and renamed over the target, so a crash leaves either the old or the new
//! contents.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Extension shared by all metadata files
pub const META_EXT: &str = ".pmt";

/// Engine metadata file name
pub const DB_META_NAME: &str = "db.pmt";

/// Persisted engine state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DbMeta {
    pub hash_seed: u32,
}

/// Atomically replace `path` with the encoded value
pub fn write_meta_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = bincode::serialize(value)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    let mut file = File::create(tmp_path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Read a metadata file; `None` if it does not exist
pub fn read_meta_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(bincode::deserialize(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a metadata file, ignoring a missing one
pub fn remove_meta_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
