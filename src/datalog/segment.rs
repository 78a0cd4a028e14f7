//! Segments
//!
//! A segment is one append-only `.psg` file of records. Its physical id
//! (`u16`) addresses it from index slots; its sequence id (`u64`) orders it
//! among all segments ever written. Both are encoded in the file name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::file::DataFile;
use crate::meta::{read_meta_file, remove_meta_file, write_meta_file, META_EXT};

/// Segment file extension
pub const SEGMENT_EXT: &str = ".psg";

/// Upper bound on physical segment ids
pub const MAX_SEGMENTS: usize = i16::MAX as usize;

/// "00003-17.psg" for segment 3 with sequence id 17
pub fn segment_name(id: u16, sequence_id: u64) -> String {
    format!("{:05}-{}{}", id, sequence_id, SEGMENT_EXT)
}

/// "00003-17.psg" → Some((3, 17))
pub fn parse_segment_name(name: &str) -> Option<(u16, u64)> {
    let stem = name.strip_suffix(SEGMENT_EXT)?;
    let (id, sequence_id) = stem.split_once('-')?;
    Some((id.parse().ok()?, sequence_id.parse().ok()?))
}

/// Segment statistics used to pick compaction candidates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// No further appends go to this segment
    pub full: bool,
    pub put_records: u32,
    /// Reserved for tombstones; nothing writes delete records yet
    pub delete_records: u32,
    /// Records whose key now lives elsewhere
    pub deleted_keys: u32,
    /// Encoded size of those records
    pub deleted_bytes: u32,
}

/// An open segment
#[derive(Debug)]
pub struct Segment {
    pub(crate) id: u16,
    pub(crate) sequence_id: u64,
    pub(crate) name: String,
    pub(crate) file: Arc<DataFile>,
    pub(crate) meta: SegmentMeta,
}

impl Segment {
    /// Open or create a segment in `dir`, loading its metadata if present
    pub(crate) fn open(dir: &Path, id: u16, sequence_id: u64) -> Result<Self> {
        let name = segment_name(id, sequence_id);
        let file = DataFile::open(&dir.join(&name))?;
        let meta = read_meta_file(&meta_path(dir, &name))?.unwrap_or_default();
        Ok(Self {
            id,
            sequence_id,
            name,
            file: Arc::new(file),
            meta,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Record bytes written (header excluded)
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Share of the segment occupied by superseded records
    pub fn fragmentation(&self) -> f32 {
        match self.size() {
            0 => 0.0,
            size => self.meta.deleted_bytes as f32 / size as f32,
        }
    }

    pub(crate) fn save_meta(&self, dir: &Path) -> Result<()> {
        write_meta_file(&meta_path(dir, &self.name), &self.meta)
    }

    pub(crate) fn remove_files(&self, dir: &Path) -> Result<()> {
        std::fs::remove_file(self.file.path())?;
        remove_meta_file(&meta_path(dir, &self.name))
    }
}

fn meta_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}{}", name, META_EXT))
}
