//! Data files
//!
//! Every segment and index file starts with the same fixed-size header,
//! followed by the file's payload. Offsets handed out by [`DataFile`] are
//! relative to the end of the header.
//!
//! ## Header (512 bytes)
//! ```text
//! ┌───────────────┬─────────────────┬──────────────────────┐
//! │ Signature (8) │ Version u32 (4) │ Zero padding (500)   │
//! └───────────────┴─────────────────┴──────────────────────┘
//! ```
//!
//! Reads and writes are positional, so readers holding `&DataFile` never
//! contend on a shared cursor.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{KeyhiveError, Result};

/// Size of the header in front of every data file
pub const HEADER_SIZE: u64 = 512;

/// Magic bytes identifying a Keyhive data file
const SIGNATURE: &[u8; 8] = b"keyhive\x0e";

/// Current on-disk format version
const FORMAT_VERSION: u32 = 1;

/// A headered file with positional reads and appends
#[derive(Debug)]
pub(crate) struct DataFile {
    path: PathBuf,
    file: File,
    /// Payload length (file length minus header)
    size: AtomicU64,
}

impl DataFile {
    /// Open a data file, writing a fresh header if it is empty
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            let mut header = [0u8; HEADER_SIZE as usize];
            header[..8].copy_from_slice(SIGNATURE);
            header[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            write_all_at(&file, &header, 0)?;
        } else {
            if len < HEADER_SIZE {
                return Err(KeyhiveError::Corrupted(format!(
                    "{}: file shorter than header ({} bytes)",
                    path.display(),
                    len
                )));
            }
            let mut header = [0u8; 12];
            if read_full_at(&file, &mut header, 0)? != header.len() {
                return Err(KeyhiveError::Corrupted(format!(
                    "{}: short header",
                    path.display()
                )));
            }
            if &header[..8] != SIGNATURE {
                return Err(KeyhiveError::Corrupted(format!(
                    "{}: invalid signature {:?}",
                    path.display(),
                    &header[..8]
                )));
            }
            let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
            if version != FORMAT_VERSION {
                return Err(KeyhiveError::Corrupted(format!(
                    "{}: unsupported format version {}",
                    path.display(),
                    version
                )));
            }
        }

        let size = len.max(HEADER_SIZE) - HEADER_SIZE;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size: AtomicU64::new(size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Append bytes at the end of the payload, returning their offset.
    ///
    /// Callers serialize appends; concurrent readers only ever see bytes
    /// below the published size.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let offset = self.size();
        write_all_at(&self.file, data, HEADER_SIZE + offset)?;
        self.size.store(offset + data.len() as u64, Ordering::Release);
        Ok(offset)
    }

    /// Overwrite bytes in place, extending the payload if needed
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        write_all_at(&self.file, data, HEADER_SIZE + offset)?;
        let end = offset + data.len() as u64;
        self.size.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.size() {
            return Err(KeyhiveError::Corrupted(format!(
                "{}: read past end (offset {}, len {}, size {})",
                self.path.display(),
                offset,
                buf.len(),
                self.size()
            )));
        }
        let n = read_full_at(&self.file, buf, HEADER_SIZE + offset)?;
        if n != buf.len() {
            return Err(KeyhiveError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        Ok(())
    }

    /// Cut the payload down to `size` bytes
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file.set_len(HEADER_SIZE + size)?;
        self.file.sync_all()?;
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sequential reader over a shared data file, bounded by `end`
pub(crate) struct DataFileReader {
    file: Arc<DataFile>,
    pos: u64,
    end: u64,
}

impl DataFileReader {
    pub fn new(file: Arc<DataFile>, start: u64, end: u64) -> Self {
        Self { file, pos: start, end }
    }
}

impl Read for DataFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(remaining as usize);
        let n = pread(&self.file.file, &mut buf[..len], HEADER_SIZE + self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Read into `buf` until it is full or the reader is exhausted.
///
/// Returns the number of bytes read, so callers can tell a clean end
/// (zero) from a partial read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match pread(file, &mut buf[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    while !data.is_empty() {
        match pwrite(file, data, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, data: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, data, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, data: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, data, offset)
}
