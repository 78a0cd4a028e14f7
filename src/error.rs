//! Error types for Keyhive
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using KeyhiveError
pub type Result<T> = std::result::Result<T, KeyhiveError>;

/// Unified error type for Keyhive operations
#[derive(Debug, Error)]
pub enum KeyhiveError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Input Validation
    // -------------------------------------------------------------------------
    #[error("key is too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    // -------------------------------------------------------------------------
    // Datalog / Index Errors
    // -------------------------------------------------------------------------
    /// Checksum or structural violation in a segment or index file.
    #[error("database is corrupted: {0}")]
    Corrupted(String),

    /// A record ends before its declared size. Only expected at the tail of
    /// a segment after an unclean shutdown.
    #[error("truncated record in segment {segment} at offset {offset}")]
    Truncated { segment: u16, offset: u32 },

    #[error("database is full: {0}")]
    Full(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    /// Another live process holds the store's advisory lock.
    #[error("database is locked")]
    Locked,

    /// A compaction is already running.
    #[error("database is busy")]
    Busy,
}

impl KeyhiveError {
    /// True for checksum failures and truncated records.
    pub fn is_corruption(&self) -> bool {
        matches!(self, KeyhiveError::Corrupted(_) | KeyhiveError::Truncated { .. })
    }
}

impl From<bincode::Error> for KeyhiveError {
    fn from(err: bincode::Error) -> Self {
        KeyhiveError::Serialization(err.to_string())
    }
}
