//! # Keyhive
//!
//! An embedded, persistent store of unique byte-string keys with:
//! - An append-only, segmented datalog of checksummed records
//! - A disk-resident linear-hashing index
//! - Crash recovery that rebuilds the index from the datalog
//! - Background sync and compaction
//! - Single-writer/multi-reader concurrency model
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │      put / has / has_or_put / items / compact / close       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  RwLock (single writer / multi reader)
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Datalog   │◄─────────│    Index    │
//!   │ (segments)  │  slots   │ (main.pix + │
//!   │             │          │ overflow)   │
//!   └─────────────┘          └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use keyhive::{Engine, Options};
//!
//! let engine = Engine::open("/tmp/keyhive", Options::default())?;
//! engine.put(b"alpha")?;
//! assert!(engine.has(b"alpha")?);
//! for key in engine.items() {
//!     println!("{:?}", key?);
//! }
//! engine.close()?;
//! # Ok::<(), keyhive::KeyhiveError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod hash;
pub mod metrics;

mod file;
mod lock;
mod meta;

pub mod datalog;
pub mod index;
pub mod iterator;
pub mod recovery;
pub mod compaction;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{KeyhiveError, Result};
pub use config::{Options, OptionsBuilder, SyncStrategy};
pub use engine::Engine;
pub use iterator::ItemIterator;
pub use compaction::CompactionResult;
pub use recovery::RecoveryReport;
pub use metrics::{Metrics, MetricsSnapshot};

// =============================================================================
// Limits
// =============================================================================

/// Current version of Keyhive
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Longest key that can be stored
pub const MAX_KEY_LENGTH: usize = u16::MAX as usize;

/// Most keys one store can hold
pub const MAX_KEYS: u64 = u32::MAX as u64;
