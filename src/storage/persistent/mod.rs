//! File-backed bags.
//!
//! This module provides durable, crash-safe bags with:
//! - Write-ahead logging of committed transactions
//! - File locking for single-holder access
//! - CRC32 checksums for corruption detection
//! - Snapshot compaction once the log grows past a limit
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          FileBag                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐                    │
//! │  │ WriteAheadLog   │  │ BagSnapshot     │                    │
//! │  │ (append-only)   │  │ (compacted)     │                    │
//! │  └────────┬────────┘  └────────┬────────┘                    │
//! │           │                    │                             │
//! │           └──────────┬─────────┘                             │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │   FileLock (flock)  │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod file_bag;
mod file_lock;
mod snapshot;
mod wal;

pub use file_bag::{CompactionResult, FileBag};
pub use file_lock::FileLock;
pub use snapshot::BagSnapshot;
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{ConfigError, EngineError, EngineResult};
use crate::id::Uuid;

/// Configuration for file-backed bags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Maximum WAL size before compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every commit (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    /// Smallest accepted `max_wal_size`; smaller limits compact on every commit.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Checks the configuration.
    ///
    /// # Errors
    /// `ConfigError::Invalid` if `max_wal_size` is below [`Self::MIN_WAL_SIZE`].
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::Invalid {
                field: "max_wal_size".to_string(),
                reason: format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// Open or create the file-backed bag `uuid` in directory `path`.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another holder owns the lock
/// - If the directory belongs to a different bag
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use blockflow::storage::persistent::filebag_init;
///
/// let people = Arc::new(filebag_init("./people.bag", Uuid::generate(), None)?);
/// ```
pub fn filebag_init(
    path: impl AsRef<Path>,
    uuid: Uuid,
    config: Option<PersistentConfig>,
) -> EngineResult<FileBag> {
    let cfg = config.unwrap_or_default().validate()?;
    FileBag::open(path.as_ref(), uuid, cfg).map_err(|e| {
        tracing::error!(bag = %uuid, path = %path.as_ref().display(), error = %e, "failed to open file bag");
        EngineError::from(e)
    })
}
