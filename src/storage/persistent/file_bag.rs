//! File-backed bag.
//!
//! Layout of a bag directory:
//! ```text
//! <dir>/.lock     exclusive lock, holds the owner pid
//! <dir>/bag.id    identity of the bag (hex uuid)
//! <dir>/bag.wal   committed transactions since the last snapshot
//! <dir>/bag.snap  compacted contents
//! ```
//!
//! Commits are logged before they become visible. Opening a bag loads the
//! snapshot and replays the log on top, skipping transactions the snapshot
//! already contains.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;

use crate::id::Uuid;
use crate::solution::{Multiplicity, Pattern, Tuple};
use crate::storage::memory::{lock_err, BagState};
use crate::storage::traits::{Bag, BagHandler, StorageError, TxId};

use super::file_lock::FileLock;
use super::snapshot::BagSnapshot;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const ID_FILE: &str = "bag.id";
const WAL_FILE: &str = "bag.wal";

/// Result of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionResult {
    /// Tuples written to the snapshot.
    pub tuples: usize,
    /// Log size before compaction, in bytes.
    pub wal_size_before: u64,
    /// Log size after compaction, in bytes.
    pub wal_size_after: u64,
}

/// A durable bag stored in one directory.
pub struct FileBag {
    uuid: Uuid,
    dir: PathBuf,
    state: RwLock<BagState>,
    wal: WriteAheadLog,
    config: PersistentConfig,
    _lock: FileLock,
}

impl std::fmt::Debug for FileBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBag")
            .field("uuid", &self.uuid)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FileBag {
    /// Opens the bag stored in `dir`, creating it if the directory is new.
    ///
    /// # Errors
    /// - the directory is locked by another holder
    /// - `dir` already holds a bag with a different identity
    /// - the snapshot is unreadable
    pub fn open(dir: &Path, uuid: Uuid, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let lock = FileLock::acquire(dir)?;
        check_identity(dir, uuid)?;

        let mut state = BagState::default();
        if let Some(snapshot) = BagSnapshot::read(dir)? {
            if snapshot.uuid != uuid {
                return Err(StorageError::BackendError(format!(
                    "snapshot belongs to bag {}, expected {uuid}",
                    snapshot.uuid
                )));
            }
            for (tuple, m) in &snapshot.base {
                state.apply(tuple, *m);
            }
            state.applied.extend(snapshot.applied);
        }

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)?;
        let mut replayed = 0usize;
        for entry in wal.iter()? {
            let entry = entry?;
            if let WalEntryKind::Commit { tx, deltas } = entry.kind {
                if state.applied.contains(&tx) {
                    continue;
                }
                state.apply_commit(tx, &deltas);
                replayed += 1;
            }
        }

        tracing::debug!(
            bag = %uuid,
            dir = %dir.display(),
            tuples = state.base.len(),
            replayed,
            "opened file bag"
        );

        Ok(Self {
            uuid,
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
            wal,
            config,
            _lock: lock,
        })
    }

    /// Directory holding this bag's files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Folds the log into a fresh snapshot and empties the log.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("bag.compact"))?;
        self.compact_locked(&state)
    }

    fn compact_locked(&self, state: &BagState) -> Result<CompactionResult, StorageError> {
        let wal_size_before = self.wal.size_bytes()?;
        let mut base: Vec<(Tuple, Multiplicity)> =
            state.base.iter().map(|(t, m)| (t.clone(), *m)).collect();
        base.sort_by_key(|(t, _)| t.key_of());
        let mut applied: Vec<TxId> = state.applied.iter().copied().collect();
        applied.sort();

        let tuples = base.len();
        BagSnapshot {
            uuid: self.uuid,
            created_at: Utc::now(),
            base,
            applied,
        }
        .write(&self.dir)?;
        self.wal.truncate()?;
        self.wal.append(WalEntryKind::Checkpoint {
            tuples: tuples as u64,
        })?;

        let result = CompactionResult {
            tuples,
            wal_size_before,
            wal_size_after: self.wal.size_bytes()?,
        };
        tracing::info!(
            bag = %self.uuid,
            tuples,
            wal_size_before,
            wal_size_after = result.wal_size_after,
            "compacted file bag"
        );
        Ok(result)
    }
}

fn check_identity(dir: &Path, uuid: Uuid) -> Result<(), StorageError> {
    let path = dir.join(ID_FILE);
    match fs::read_to_string(&path) {
        Ok(existing) => {
            let existing: Uuid = existing.trim().parse().map_err(|e| {
                StorageError::BackendError(format!("unreadable {}: {e}", path.display()))
            })?;
            if existing != uuid {
                return Err(StorageError::BackendError(format!(
                    "directory {} holds bag {existing}, not {uuid}",
                    dir.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::write(&path, format!("{uuid}\n"))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

impl Bag for FileBag {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn scan(&self, pattern: &Pattern, handler: &mut BagHandler<'_>) -> Result<(), StorageError> {
        self.state
            .read()
            .map_err(|_| lock_err("bag.scan"))?
            .scan(pattern, handler);
        Ok(())
    }

    fn multiplicity(&self, tuple: &Tuple) -> Result<Multiplicity, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("bag.multiplicity"))?;
        Ok(state.base.get(tuple).copied().unwrap_or(0))
    }

    fn stage(&self, tx: TxId, tuple: &Tuple, net: Multiplicity) -> Result<(), StorageError> {
        self.state
            .write()
            .map_err(|_| lock_err("bag.stage"))?
            .stage(tx, tuple, net);
        Ok(())
    }

    fn prepare(&self, _tx: TxId) -> Result<(), StorageError> {
        self.state.read().map_err(|_| lock_err("bag.prepare"))?;
        // The log must still be reachable before anything is appended to it.
        self.wal.size_bytes()?;
        Ok(())
    }

    fn commit(&self, tx: TxId) -> Result<Vec<(Tuple, Multiplicity)>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("bag.commit"))?;
        let Some(deltas) = state.take_staged(tx) else {
            return Ok(Vec::new());
        };
        if deltas.is_empty() {
            state.applied.insert(tx);
            return Ok(deltas);
        }

        let logged = self.wal.append(WalEntryKind::Commit {
            tx,
            deltas: deltas.clone(),
        });
        if let Err(e) = logged {
            // Put the staged deltas back so the caller can retry or abort.
            state.staged.insert(tx, deltas.into_iter().collect());
            return Err(e.into());
        }
        state.apply_commit(tx, &deltas);

        if self.wal.size_bytes()? > self.config.max_wal_size {
            self.compact_locked(&state)?;
        }
        Ok(deltas)
    }

    fn abort(&self, tx: TxId) -> Result<(), StorageError> {
        self.state
            .write()
            .map_err(|_| lock_err("bag.abort"))?
            .staged
            .remove(&tx);
        Ok(())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("bag.len"))?.base.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> PersistentConfig {
        PersistentConfig {
            sync_on_write: false,
            ..PersistentConfig::default()
        }
    }

    #[test]
    fn commits_survive_reopen() {
        let dir = tempdir().unwrap();
        let uuid = Uuid::generate();
        let tuple = Tuple::new("alice", "person", true);
        {
            let bag = FileBag::open(dir.path(), uuid, config()).unwrap();
            let tx = TxId::new(Uuid::generate(), 1);
            bag.stage(tx, &tuple, 2).unwrap();
            bag.commit(tx).unwrap();
        }
        let bag = FileBag::open(dir.path(), uuid, config()).unwrap();
        assert_eq!(bag.multiplicity(&tuple).unwrap(), 2);
    }

    #[test]
    fn uncommitted_stage_is_lost_on_reopen() {
        let dir = tempdir().unwrap();
        let uuid = Uuid::generate();
        {
            let bag = FileBag::open(dir.path(), uuid, config()).unwrap();
            bag.stage(TxId::new(uuid, 1), &Tuple::new("a", "r", 1), 1).unwrap();
        }
        let bag = FileBag::open(dir.path(), uuid, config()).unwrap();
        assert!(bag.is_empty().unwrap());
    }

    #[test]
    fn identity_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        drop(FileBag::open(dir.path(), Uuid::generate(), config()).unwrap());
        let err = FileBag::open(dir.path(), Uuid::generate(), config()).unwrap_err();
        assert!(err.to_string().contains("holds bag"));
    }

    #[test]
    fn compaction_keeps_contents_and_skips_replayed_transactions() {
        let dir = tempdir().unwrap();
        let uuid = Uuid::generate();
        let tuple = Tuple::new("counter", "hits", 0);
        {
            let bag = FileBag::open(dir.path(), uuid, config()).unwrap();
            for run in 1..=3 {
                let tx = TxId::new(uuid, run);
                bag.stage(tx, &tuple, 1).unwrap();
                bag.commit(tx).unwrap();
            }
            let result = bag.compact().unwrap();
            assert_eq!(result.tuples, 1);
            assert!(result.wal_size_after < result.wal_size_before);

            // Recommitting a folded transaction must not double count.
            let tx = TxId::new(uuid, 2);
            bag.stage(tx, &tuple, 1).unwrap();
            assert!(bag.commit(tx).unwrap().is_empty());
        }
        let bag = FileBag::open(dir.path(), uuid, config()).unwrap();
        assert_eq!(bag.multiplicity(&tuple).unwrap(), 3);
    }

    #[test]
    fn small_wal_limit_triggers_compaction() {
        let dir = tempdir().unwrap();
        let uuid = Uuid::generate();
        let cfg = PersistentConfig {
            max_wal_size: PersistentConfig::MIN_WAL_SIZE,
            sync_on_write: false,
        };
        let bag = FileBag::open(dir.path(), uuid, cfg).unwrap();
        for run in 0..200 {
            let tx = TxId::new(uuid, run);
            bag.stage(tx, &Tuple::new(format!("k{run}").as_str(), "r", run as i64), 1)
                .unwrap();
            bag.commit(tx).unwrap();
        }
        assert!(dir.path().join("bag.snap").exists());
        assert_eq!(bag.len().unwrap(), 200);
    }
}
