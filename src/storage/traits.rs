//! Abstract storage contract for bags.
//!
//! A bag is a durable multiset of tuples identified by a `Uuid`. Evaluations
//! never write the base contents directly: they stage per-transaction deltas
//! and commit them once a run is stable. By using a trait, we enable:
//! - In-memory bags for testing and embedded use
//! - File-backed bags for durability
//! - Wrappers that inject failures or share bags across evaluations

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::Uuid;
use crate::solution::{Multiplicity, Pattern, Tuple};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transaction was never staged on this bag.
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxId),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O failure in a file-backed bag.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of one run's staged writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId {
    /// Evaluation that owns the run.
    pub evaluation: Uuid,
    /// Run sequence number within the evaluation.
    pub run: u64,
}

impl TxId {
    /// Transaction of run `run` in `evaluation`.
    #[must_use]
    pub const fn new(evaluation: Uuid, run: u64) -> Self {
        Self { evaluation, run }
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.evaluation, self.run)
    }
}

/// Callback used for bulk iteration over bag contents.
pub type BagHandler<'a> = dyn FnMut(&Tuple, Multiplicity) + 'a;

/// Storage trait for bags.
///
/// # Consistency
/// - All mutation must be atomic with respect to other callers: bags may be
///   shared between evaluations running on different threads.
/// - `stage` has set semantics per `(tx, tuple)`: re-staging the same value is
///   a no-op, so callers may retry freely.
/// - `commit` of an already committed transaction is a no-op.
/// - a successful `prepare` should make the following `commit` unlikely to
///   fail; bags cannot undo a commit once it returned.
pub trait Bag: Send + Sync {
    /// Identity of this bag.
    fn uuid(&self) -> Uuid;

    /// Calls `handler` for every stored tuple matching `pattern` with a
    /// non-zero multiplicity.
    fn scan(&self, pattern: &Pattern, handler: &mut BagHandler<'_>) -> Result<(), StorageError>;

    /// Committed multiplicity of a tuple (0 when absent).
    fn multiplicity(&self, tuple: &Tuple) -> Result<Multiplicity, StorageError>;

    /// Records the net delta a transaction will apply to `tuple`.
    fn stage(&self, tx: TxId, tuple: &Tuple, net: Multiplicity) -> Result<(), StorageError>;

    /// Checks that a transaction's staged deltas can be committed, without
    /// applying them. Every bag a run touched is prepared before any of them
    /// commits.
    fn prepare(&self, _tx: TxId) -> Result<(), StorageError> {
        Ok(())
    }

    /// Applies a transaction's staged deltas and returns them.
    fn commit(&self, tx: TxId) -> Result<Vec<(Tuple, Multiplicity)>, StorageError>;

    /// Discards a transaction's staged deltas.
    fn abort(&self, tx: TxId) -> Result<(), StorageError>;

    /// Number of tuples with a non-zero multiplicity.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if no tuple has a non-zero multiplicity.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}
