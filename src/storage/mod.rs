//! Bag storage for blockflow.
//!
//! The [`Bag`] trait is the only way the engine touches durable facts.
//! [`MemoryBag`] keeps everything in memory; `persistent::FileBag` adds a
//! write-ahead log and snapshots on disk.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::MemoryBag;
pub use traits::{Bag, BagHandler, StorageError, TxId};

#[cfg(feature = "persistent")]
pub use persistent::{filebag_init, FileBag, PersistentConfig};
