//! Write-ahead log of committed bag transactions.
//!
//! Every commit is appended (and optionally fsynced) before it is applied in
//! memory. On open, the log is scanned; a torn or corrupt tail is cut off so
//! later appends never land behind unreadable bytes.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: framed WalEntry]
//! [ENTRY 2: framed WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::solution::{Multiplicity, Tuple};
use crate::storage::traits::TxId;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing within one log generation.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// What was logged.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A committed transaction and the deltas it applied.
    Commit {
        /// The committed transaction.
        tx: TxId,
        /// Net delta per tuple.
        deltas: Vec<(Tuple, Multiplicity)>,
    },
    /// Everything before this marker is contained in the snapshot.
    Checkpoint {
        /// Tuples in the snapshot that was just written.
        tuples: u64,
    },
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal")
}

struct Tail {
    writer: BufWriter<File>,
    sequence: u64,
}

/// Append-only log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    tail: Mutex<Tail>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Open or create a log file, cutting off any unreadable tail.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let fresh = !path.exists() || std::fs::metadata(path)?.len() < codec::HEADER_LEN;
        if fresh {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
        }

        let (sequence, valid_len) = Self::scan_valid(path)?;
        let file_len = std::fs::metadata(path)?.len();
        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                kept = valid_len,
                dropped = file_len - valid_len,
                "truncating unreadable WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            tail: Mutex::new(Tail {
                writer: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    /// Append an entry and return its sequence number.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut tail = self.tail.lock().map_err(|_| poisoned())?;
        let entry = WalEntry {
            sequence: tail.sequence + 1,
            timestamp: Utc::now(),
            kind,
        };
        let bytes = codec::encode(&entry)?;
        tail.writer.write_all(&bytes)?;
        tail.writer.flush()?;
        if self.sync_on_write {
            tail.writer.get_ref().sync_all()?;
        }
        tail.sequence = entry.sequence;
        Ok(entry.sequence)
    }

    /// Iterate over all readable entries.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.tail.lock().map_err(|_| poisoned())?.sequence)
    }

    /// Size of the log file in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Reset the log to an empty generation.
    ///
    /// Only call this after the snapshot covering every entry is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut tail = self.tail.lock().map_err(|_| poisoned())?;
        tail.writer.flush()?;

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        codec::write_header(&mut file)?;
        file.sync_all()?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        tail.writer = BufWriter::new(file);
        tail.sequence = 0;
        Ok(())
    }

    fn scan_valid(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last = 0;
        while let Some(entry) = iter.next() {
            match entry {
                Ok(e) => last = e.sequence,
                Err(e) => {
                    tracing::warn!(sequence = last + 1, error = %e, "WAL corruption detected");
                    break;
                }
            }
        }
        Ok((last, iter.valid_len))
    }
}

/// Iterator over WAL entries. Stops at the first unreadable entry.
pub struct WalIterator {
    reader: BufReader<File>,
    file_len: u64,
    valid_len: u64,
    failed: bool,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self {
            reader,
            file_len,
            valid_len: codec::HEADER_LEN,
            failed: false,
        })
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.valid_len >= self.file_len {
            return None;
        }
        match codec::decode::<WalEntry>(&mut self.reader) {
            Ok(entry) => match self.reader.stream_position() {
                Ok(pos) => {
                    self.valid_len = pos;
                    Some(Ok(entry))
                }
                Err(e) => {
                    self.failed = true;
                    Some(Err(e))
                }
            },
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
