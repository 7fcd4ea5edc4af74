//! Point-in-time image of a bag's committed contents.
//!
//! A snapshot is written to a temporary file and renamed into place, so a
//! crash leaves either the previous snapshot or the new one, never a mix.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::Uuid;
use crate::solution::{Multiplicity, Tuple};
use crate::storage::traits::TxId;

use super::codec;

pub(crate) const SNAPSHOT_FILE: &str = "bag.snap";
const SNAPSHOT_TMP: &str = "bag.snap.tmp";

/// Committed contents plus the transactions already folded into them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BagSnapshot {
    /// Bag the snapshot belongs to.
    pub uuid: Uuid,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
    /// Non-zero multiplicities, sorted by tuple.
    pub base: Vec<(Tuple, Multiplicity)>,
    /// Transactions folded into `base`.
    pub applied: Vec<TxId>,
}

impl BagSnapshot {
    /// Reads the snapshot in `dir`, if one exists.
    pub fn read(dir: &Path) -> IoResult<Option<Self>> {
        let file = match File::open(dir.join(SNAPSHOT_FILE)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        codec::decode(&mut reader).map(Some)
    }

    /// Atomically replaces the snapshot in `dir`.
    pub fn write(&self, dir: &Path) -> IoResult<()> {
        let tmp = dir.join(SNAPSHOT_TMP);
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            codec::write_header(&mut writer)?;
            writer.write_all(&codec::encode(self)?)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;
        sync_dir(dir)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> IoResult<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> IoResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_snapshot_reads_as_none() {
        let dir = tempdir().unwrap();
        assert!(BagSnapshot::read(dir.path()).unwrap().is_none());
    }

    #[test]
    fn write_replaces_previous_snapshot() {
        let dir = tempdir().unwrap();
        let uuid = Uuid::generate();
        let mut snap = BagSnapshot {
            uuid,
            created_at: Utc::now(),
            base: vec![(Tuple::new("alice", "person", true), 1)],
            applied: vec![TxId::new(uuid, 1)],
        };
        snap.write(dir.path()).unwrap();
        snap.base.push((Tuple::new("bob", "person", true), 2));
        snap.write(dir.path()).unwrap();

        let back = BagSnapshot::read(dir.path()).unwrap().unwrap();
        assert_eq!(back.uuid, uuid);
        assert_eq!(back.base.len(), 2);
        assert_eq!(back.applied, vec![TxId::new(uuid, 1)]);
        assert!(!dir.path().join(SNAPSHOT_TMP).exists());
    }
}
