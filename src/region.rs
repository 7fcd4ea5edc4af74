//! Scratch arenas for operator rows.
//!
//! A [`Region`] hands out register rows and takes them back for reuse, and
//! keeps byte accounting so an evaluation can report how much scratch space
//! each lifetime tier holds. Each evaluation owns a long-lived region and a
//! working region that is reset every cycle; each block owns one more,
//! released when the block is closed.

use std::mem;

use crate::exec::Row;
use crate::value::Value;

const SLOT_BYTES: usize = mem::size_of::<Option<Value>>();

/// Point-in-time accounting for a region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Rows handed out and not yet released.
    pub live_rows: usize,
    /// Bytes held by live rows and the free list.
    pub bytes: usize,
    /// Highest `bytes` seen since the last reset.
    pub peak_bytes: usize,
    /// Rows served from the free list.
    pub recycled: u64,
    /// Rows dropped on release because fencing is on.
    pub fenced: u64,
}

/// A recycling arena of register rows.
#[derive(Debug)]
pub struct Region {
    name: String,
    fence: bool,
    free: Vec<Row>,
    stats: RegionStats,
    released: bool,
}

impl Region {
    /// Creates an empty region.
    #[must_use]
    pub fn new(name: impl Into<String>, fence: bool) -> Self {
        Self {
            name: name.into(),
            fence,
            free: Vec::new(),
            stats: RegionStats::default(),
            released: false,
        }
    }

    /// Name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A row of `width` unbound registers.
    pub fn row(&mut self, width: usize) -> Row {
        self.released = false;
        self.stats.live_rows += 1;
        if let Some(mut row) = self.free.pop() {
            let before = row.capacity();
            row.clear();
            row.resize(width, None);
            self.stats.recycled += 1;
            self.account_growth(before, row.capacity());
            return row;
        }
        let row = vec![None; width];
        self.grow(row.capacity() * SLOT_BYTES);
        row
    }

    /// Returns a row to the region.
    ///
    /// With fencing on, the row's registers are overwritten with a poison
    /// marker and the buffer is dropped, so any stale reference to it is
    /// visible instead of silently reading recycled data.
    pub fn release(&mut self, mut row: Row) {
        self.stats.live_rows = self.stats.live_rows.saturating_sub(1);
        if self.fence {
            let poison = Value::from("<fenced>");
            row.iter_mut().for_each(|slot| *slot = Some(poison.clone()));
            self.stats.bytes = self.stats.bytes.saturating_sub(row.capacity() * SLOT_BYTES);
            self.stats.fenced += 1;
            return;
        }
        self.free.push(row);
    }

    /// Drops the free list and clears accounting for a new cycle.
    pub fn reset(&mut self) {
        if self.stats.live_rows > 0 {
            tracing::debug!(
                region = %self.name,
                live_rows = self.stats.live_rows,
                "region reset with rows still live"
            );
        }
        self.free.clear();
        self.stats = RegionStats::default();
    }

    /// Releases every buffer this region holds. Safe to call repeatedly.
    pub fn release_all(&mut self) {
        if self.released {
            return;
        }
        self.reset();
        self.released = true;
    }

    /// Returns true once `release_all` ran and nothing was allocated since.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Current accounting.
    #[must_use]
    pub const fn stats(&self) -> RegionStats {
        self.stats
    }

    fn account_growth(&mut self, before: usize, after: usize) {
        if after > before {
            self.grow((after - before) * SLOT_BYTES);
        }
    }

    fn grow(&mut self, bytes: usize) {
        self.stats.bytes += bytes;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.bytes);
    }
}
