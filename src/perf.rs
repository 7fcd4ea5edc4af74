//! Per-operator performance counters.
//!
//! Every operator owns a [`Perf`] registered in its evaluation's
//! [`Counters`] under `"<block>/<node id>"`. Time is self time: an operator
//! subtracts the time spent in its continuation from the parent counter it
//! was called with.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

/// Counters for one operator.
#[derive(Debug, Default)]
pub struct Perf {
    count: AtomicU64,
    time_ns: AtomicI64,
    trig: AtomicU64,
}

impl Perf {
    /// Runs `f` as one invocation of this operator.
    ///
    /// Elapsed time is added here and subtracted from `parent`, whose own
    /// measurement covers this call.
    pub fn measure<T>(&self, parent: &Perf, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        let elapsed = i64::try_from(start.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.time_ns.fetch_add(elapsed, Ordering::Relaxed);
        parent.time_ns.fetch_sub(elapsed, Ordering::Relaxed);
        out
    }

    /// Records a flush-triggered emission.
    pub fn trigger(&self) {
        self.trig.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of rows processed.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Number of flush-triggered emissions.
    #[must_use]
    pub fn trig(&self) -> u64 {
        self.trig.load(Ordering::Relaxed)
    }

    /// Accumulated self time in nanoseconds.
    #[must_use]
    pub fn time_ns(&self) -> i64 {
        self.time_ns.load(Ordering::Relaxed)
    }
}

/// A serializable copy of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerfSnapshot {
    /// `"<block>/<node id>"`, or the block name for its root counter.
    pub name: String,
    /// Rows processed.
    pub count: u64,
    /// Self time in nanoseconds.
    pub time_ns: i64,
    /// Flushes that found buffered work.
    pub trig: u64,
}

/// Named counter table of one evaluation.
#[derive(Debug, Default)]
pub struct Counters {
    table: BTreeMap<String, Arc<Perf>>,
}

impl Counters {
    /// Returns the counter registered under `name`, creating it if needed.
    pub fn register(&mut self, name: impl Into<String>) -> Arc<Perf> {
        Arc::clone(self.table.entry(name.into()).or_default())
    }

    /// Looks up a counter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<Perf>> {
        self.table.get(name)
    }

    /// Copies every counter, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PerfSnapshot> {
        self.table
            .iter()
            .map(|(name, perf)| PerfSnapshot {
                name: name.clone(),
                count: perf.count(),
                time_ns: perf.time_ns(),
                trig: perf.trig(),
            })
            .collect()
    }

    /// Drops every counter whose name starts with `prefix`.
    pub fn remove_prefix(&mut self, prefix: &str) {
        self.table.retain(|name, _| !name.starts_with(prefix));
    }
}
