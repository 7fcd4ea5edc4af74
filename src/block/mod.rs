//! Blocks: live instantiations of compiled rule programs.
//!
//! A [`Block`] owns its operator chain, its register count, the variable
//! name map recorded while building, and a region for its rows. Blocks are
//! created by [`BlockBuilder::build`] and torn down by [`Block::close`].

mod builder;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use builder::{builders_table, BlockBuilder, BuildFn, BuilderTable, DEFAULT_SCOPE};

use crate::error::ExecError;
use crate::exec::{Frame, Op, Operator};
use crate::perf::Perf;
use crate::region::Region;

/// A compiled block inside one evaluation.
pub struct Block {
    id: usize,
    name: String,
    regs: usize,
    head: Box<dyn Operator>,
    nmap: BTreeMap<String, usize>,
    region: Region,
    event: bool,
    perf: Arc<Perf>,
    closed: bool,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("regs", &self.regs)
            .field("event", &self.event)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Block {
    /// Identity of this block's output in the block solution.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Name the block was compiled with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width of this block's register rows.
    #[must_use]
    pub const fn regs(&self) -> usize {
        self.regs
    }

    /// Variable names and the registers they were allocated.
    #[must_use]
    pub const fn nmap(&self) -> &BTreeMap<String, usize> {
        &self.nmap
    }

    /// Returns true for blocks that run only on injected events.
    #[must_use]
    pub const fn is_event(&self) -> bool {
        self.event
    }

    /// Returns true once [`Block::close`] has run.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Region holding this block's rows.
    #[must_use]
    pub const fn region(&self) -> &Region {
        &self.region
    }

    /// One pass: drive the chain with an empty row, then flush it.
    pub(crate) fn run(&mut self, frame: &mut Frame<'_>) -> Result<(), ExecError> {
        if self.closed {
            return Err(ExecError::Closed);
        }
        let root = Perf::default();
        let perf = Arc::clone(&self.perf);
        let mut row = self.region.row(self.regs);
        let result = perf.measure(&root, || {
            self.head.exec(frame, &perf, Op::Insert, &mut row)?;
            self.head.exec(frame, &perf, Op::Flush, &mut row)
        });
        self.region.release(row);
        result
    }

    /// Broadcasts `Op::Close` down the chain and releases the block region.
    /// Safe to call more than once.
    pub fn close(&mut self, frame: &mut Frame<'_>) -> Result<(), ExecError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut row = self.region.row(self.regs);
        let result = self.head.exec(frame, &self.perf, Op::Close, &mut row);
        self.region.release(row);
        self.region.release_all();
        tracing::debug!(block = %self.name, "block closed");
        result
    }
}
