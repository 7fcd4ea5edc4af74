//! Operator chains.
//!
//! A compiled block is a chain of [`Operator`]s in continuation-passing
//! style: each operator does its local work on a register row and calls the
//! next operator zero or more times. The scheduler drives a chain with
//! `Op::Insert` once per cycle, then broadcasts `Op::Flush` so buffering
//! operators emit, and `Op::Close` when the block is torn down.

mod aggregate;
mod filter;
mod insert;
mod math;
mod negate;
mod scan;
mod trace;
mod union;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::error::ExecError;
use crate::id::Uuid;
use crate::ir::Term;
use crate::perf::Perf;
use crate::reconcile::Reconciler;
use crate::region::Region;
use crate::solution::{Mode, Multiplicity, Solution, Tuple, View};
use crate::storage::Bag;
use crate::value::Value;

pub use aggregate::{build_aggregate, Aggregate, AggregateOp};
pub use filter::{build_filter, Compare, Filter};
pub use insert::{build_insert, Insert};
pub use math::{build_math, build_move, Math, MathOp, Move};
pub use negate::{build_not, Not};
pub use scan::{build_scan, Scan};
pub use trace::Trace;
pub use union::{build_union, Union};

/// A register file. `None` marks an unbound register.
pub type Row = Vec<Option<Value>>;

/// What the scheduler asks an operator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Process one row.
    Insert,
    /// End of a block pass: emit anything buffered.
    Flush,
    /// Teardown: drop operator-local state.
    Close,
}

/// One executable step of a block.
///
/// Every operator handles all three [`Op`]s, forwarding `Flush` and `Close`
/// to everything downstream even when it has nothing to do itself.
pub trait Operator: Send {
    fn exec(
        &mut self,
        frame: &mut Frame<'_>,
        parent: &Perf,
        op: Op,
        row: &mut Row,
    ) -> Result<(), ExecError>;
}

/// Everything an operator may touch while a block runs.
pub struct Frame<'a> {
    pub(crate) region: &'a mut Region,
    pub(crate) bags: &'a HashMap<Uuid, Arc<dyn Bag>>,
    pub(crate) solution: &'a Solution,
    pub(crate) previous: Option<&'a Solution>,
    pub(crate) reconciler: &'a mut Reconciler,
    pub(crate) cancel: &'a AtomicBool,
    pub(crate) block: usize,
}

impl<'a> Frame<'a> {
    /// Read-only view of bag contents plus the run's sealed solution.
    #[must_use]
    pub fn view(&self) -> View<'a> {
        View::new(self.bags, self.solution)
    }

    /// Working region for scratch rows.
    pub fn region(&mut self) -> &mut Region {
        self.region
    }

    /// Index of the executing block.
    #[must_use]
    pub const fn block(&self) -> usize {
        self.block
    }

    /// Returns true once the evaluation was asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Hands a fact to the reconciler on behalf of the executing block.
    pub fn insert(
        &mut self,
        scope: Uuid,
        tuple: Tuple,
        multiplicity: Multiplicity,
        mode: Mode,
    ) -> Result<(), ExecError> {
        self.reconciler.insert(
            self.bags,
            self.solution,
            self.previous,
            scope,
            tuple,
            multiplicity,
            mode,
        )
    }
}

/// End of a chain.
#[derive(Debug, Default)]
pub struct Terminal;

impl Operator for Terminal {
    fn exec(&mut self, _: &mut Frame<'_>, _: &Perf, _: Op, _: &mut Row) -> Result<(), ExecError> {
        Ok(())
    }
}

/// End of a sub-chain: copies every row it sees to the owning operator.
#[derive(Debug)]
pub struct Sink {
    rows: Sender<Row>,
}

impl Sink {
    pub(crate) fn new(rows: Sender<Row>) -> Self {
        Self { rows }
    }
}

impl Operator for Sink {
    fn exec(&mut self, _: &mut Frame<'_>, _: &Perf, op: Op, row: &mut Row) -> Result<(), ExecError> {
        if op == Op::Insert {
            self.rows.send(row.clone()).map_err(|_| ExecError::Disconnected {
                path: "sub-chain sink".to_string(),
            })?;
        }
        Ok(())
    }
}

/// Current value of a term, `None` if it names an unbound register.
#[must_use]
pub fn resolve(term: &Term, row: &Row) -> Option<Value> {
    match term {
        Term::Constant(v) => Some(v.clone()),
        Term::Register { index, .. } => row.get(*index).cloned().flatten(),
    }
}

/// Binds `slot` to `value` and returns what it held before.
pub(crate) fn bind(row: &mut Row, slot: usize, value: Value) -> Option<Value> {
    row.get_mut(slot).and_then(|s| s.replace(value))
}

/// Undoes a [`bind`].
pub(crate) fn restore(row: &mut Row, slot: usize, previous: Option<Value>) {
    if let Some(s) = row.get_mut(slot) {
        *s = previous;
    }
}
