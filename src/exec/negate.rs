//! Negation as failure.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};

use crate::block::BlockBuilder;
use crate::error::{CompileError, ExecError};
use crate::exec::{Frame, Op, Operator, Row};
use crate::ir::Node;
use crate::perf::Perf;

/// Passes a row only if the negated sub-chain produces nothing for it.
///
/// `arms[0]` is the negated sub-chain, `arms[1]` the continuation.
pub struct Not {
    negated: Box<dyn Operator>,
    witnesses: Receiver<Row>,
    perf: Arc<Perf>,
    next: Box<dyn Operator>,
}

impl Not {
    fn drain(&self) -> bool {
        self.witnesses.try_iter().count() > 0
    }
}

impl Operator for Not {
    fn exec(
        &mut self,
        frame: &mut Frame<'_>,
        parent: &Perf,
        op: Op,
        row: &mut Row,
    ) -> Result<(), ExecError> {
        if op != Op::Insert {
            self.negated.exec(frame, parent, op, row)?;
            self.drain();
            return self.next.exec(frame, parent, op, row);
        }
        let perf = Arc::clone(&self.perf);
        perf.measure(parent, || {
            self.negated.exec(frame, &perf, Op::Insert, row)?;
            if self.drain() {
                return Ok(());
            }
            self.next.exec(frame, &perf, Op::Insert, row)
        })
    }
}

/// Builds `not`.
pub fn build_not(b: &mut BlockBuilder<'_>, node: &Node) -> Result<Box<dyn Operator>, CompileError> {
    let arm = node
        .arms
        .first()
        .ok_or_else(|| b.malformed(node, "arms", "missing negated sub-chain".to_string()))?;
    let (tx, witnesses) = unbounded();
    let negated = b.subchain(arm, tx)?;
    Ok(Box::new(Not {
        negated,
        witnesses,
        perf: b.perf(node),
        next: b.continuation(node, 1)?,
    }))
}
