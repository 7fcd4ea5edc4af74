//! Disjunction over alternative sub-chains.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};

use crate::block::BlockBuilder;
use crate::error::{CompileError, ExecError};
use crate::exec::{Frame, Op, Operator, Row};
use crate::ir::Node;
use crate::perf::Perf;

/// Runs every branch on the input row and forwards each branch output to
/// the continuation.
///
/// `arms[..n-1]` are the branches, `arms[n-1]` the continuation.
pub struct Union {
    branches: Vec<Box<dyn Operator>>,
    outputs: Receiver<Row>,
    perf: Arc<Perf>,
    next: Box<dyn Operator>,
}

impl Union {
    fn forward(&mut self, frame: &mut Frame<'_>, perf: &Perf) -> Result<(), ExecError> {
        let pending: Vec<Row> = self.outputs.try_iter().collect();
        for mut out in pending {
            self.next.exec(frame, perf, Op::Insert, &mut out)?;
        }
        Ok(())
    }
}

impl Operator for Union {
    fn exec(
        &mut self,
        frame: &mut Frame<'_>,
        parent: &Perf,
        op: Op,
        row: &mut Row,
    ) -> Result<(), ExecError> {
        match op {
            Op::Insert => {
                let perf = Arc::clone(&self.perf);
                perf.measure(parent, || {
                    for branch in &mut self.branches {
                        branch.exec(frame, &perf, Op::Insert, row)?;
                    }
                    self.forward(frame, &perf)
                })
            }
            Op::Flush => {
                // Buffering operators inside branches emit on flush.
                for branch in &mut self.branches {
                    branch.exec(frame, parent, Op::Flush, row)?;
                }
                if !self.outputs.is_empty() {
                    self.perf.trigger();
                }
                self.forward(frame, parent)?;
                self.next.exec(frame, parent, Op::Flush, row)
            }
            Op::Close => {
                for branch in &mut self.branches {
                    branch.exec(frame, parent, Op::Close, row)?;
                }
                self.outputs.try_iter().for_each(drop);
                self.next.exec(frame, parent, Op::Close, row)
            }
        }
    }
}

/// Builds `union`.
pub fn build_union(b: &mut BlockBuilder<'_>, node: &Node) -> Result<Box<dyn Operator>, CompileError> {
    if node.arms.len() < 2 {
        return Err(b.malformed(
            node,
            "arms",
            "needs at least one branch and a continuation".to_string(),
        ));
    }
    let (tx, outputs) = unbounded();
    let split = node.arms.len() - 1;
    let mut branches = Vec::with_capacity(split);
    for arm in &node.arms[..split] {
        branches.push(b.subchain(arm, tx.clone())?);
    }
    Ok(Box::new(Union {
        branches,
        outputs,
        perf: b.perf(node),
        next: b.continuation(node, split)?,
    }))
}
