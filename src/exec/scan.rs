//! Fact scans: the join step of a block.

use std::sync::Arc;

use crate::block::BlockBuilder;
use crate::error::{CompileError, ExecError};
use crate::exec::{bind, resolve, restore, Frame, Op, Operator, Row};
use crate::id::Uuid;
use crate::ir::{Node, Term};
use crate::perf::Perf;
use crate::solution::{Pattern, Tuple};
use crate::value::Value;

/// Enumerates present facts matching the row's bound terms, binding the
/// unbound ones for each match.
pub struct Scan {
    scope: Uuid,
    terms: [Term; 3],
    perf: Arc<Perf>,
    next: Box<dyn Operator>,
}

fn component(tuple: &Tuple, position: usize) -> &Value {
    match position {
        0 => &tuple.key,
        1 => &tuple.relation,
        _ => &tuple.value,
    }
}

impl Scan {
    fn pattern(&self, row: &Row) -> Pattern {
        let [key, relation, value] = &self.terms;
        Pattern {
            key: resolve(key, row),
            relation: resolve(relation, row),
            value: resolve(value, row),
        }
    }
}

fn emit(
    terms: &[Term; 3],
    next: &mut Box<dyn Operator>,
    frame: &mut Frame<'_>,
    perf: &Perf,
    tuple: &Tuple,
    row: &mut Row,
) -> Result<(), ExecError> {
    let mut bound: Vec<(usize, Option<Value>)> = Vec::new();
    let mut consistent = true;
    for (position, term) in terms.iter().enumerate() {
        let Some(slot) = term.register() else { continue };
        let value = component(tuple, position);
        match row.get(slot) {
            Some(Some(existing)) => {
                // Same register used twice in one pattern.
                if existing != value {
                    consistent = false;
                    break;
                }
            }
            Some(None) => bound.push((slot, bind(row, slot, value.clone()))),
            None => {
                consistent = false;
                break;
            }
        }
    }

    let result = if consistent {
        next.exec(frame, perf, Op::Insert, row)
    } else {
        Ok(())
    };
    for (slot, previous) in bound.into_iter().rev() {
        restore(row, slot, previous);
    }
    result
}

impl Operator for Scan {
    fn exec(
        &mut self,
        frame: &mut Frame<'_>,
        parent: &Perf,
        op: Op,
        row: &mut Row,
    ) -> Result<(), ExecError> {
        if op != Op::Insert {
            return self.next.exec(frame, parent, op, row);
        }
        let pattern = self.pattern(row);
        let matches = frame.view().scan(self.scope, &pattern)?;
        let Self {
            terms, perf, next, ..
        } = self;
        let perf: &Perf = perf;
        perf.measure(parent, || {
            for tuple in &matches {
                emit(terms, next, frame, perf, tuple, row)?;
                if frame.is_cancelled() {
                    return Err(ExecError::Cancelled);
                }
            }
            Ok(())
        })
    }
}

/// Builds `scan {scope?, key, relation, value}`; `arms[0]` continues.
pub fn build_scan(b: &mut BlockBuilder<'_>, node: &Node) -> Result<Box<dyn Operator>, CompileError> {
    let scope = b.scope_argument(node)?;
    let terms = [
        b.term(node, "key")?,
        b.term(node, "relation")?,
        b.term(node, "value")?,
    ];
    Ok(Box::new(Scan {
        scope,
        terms,
        perf: b.perf(node),
        next: b.continuation(node, 0)?,
    }))
}
