//! The insert operator: the only operator with side effects.

use std::sync::Arc;

use crate::block::BlockBuilder;
use crate::error::{CompileError, ExecError};
use crate::exec::{resolve, Frame, Op, Operator, Row};
use crate::id::Uuid;
use crate::ir::{Node, Term};
use crate::perf::Perf;
use crate::solution::{Mode, Multiplicity, Tuple};

/// Hands one fact per row to the reconciler.
pub struct Insert {
    mode: Mode,
    scope: Uuid,
    terms: [Term; 3],
    multiplicity: Multiplicity,
    perf: Arc<Perf>,
    next: Box<dyn Operator>,
}

impl Operator for Insert {
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
        let perf = Arc::clone(&self.perf);
        perf.measure(parent, || {
            let [key, relation, value] = &self.terms;
            let (Some(key), Some(relation), Some(value)) =
                (resolve(key, row), resolve(relation, row), resolve(value, row))
            else {
                tracing::debug!(block = frame.block(), "insert skipped row with unbound term");
                return Ok(());
            };
            frame.insert(
                self.scope,
                Tuple {
                    key,
                    relation,
                    value,
                },
                self.multiplicity,
                self.mode,
            )?;
            self.next.exec(frame, &perf, Op::Insert, row)
        })
    }
}

/// Builds `insert {mode, scope?, key, relation, value, sign?}`; an optional
/// `arms[0]` continues.
pub fn build_insert(b: &mut BlockBuilder<'_>, node: &Node) -> Result<Box<dyn Operator>, CompileError> {
    let mode = match b.symbol(node, "mode")?.as_str() {
        "bind" => Mode::Bind,
        "commit" => Mode::Commit,
        other => return Err(b.malformed(node, "mode", format!("expected bind or commit, got '{other}'"))),
    };
    let multiplicity = match b.optional_symbol(node, "sign")?.as_deref() {
        None | Some("add") => 1,
        Some("remove") => -1,
        Some(other) => return Err(b.malformed(node, "sign", format!("expected add or remove, got '{other}'"))),
    };
    Ok(Box::new(Insert {
        mode,
        scope: b.scope_argument(node)?,
        terms: [
            b.term(node, "key")?,
            b.term(node, "relation")?,
            b.term(node, "value")?,
        ],
        multiplicity,
        perf: b.perf(node),
        next: b.continuation(node, 0)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{Capture, Harness};
    use crate::value::Value;

    fn insert(scope: Uuid, mode: Mode, multiplicity: Multiplicity, next: Box<dyn Operator>) -> Insert {
        Insert {
            mode,
            scope,
            terms: [Term::reg(0, "P"), Term::constant("age"), Term::reg(1, "A")],
            multiplicity,
            perf: Arc::default(),
            next,
        }
    }

    #[test]
    fn inserts_and_continues() {
        let mut h = Harness::new();
        let (capture, rows, _) = Capture::new();
        let mut op = insert(h.scope, Mode::Bind, 1, Box::new(capture));
        let mut row: Row = vec![Some(Value::from("alice")), Some(Value::from(34))];
        h.run(&mut op, Op::Insert, &mut row).unwrap();
        h.run(&mut op, Op::Insert, &mut row).unwrap();
        assert_eq!(h.output(), vec![(Tuple::new("alice", "age", 34), 2)]);
        assert_eq!(rows.lock().unwrap().len(), 2);
    }

    #[test]
    fn unbound_term_skips_row() {
        let mut h = Harness::new();
        let mut op = insert(h.scope, Mode::Bind, 1, Box::new(crate::exec::Terminal));
        h.run(&mut op, Op::Insert, &mut vec![Some(Value::from("alice")), None]).unwrap();
        assert!(h.output().is_empty());
    }

    #[test]
    fn remove_sign_retracts() {
        let mut h = Harness::new();
        let mut op = insert(h.scope, Mode::Bind, -1, Box::new(crate::exec::Terminal));
        h.run(&mut op, Op::Insert, &mut vec![Some(Value::from("alice")), Some(Value::from(34))])
            .unwrap();
        assert_eq!(h.output(), vec![(Tuple::new("alice", "age", 34), -1)]);
    }

    #[test]
    fn commit_mode_stages_into_bag() {
        let mut h = Harness::new();
        let mut op = insert(h.scope, Mode::Commit, 1, Box::new(crate::exec::Terminal));
        h.run(&mut op, Op::Insert, &mut vec![Some(Value::from("alice")), Some(Value::from(34))])
            .unwrap();
        let touched: Vec<Uuid> = h.reconciler.touched().collect();
        assert_eq!(touched, vec![h.scope]);
    }
}
