//! Arithmetic and assignment.

use std::sync::Arc;

use crate::block::BlockBuilder;
use crate::error::{CompileError, ExecError};
use crate::exec::{bind, resolve, restore, Frame, Op, Operator, Row};
use crate::ir::{Node, Term};
use crate::perf::Perf;
use crate::value::Value;

/// Binary operation computed by [`Math`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// Text concatenation.
    Concat,
}

impl MathOp {
    /// Parses an operator symbol.
    #[must_use]
    pub fn parse(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "/" => Self::Div,
            "%" => Self::Rem,
            "concat" => Self::Concat,
            _ => return None,
        })
    }

    /// Applies the operation; `None` for type mismatches and division by zero.
    #[must_use]
    pub fn apply(self, left: &Value, right: &Value) -> Option<Value> {
        if self == Self::Concat {
            return match (left, right) {
                (Value::Text(a), Value::Text(b)) => Some(Value::from(format!("{a}{b}"))),
                _ => None,
            };
        }
        let (a, b) = (left.as_number()?, right.as_number()?);
        let n = match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div if b == 0.0 => return None,
            Self::Div => a / b,
            Self::Rem if b == 0.0 => return None,
            Self::Rem => a % b,
            Self::Concat => return None,
        };
        Some(Value::Number(n))
    }
}

/// Computes `out = left <op> right` and continues with `out` bound.
pub struct Math {
    op: MathOp,
    left: Term,
    right: Term,
    out: usize,
    perf: Arc<Perf>,
    next: Box<dyn Operator>,
}

impl Operator for Math {
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
            let result = resolve(&self.left, row)
                .zip(resolve(&self.right, row))
                .and_then(|(l, r)| self.op.apply(&l, &r));
            let Some(value) = result else {
                tracing::debug!(block = frame.block(), op = ?self.op, "math skipped row");
                return Ok(());
            };
            assign(&mut self.next, frame, &perf, row, self.out, value)
        })
    }
}

/// Copies `from` into register `out` and continues.
pub struct Move {
    from: Term,
    out: usize,
    perf: Arc<Perf>,
    next: Box<dyn Operator>,
}

impl Operator for Move {
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
            let Some(value) = resolve(&self.from, row) else {
                return Ok(());
            };
            assign(&mut self.next, frame, &perf, row, self.out, value)
        })
    }
}

// An already bound output acts as an equality check.
fn assign(
    next: &mut Box<dyn Operator>,
    frame: &mut Frame<'_>,
    perf: &Perf,
    row: &mut Row,
    out: usize,
    value: Value,
) -> Result<(), ExecError> {
    match row.get(out) {
        Some(Some(existing)) if *existing == value => next.exec(frame, perf, Op::Insert, row),
        Some(Some(_)) | None => Ok(()),
        Some(None) => {
            let previous = bind(row, out, value);
            let result = next.exec(frame, perf, Op::Insert, row);
            restore(row, out, previous);
            result
        }
    }
}

/// Builds `math {op, left, right, out}`; `arms[0]` continues.
pub fn build_math(b: &mut BlockBuilder<'_>, node: &Node) -> Result<Box<dyn Operator>, CompileError> {
    let symbol = b.symbol(node, "op")?;
    let op = MathOp::parse(&symbol)
        .ok_or_else(|| b.malformed(node, "op", format!("unknown operation '{symbol}'")))?;
    Ok(Box::new(Math {
        op,
        left: b.term(node, "left")?,
        right: b.term(node, "right")?,
        out: b.register(node, "out")?,
        perf: b.perf(node),
        next: b.continuation(node, 0)?,
    }))
}

/// Builds `move {from, out}`; `arms[0]` continues.
pub fn build_move(b: &mut BlockBuilder<'_>, node: &Node) -> Result<Box<dyn Operator>, CompileError> {
    Ok(Box::new(Move {
        from: b.term(node, "from")?,
        out: b.register(node, "out")?,
        perf: b.perf(node),
        next: b.continuation(node, 0)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{Capture, Harness};

    #[test]
    fn apply_numbers_and_text() {
        assert_eq!(
            MathOp::Sub.apply(&Value::from(2024), &Value::from(1990)),
            Some(Value::from(34))
        );
        assert_eq!(
            MathOp::Concat.apply(&Value::from("a"), &Value::from("b")),
            Some(Value::from("ab"))
        );
        assert_eq!(MathOp::Div.apply(&Value::from(1), &Value::from(0)), None);
        assert_eq!(MathOp::Add.apply(&Value::from("a"), &Value::from(1)), None);
    }

    #[test]
    fn math_binds_output_for_continuation_only() {
        let mut h = Harness::new();
        let (capture, rows, _) = Capture::new();
        let mut math = Math {
            op: MathOp::Sub,
            left: Term::constant(2024),
            right: Term::reg(0, "Y"),
            out: 1,
            perf: Arc::default(),
            next: Box::new(capture),
        };
        let mut row: Row = vec![Some(Value::from(1990)), None];
        h.run(&mut math, Op::Insert, &mut row).unwrap();
        assert_eq!(rows.lock().unwrap()[0][1], Some(Value::from(34)));
        assert_eq!(row[1], None);
    }

    #[test]
    fn bound_output_acts_as_check() {
        let mut h = Harness::new();
        let (capture, rows, _) = Capture::new();
        let mut mv = Move {
            from: Term::constant(1),
            out: 0,
            perf: Arc::default(),
            next: Box::new(capture),
        };
        h.run(&mut mv, Op::Insert, &mut vec![Some(Value::from(2))]).unwrap();
        h.run(&mut mv, Op::Insert, &mut vec![Some(Value::from(1))]).unwrap();
        assert_eq!(rows.lock().unwrap().len(), 1);
    }

    #[test]
    fn type_mismatch_skips_row() {
        let mut h = Harness::new();
        let (capture, rows, _) = Capture::new();
        let mut math = Math {
            op: MathOp::Mul,
            left: Term::constant("x"),
            right: Term::constant(2),
            out: 0,
            perf: Arc::default(),
            next: Box::new(capture),
        };
        h.run(&mut math, Op::Insert, &mut vec![None]).unwrap();
        assert!(rows.lock().unwrap().is_empty());
    }
}
