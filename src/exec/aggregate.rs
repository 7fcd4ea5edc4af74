//! Grouped aggregation.
//!
//! Rows are buffered per group on `Insert`. `Flush` emits one row per group
//! with the group registers and the output register bound, then clears the
//! buffer; every block pass therefore aggregates from scratch.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::block::BlockBuilder;
use crate::error::{CompileError, ExecError};
use crate::exec::{resolve, Frame, Op, Operator, Row};
use crate::ir::{Node, Term};
use crate::perf::Perf;
use crate::value::Value;

/// Fold applied per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    /// Rows in the group.
    Count,
    /// Numeric sum of `value`.
    Sum,
    /// Smallest `value`.
    Min,
    /// Largest `value`.
    Max,
}

impl AggregateOp {
    /// Parses an aggregate name.
    #[must_use]
    pub fn parse(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "count" => Self::Count,
            "sum" => Self::Sum,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        })
    }

    fn fold(self, acc: Option<Value>, next: Option<Value>) -> Option<Value> {
        match self {
            Self::Count => {
                let n = acc.and_then(|v| v.as_number()).unwrap_or(0.0);
                Some(Value::Number(n + 1.0))
            }
            Self::Sum => {
                let add = next?.as_number()?;
                let n = acc.and_then(|v| v.as_number()).unwrap_or(0.0);
                Some(Value::Number(n + add))
            }
            Self::Min | Self::Max => {
                let next = next?;
                let Some(acc) = acc else { return Some(next) };
                let keep_next = match acc.compare(&next)? {
                    Ordering::Greater => self == Self::Min,
                    Ordering::Less => self == Self::Max,
                    Ordering::Equal => false,
                };
                Some(if keep_next { next } else { acc })
            }
        }
    }
}

/// Buffers rows per group and emits one row per group on flush.
pub struct Aggregate {
    op: AggregateOp,
    group: Vec<Term>,
    value: Option<Term>,
    out: usize,
    regs: usize,
    groups: HashMap<Vec<Value>, Value>,
    perf: Arc<Perf>,
    next: Box<dyn Operator>,
}

impl Aggregate {
    fn accumulate(&mut self, row: &Row) {
        let key: Option<Vec<Value>> = self.group.iter().map(|t| resolve(t, row)).collect();
        let Some(key) = key else {
            tracing::debug!("aggregate skipped row with unbound group");
            return;
        };
        let input = self.value.as_ref().and_then(|t| resolve(t, row));
        if self.op != AggregateOp::Count && input.is_none() {
            return;
        }
        let acc = self.groups.get(&key).cloned();
        match self.op.fold(acc, input) {
            Some(v) => {
                self.groups.insert(key, v);
            }
            None => tracing::debug!(op = ?self.op, "aggregate skipped row with incompatible value"),
        }
    }

    fn emit(&mut self, frame: &mut Frame<'_>, perf: &Perf) -> Result<(), ExecError> {
        let mut groups: Vec<(Vec<Value>, Value)> = self.groups.drain().collect();
        groups.sort_by_key(|(key, _)| {
            key.iter()
                .fold(0u64, |h, v| h.rotate_left(7) ^ v.key_of())
        });
        for (key, result) in groups {
            let mut out = frame.region().row(self.regs);
            for (term, value) in self.group.iter().zip(key) {
                if let Some(slot) = term.register() {
                    if let Some(s) = out.get_mut(slot) {
                        *s = Some(value);
                    }
                }
            }
            if let Some(s) = out.get_mut(self.out) {
                *s = Some(result);
            }
            let sent = self.next.exec(frame, perf, Op::Insert, &mut out);
            frame.region().release(out);
            sent?;
        }
        Ok(())
    }
}

impl Operator for Aggregate {
    fn exec(
        &mut self,
        frame: &mut Frame<'_>,
        parent: &Perf,
        op: Op,
        row: &mut Row,
    ) -> Result<(), ExecError> {
        let perf = Arc::clone(&self.perf);
        match op {
            Op::Insert => {
                perf.measure(parent, || self.accumulate(row));
                Ok(())
            }
            Op::Flush => {
                if !self.groups.is_empty() {
                    perf.trigger();
                }
                self.emit(frame, parent)?;
                self.next.exec(frame, parent, Op::Flush, row)
            }
            Op::Close => {
                self.groups.clear();
                self.next.exec(frame, parent, Op::Close, row)
            }
        }
    }
}

/// Builds `aggregate {op, group, value?, out}`; `arms[0]` continues.
pub fn build_aggregate(
    b: &mut BlockBuilder<'_>,
    node: &Node,
) -> Result<Box<dyn Operator>, CompileError> {
    let symbol = b.symbol(node, "op")?;
    let op = AggregateOp::parse(&symbol)
        .ok_or_else(|| b.malformed(node, "op", format!("unknown aggregate '{symbol}'")))?;
    let value = b.optional_term(node, "value")?;
    if op != AggregateOp::Count && value.is_none() {
        return Err(b.malformed(node, "value", format!("'{symbol}' needs a value")));
    }
    Ok(Box::new(Aggregate {
        op,
        group: b.terms(node, "group")?,
        value,
        out: b.register(node, "out")?,
        regs: b.regs(),
        groups: HashMap::new(),
        perf: b.perf(node),
        next: b.continuation(node, 0)?,
    }))
}
