//! Comparisons and pattern matches.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::block::BlockBuilder;
use crate::error::{CompileError, ExecError};
use crate::exec::{resolve, Frame, Op, Operator, Row};
use crate::ir::{Node, Term};
use crate::perf::Perf;
use crate::value::Value;

/// Comparison performed by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Left text matches the right regular expression.
    Matches,
}

impl Compare {
    /// Parses an operator symbol.
    #[must_use]
    pub fn parse(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "=" | "==" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "matches" => Self::Matches,
            _ => return None,
        })
    }
}

/// Passes rows for which `left <op> right` holds.
pub struct Filter {
    op: Compare,
    left: Term,
    right: Term,
    regexes: HashMap<String, Regex>,
    perf: Arc<Perf>,
    next: Box<dyn Operator>,
}

impl Filter {
    fn regex(&mut self, pattern: &str) -> Option<&Regex> {
        if !self.regexes.contains_key(pattern) {
            match Regex::new(pattern) {
                Ok(re) => {
                    self.regexes.insert(pattern.to_string(), re);
                }
                Err(e) => {
                    tracing::debug!(pattern, error = %e, "skipping row with invalid regex");
                    return None;
                }
            }
        }
        self.regexes.get(pattern)
    }

    fn holds(&mut self, left: &Value, right: &Value) -> bool {
        let ordering = |want: fn(Ordering) -> bool| left.compare(right).map_or(false, want);
        match self.op {
            Compare::Eq => left == right,
            Compare::Ne => left != right,
            Compare::Lt => ordering(Ordering::is_lt),
            Compare::Le => ordering(Ordering::is_le),
            Compare::Gt => ordering(Ordering::is_gt),
            Compare::Ge => ordering(Ordering::is_ge),
            Compare::Matches => match (left.as_text(), right.as_text()) {
                (Some(text), Some(pattern)) => {
                    self.regex(pattern).map_or(false, |re| re.is_match(text))
                }
                _ => false,
            },
        }
    }
}

impl Operator for Filter {
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
            let (Some(left), Some(right)) = (resolve(&self.left, row), resolve(&self.right, row))
            else {
                tracing::debug!(block = frame.block(), "filter on unbound register");
                return Ok(());
            };
            if self.holds(&left, &right) {
                self.next.exec(frame, &perf, Op::Insert, row)
            } else {
                Ok(())
            }
        })
    }
}

/// Builds `filter {op, left, right}`; `arms[0]` continues.
pub fn build_filter(b: &mut BlockBuilder<'_>, node: &Node) -> Result<Box<dyn Operator>, CompileError> {
    let symbol = b.symbol(node, "op")?;
    let op = Compare::parse(&symbol).ok_or_else(|| b.malformed(node, "op", format!("unknown comparison '{symbol}'")))?;
    let left = b.term(node, "left")?;
    let right = b.term(node, "right")?;

    let mut regexes = HashMap::new();
    if op == Compare::Matches {
        if let Term::Constant(value) = &right {
            let pattern = value
                .as_text()
                .ok_or_else(|| b.malformed(node, "right", "pattern must be text".to_string()))?;
            let re = Regex::new(pattern)
                .map_err(|e| b.malformed(node, "right", format!("invalid regex: {e}")))?;
            regexes.insert(pattern.to_string(), re);
        }
    }

    Ok(Box::new(Filter {
        op,
        left,
        right,
        regexes,
        perf: b.perf(node),
        next: b.continuation(node, 0)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{Capture, Harness};

    fn passes(op: Compare, left: Value, right: Value) -> bool {
        let mut h = Harness::new();
        let (capture, rows, _) = Capture::new();
        let mut filter = Filter {
            op,
            left: Term::reg(0, "L"),
            right: Term::constant(right),
            regexes: HashMap::new(),
            perf: Arc::default(),
            next: Box::new(capture),
        };
        h.run(&mut filter, Op::Insert, &mut vec![Some(left)]).unwrap();
        let n = rows.lock().unwrap().len();
        n == 1
    }

    #[test]
    fn numeric_comparisons() {
        assert!(passes(Compare::Lt, Value::from(1), Value::from(2)));
        assert!(passes(Compare::Ge, Value::from(2), Value::from(2)));
        assert!(!passes(Compare::Gt, Value::from(1), Value::from(2)));
        assert!(passes(Compare::Eq, Value::from(2.0), Value::from(2)));
    }

    #[test]
    fn mixed_types_never_order() {
        assert!(!passes(Compare::Lt, Value::from(1), Value::from("a")));
        assert!(passes(Compare::Ne, Value::from(1), Value::from("a")));
    }

    #[test]
    fn regex_matches_text() {
        assert!(passes(Compare::Matches, Value::from("alice"), Value::from("^al")));
        assert!(!passes(Compare::Matches, Value::from("bob"), Value::from("^al")));
        assert!(!passes(Compare::Matches, Value::from(3), Value::from("3")));
    }

    #[test]
    fn invalid_runtime_regex_skips_row() {
        assert!(!passes(Compare::Matches, Value::from("x"), Value::from("(")));
    }

    #[test]
    fn unbound_operand_skips_row() {
        let mut h = Harness::new();
        let (capture, rows, _) = Capture::new();
        let mut filter = Filter {
            op: Compare::Eq,
            left: Term::reg(0, "L"),
            right: Term::constant(1),
            regexes: HashMap::new(),
            perf: Arc::default(),
            next: Box::new(capture),
        };
        h.run(&mut filter, Op::Insert, &mut vec![None]).unwrap();
        assert!(rows.lock().unwrap().is_empty());
    }

    #[test]
    fn parse_symbols() {
        assert_eq!(Compare::parse("<="), Some(Compare::Le));
        assert_eq!(Compare::parse("~"), None);
    }
}
