//! Row tracing for blocks compiled with tracing on.

use crate::error::ExecError;
use crate::exec::{Frame, Op, Operator, Row};
use crate::perf::Perf;

/// Emits a `trace` event for every row entering the wrapped operator.
pub struct Trace {
    block: String,
    node: String,
    inner: Box<dyn Operator>,
}

impl Trace {
    /// Wraps `inner`, labelling its events with `block` and `node`.
    #[must_use]
    pub fn new(block: &str, node: &str, inner: Box<dyn Operator>) -> Self {
        Self {
            block: block.to_string(),
            node: node.to_string(),
            inner,
        }
    }
}

impl Operator for Trace {
    fn exec(
        &mut self,
        frame: &mut Frame<'_>,
        parent: &Perf,
        op: Op,
        row: &mut Row,
    ) -> Result<(), ExecError> {
        tracing::trace!(block = %self.block, node = %self.node, ?op, ?row, "row");
        self.inner.exec(frame, parent, op, row)
    }
}
