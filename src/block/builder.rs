//! Turning node trees into operator chains.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::block::Block;
use crate::error::CompileError;
use crate::exec::{
    build_aggregate, build_filter, build_insert, build_math, build_move, build_not, build_scan,
    build_union, Operator, Row, Sink, Terminal, Trace,
};
use crate::id::Uuid;
use crate::ir::{validate_block, Argument, Compiled, Node, Term};
use crate::perf::{Counters, Perf};
use crate::region::Region;
use crate::value::Value;

/// Scope name used when a node carries no `scope` argument.
pub const DEFAULT_SCOPE: &str = "session";

/// Constructor for one node kind.
pub type BuildFn = fn(&mut BlockBuilder<'_>, &Node) -> Result<Box<dyn Operator>, CompileError>;

/// Node kind to constructor.
#[derive(Clone)]
pub struct BuilderTable {
    builders: HashMap<String, BuildFn>,
}

impl std::fmt::Debug for BuilderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}

impl BuilderTable {
    /// A table with no kinds registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registers `build` for `kind`, returning the constructor it replaces.
    pub fn register(&mut self, kind: &str, build: BuildFn) -> Option<BuildFn> {
        self.builders.insert(kind.to_string(), build)
    }

    /// Builder registered for `kind`.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<BuildFn> {
        self.builders.get(kind).copied()
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for BuilderTable {
    fn default() -> Self {
        builders_table()
    }
}

/// The built-in operator kinds.
#[must_use]
pub fn builders_table() -> BuilderTable {
    let mut table = BuilderTable::empty();
    table.register("scan", build_scan);
    table.register("filter", build_filter);
    table.register("math", build_math);
    table.register("move", build_move);
    table.register("not", build_not);
    table.register("union", build_union);
    table.register("aggregate", build_aggregate);
    table.register("insert", build_insert);
    table.register("terminal", build_terminal);
    table
}

// An explicit end of chain; inside a sub-chain it feeds the owning operator.
fn build_terminal(b: &mut BlockBuilder<'_>, node: &Node) -> Result<Box<dyn Operator>, CompileError> {
    b.continuation(node, 0)
}

fn node_label(id: &Value) -> String {
    id.as_text().map_or_else(|| id.to_string(), str::to_string)
}

/// Build context for one block.
///
/// Node constructors pull typed arguments out of their node through this
/// builder, which also records variable names, registers counters, and
/// knows where the current chain ends.
pub struct BlockBuilder<'e> {
    block: String,
    regs: usize,
    tracing: bool,
    table: &'e BuilderTable,
    scopes: &'e HashMap<String, Uuid>,
    counters: &'e mut Counters,
    nmap: BTreeMap<String, usize>,
    sinks: Vec<Sender<Row>>,
}

impl<'e> BlockBuilder<'e> {
    /// Creates a builder for `compiled`.
    pub fn new(
        compiled: &Compiled,
        table: &'e BuilderTable,
        scopes: &'e HashMap<String, Uuid>,
        counters: &'e mut Counters,
    ) -> Self {
        Self {
            block: compiled.name.clone(),
            regs: compiled.regs,
            tracing: compiled.tracing,
            table,
            scopes,
            counters,
            nmap: BTreeMap::new(),
            sinks: Vec::new(),
        }
    }

    /// Validates and builds `compiled` into block `id`.
    ///
    /// Counters registered for the block are removed again if building
    /// fails part way.
    ///
    /// # Errors
    /// The first `CompileError` raised by validation or any node constructor.
    pub fn build(
        compiled: &Compiled,
        id: usize,
        table: &'e BuilderTable,
        scopes: &'e HashMap<String, Uuid>,
        counters: &'e mut Counters,
        fence: bool,
    ) -> Result<Block, CompileError> {
        validate_block(compiled)?;
        let mut builder = Self::new(compiled, table, scopes, counters);
        let head = match builder.build_node(&compiled.head) {
            Ok(head) => head,
            Err(e) => {
                builder.counters.remove_prefix(&format!("{}/", compiled.name));
                return Err(e);
            }
        };
        let perf = builder.counters.register(compiled.name.clone());
        Ok(Block {
            id,
            name: compiled.name.clone(),
            regs: compiled.regs,
            head,
            nmap: builder.nmap,
            region: Region::new(format!("block:{}", compiled.name), fence),
            event: compiled.event,
            perf,
            closed: false,
        })
    }

    /// Builds one node through the table.
    ///
    /// # Errors
    /// `UnknownNodeType` for unregistered kinds, or the constructor's error.
    pub fn build_node(&mut self, node: &Node) -> Result<Box<dyn Operator>, CompileError> {
        let build = self
            .table
            .get(&node.kind)
            .ok_or_else(|| CompileError::UnknownNodeType {
                kind: node.kind.clone(),
                block: self.block.clone(),
            })?;
        let op = build(self, node)?;
        if self.tracing {
            return Ok(Box::new(Trace::new(&self.block, &node_label(&node.id), op)));
        }
        Ok(op)
    }

    /// The chain following `node`: `arms[arm]` if present, otherwise the
    /// end of the enclosing sub-chain or of the block.
    ///
    /// # Errors
    /// Whatever building the arm raises.
    pub fn continuation(&mut self, node: &Node, arm: usize) -> Result<Box<dyn Operator>, CompileError> {
        if let Some(next) = node.arms.get(arm) {
            return self.build_node(next);
        }
        Ok(match self.sinks.last() {
            Some(rows) => Box::new(Sink::new(rows.clone())),
            None => Box::new(Terminal),
        })
    }

    /// Builds `node` as a sub-chain whose end sends its rows to `rows`.
    ///
    /// # Errors
    /// Whatever building the sub-chain raises.
    pub fn subchain(&mut self, node: &Node, rows: Sender<Row>) -> Result<Box<dyn Operator>, CompileError> {
        self.sinks.push(rows);
        let built = self.build_node(node);
        self.sinks.pop();
        built
    }

    /// Name of the block being built.
    #[must_use]
    pub fn block_name(&self) -> &str {
        &self.block
    }

    /// Register count of the block being built.
    #[must_use]
    pub const fn regs(&self) -> usize {
        self.regs
    }

    /// Counter for `node`, registered as `"<block>/<node id>"`.
    pub fn perf(&mut self, node: &Node) -> Arc<Perf> {
        self.counters
            .register(format!("{}/{}", self.block, node_label(&node.id)))
    }

    /// A `MalformedArgument` error for `node`.
    #[must_use]
    pub fn malformed(&self, node: &Node, argument: &str, reason: String) -> CompileError {
        CompileError::MalformedArgument {
            kind: node.kind.clone(),
            argument: argument.to_string(),
            reason,
        }
    }

    fn record(&mut self, term: &Term) {
        if let Term::Register {
            index,
            name: Some(name),
        } = term
        {
            self.nmap.entry(name.clone()).or_insert(*index);
        }
    }

    /// An optional term argument.
    ///
    /// # Errors
    /// `MalformedArgument` if the argument has another shape.
    pub fn optional_term(&mut self, node: &Node, name: &str) -> Result<Option<Term>, CompileError> {
        match node.arguments.get(name) {
            None => Ok(None),
            Some(Argument::Term(term)) => {
                self.record(term);
                Ok(Some(term.clone()))
            }
            Some(other) => Err(self.malformed(node, name, format!("expected term, got {}", other.shape()))),
        }
    }

    /// A required term argument.
    ///
    /// # Errors
    /// `MalformedArgument` if missing or of another shape.
    pub fn term(&mut self, node: &Node, name: &str) -> Result<Term, CompileError> {
        self.optional_term(node, name)?
            .ok_or_else(|| self.malformed(node, name, "missing".to_string()))
    }

    /// A term-list argument; missing means empty. A single term is accepted
    /// as a list of one.
    ///
    /// # Errors
    /// `MalformedArgument` for symbol or flag arguments.
    pub fn terms(&mut self, node: &Node, name: &str) -> Result<Vec<Term>, CompileError> {
        let terms = match node.arguments.get(name) {
            None => Vec::new(),
            Some(Argument::Term(term)) => vec![term.clone()],
            Some(Argument::Terms(terms)) => terms.clone(),
            Some(other) => {
                return Err(self.malformed(node, name, format!("expected terms, got {}", other.shape())))
            }
        };
        terms.iter().for_each(|t| self.record(t));
        Ok(terms)
    }

    /// A required output register.
    ///
    /// # Errors
    /// `MalformedArgument` if missing or a constant.
    pub fn register(&mut self, node: &Node, name: &str) -> Result<usize, CompileError> {
        let term = self.term(node, name)?;
        term.register()
            .ok_or_else(|| self.malformed(node, name, "expected a register".to_string()))
    }

    /// An optional symbol argument.
    ///
    /// # Errors
    /// `MalformedArgument` if the argument has another shape.
    pub fn optional_symbol(&self, node: &Node, name: &str) -> Result<Option<String>, CompileError> {
        match node.arguments.get(name) {
            None => Ok(None),
            Some(Argument::Symbol(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.malformed(node, name, format!("expected symbol, got {}", other.shape()))),
        }
    }

    /// A required symbol argument.
    ///
    /// # Errors
    /// `MalformedArgument` if missing or of another shape.
    pub fn symbol(&self, node: &Node, name: &str) -> Result<String, CompileError> {
        self.optional_symbol(node, name)?
            .ok_or_else(|| self.malformed(node, name, "missing".to_string()))
    }

    /// Resolves the node's `scope` symbol, defaulting to [`DEFAULT_SCOPE`].
    ///
    /// # Errors
    /// `UnknownScope` if the name is not bound in this evaluation.
    pub fn scope_argument(&self, node: &Node) -> Result<Uuid, CompileError> {
        let name = self
            .optional_symbol(node, "scope")?
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        self.scopes
            .get(&name)
            .copied()
            .ok_or(CompileError::UnknownScope { scope: name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::Harness;
    use crate::exec::{Frame, Op};
    use crate::solution::Tuple;

    fn scopes(h: &Harness) -> HashMap<String, Uuid> {
        HashMap::from([(DEFAULT_SCOPE.to_string(), h.scope)])
    }

    fn build(h: &Harness, compiled: &Compiled, counters: &mut Counters) -> Result<Block, CompileError> {
        let table = builders_table();
        let scopes = scopes(h);
        BlockBuilder::build(compiled, 0, &table, &scopes, counters, false)
    }

    fn run(h: &mut Harness, block: &mut Block) {
        let mut frame = Frame {
            region: &mut h.region,
            bags: &h.bags,
            solution: &h.solution,
            previous: None,
            reconciler: &mut h.reconciler,
            cancel: &h.cancel,
            block: 0,
        };
        block.run(&mut frame).unwrap();
    }

    fn bind_out(id: i64, key: Term, value: Term) -> Node {
        Node::new(id, "insert")
            .symbol("mode", "bind")
            .term("key", key)
            .term("relation", Term::constant("out"))
            .term("value", value)
    }

    fn person_scan(id: impl Into<Value>) -> Node {
        Node::new(id, "scan")
            .term("key", Term::reg(0, "P"))
            .term("relation", Term::constant("person"))
            .term("value", Term::constant(true))
    }

    #[test]
    fn unknown_kind_names_the_block() {
        let h = Harness::new();
        let mut counters = Counters::default();
        let compiled = Compiled::new("ghosts", Node::new(1, "teleport"), 0);
        let err = build(&h, &compiled, &mut counters).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnknownNodeType { ref kind, ref block } if kind == "teleport" && block == "ghosts"
        ));
    }

    #[test]
    fn malformed_argument_clears_partial_counters() {
        let h = Harness::new();
        let mut counters = Counters::default();
        let head = person_scan(1).arm(Node::new(2, "filter").symbol("op", "~~"));
        let compiled = Compiled::new("broken", head, 1);
        let err = build(&h, &compiled, &mut counters).unwrap_err();
        assert!(matches!(err, CompileError::MalformedArgument { ref argument, .. } if argument == "op"));
        assert!(counters.snapshot().is_empty());
    }

    #[test]
    fn unknown_scope_is_rejected() {
        let h = Harness::new();
        let mut counters = Counters::default();
        let compiled = Compiled::new("b", person_scan(1).symbol("scope", "nowhere"), 1);
        let err = build(&h, &compiled, &mut counters).unwrap_err();
        assert!(matches!(err, CompileError::UnknownScope { ref scope } if scope == "nowhere"));
    }

    #[test]
    fn records_variable_names_and_counters() {
        let h = Harness::new();
        let mut counters = Counters::default();
        let head = person_scan("scan-people").arm(bind_out(2, Term::reg(0, "P"), Term::constant(1)));
        let compiled = Compiled::new("people", head, 1);
        let block = build(&h, &compiled, &mut counters).unwrap();
        assert_eq!(block.nmap().get("P"), Some(&0));
        assert!(counters.get("people").is_some());
        assert!(counters.get("people/scan-people").is_some());
        assert!(counters.get("people/2").is_some());
    }

    #[test]
    fn negation_filters_rows_with_witnesses() {
        let mut h = Harness::new();
        h.seed(Tuple::new("alice", "person", true));
        h.seed(Tuple::new("bob", "person", true));
        h.seed(Tuple::new("bob", "banned", true));

        let banned = Node::new(3, "scan")
            .term("key", Term::reg(0, "P"))
            .term("relation", Term::constant("banned"))
            .term("value", Term::constant(true));
        let head = person_scan(1).arm(
            Node::new(2, "not")
                .arm(banned)
                .arm(bind_out(4, Term::reg(0, "P"), Term::constant(true))),
        );
        let mut counters = Counters::default();
        let mut block = build(&h, &Compiled::new("allowed", head, 1), &mut counters).unwrap();
        run(&mut h, &mut block);

        let out = h.output();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.key, Value::from("alice"));
    }

    #[test]
    fn union_forwards_every_branch() {
        let mut h = Harness::new();
        h.seed(Tuple::new("alice", "likes", "tea"));
        h.seed(Tuple::new("alice", "drinks", "coffee"));

        let branch = |id: i64, relation: &str| {
            Node::new(id, "scan")
                .term("key", Term::reg(0, "P"))
                .term("relation", Term::constant(relation))
                .term("value", Term::reg(1, "D"))
        };
        let head = Node::new(1, "union")
            .arm(branch(2, "likes"))
            .arm(branch(3, "drinks"))
            .arm(bind_out(4, Term::reg(0, "P"), Term::reg(1, "D")));
        let mut counters = Counters::default();
        let mut block = build(&h, &Compiled::new("drinks", head, 2), &mut counters).unwrap();
        run(&mut h, &mut block);

        let values: Vec<Value> = h.output().into_iter().map(|(t, _)| t.value).collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&Value::from("tea")));
        assert!(values.contains(&Value::from("coffee")));
    }

    #[test]
    fn aggregate_inside_block_emits_on_flush() {
        let mut h = Harness::new();
        h.seed(Tuple::new("alice", "person", true));
        h.seed(Tuple::new("bob", "person", true));

        let head = person_scan(1).arm(
            Node::new(2, "aggregate")
                .symbol("op", "count")
                .term("out", Term::reg(1, "N"))
                .arm(bind_out(3, Term::constant("people"), Term::reg(1, "N"))),
        );
        let mut counters = Counters::default();
        let mut block = build(&h, &Compiled::new("count", head, 2), &mut counters).unwrap();
        run(&mut h, &mut block);

        let out = h.output();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.value, Value::from(2));
        assert_eq!(counters.get("count/2").map(|p| p.trig()), Some(1));
    }

    #[test]
    fn close_is_idempotent() {
        let mut h = Harness::new();
        let mut counters = Counters::default();
        let mut block = build(&h, &Compiled::new("b", person_scan(1), 1), &mut counters).unwrap();
        for _ in 0..2 {
            let mut frame = Frame {
                region: &mut h.region,
                bags: &h.bags,
                solution: &h.solution,
                previous: None,
                reconciler: &mut h.reconciler,
                cancel: &h.cancel,
                block: 0,
            };
            block.close(&mut frame).unwrap();
        }
        assert!(block.is_closed());
        assert!(block.region().is_released());
    }

    #[test]
    fn tracing_wraps_every_node() {
        let h = Harness::new();
        let mut counters = Counters::default();
        let compiled = Compiled::new("t", person_scan(1), 1).traced();
        assert!(build(&h, &compiled, &mut counters).is_ok());
    }
}
