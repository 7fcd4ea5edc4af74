//! Rule-tree nodes and compiled block descriptors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// An operand: a register slot or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    /// Register `index`, optionally carrying the source variable name.
    Register {
        /// Slot in the block's register file.
        index: usize,
        /// Source variable name, for diagnostics.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A literal value.
    Constant(Value),
}

impl Term {
    /// Register term with a variable name.
    #[must_use]
    pub fn reg(index: usize, name: &str) -> Self {
        Self::Register {
            index,
            name: Some(name.to_string()),
        }
    }

    /// Literal term.
    #[must_use]
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    /// Register index, if this term is a register.
    #[must_use]
    pub const fn register(&self) -> Option<usize> {
        match self {
            Self::Register { index, .. } => Some(*index),
            Self::Constant(_) => None,
        }
    }
}

/// A named node parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Argument {
    /// A single register or constant.
    Term(Term),
    /// An ordered list of terms, e.g. a fact tuple.
    Terms(Vec<Term>),
    /// A bare name such as a scope, relation or operator.
    Symbol(String),
    /// A boolean switch.
    Flag(bool),
}

impl Argument {
    /// Short name of the argument shape, for error messages.
    #[must_use]
    pub const fn shape(&self) -> &'static str {
        match self {
            Self::Term(_) => "term",
            Self::Terms(_) => "terms",
            Self::Symbol(_) => "symbol",
            Self::Flag(_) => "flag",
        }
    }

    /// Every term this argument mentions.
    pub fn terms(&self) -> impl Iterator<Item = &Term> {
        let slice: &[Term] = match self {
            Self::Term(t) => std::slice::from_ref(t),
            Self::Terms(ts) => ts,
            Self::Symbol(_) | Self::Flag(_) => &[],
        };
        slice.iter()
    }
}

/// A vertex of a compiled rule tree.
///
/// `arms` order is significant: for linear operators `arms[0]` is the
/// continuation, and composite operators document their own layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier, unique within its block; names the node's counter.
    pub id: Value,
    /// Builder key, for example `scan` or `insert`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Continuations and sub-chains.
    #[serde(default)]
    pub arms: Vec<Node>,
    /// Named operator arguments.
    #[serde(default)]
    pub arguments: BTreeMap<String, Argument>,
    /// Free-form labels for diagnostics.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub display: BTreeMap<String, String>,
}

impl Node {
    /// Creates a node with no arms or arguments.
    #[must_use]
    pub fn new(id: impl Into<Value>, kind: &str) -> Self {
        Self {
            id: id.into(),
            kind: kind.to_string(),
            arms: Vec::new(),
            arguments: BTreeMap::new(),
            display: BTreeMap::new(),
        }
    }

    /// Appends an arm.
    #[must_use]
    pub fn arm(mut self, node: Node) -> Self {
        self.arms.push(node);
        self
    }

    /// Sets a term argument.
    #[must_use]
    pub fn term(mut self, name: &str, term: Term) -> Self {
        self.arguments.insert(name.to_string(), Argument::Term(term));
        self
    }

    /// Sets a term-list argument.
    #[must_use]
    pub fn terms(mut self, name: &str, terms: Vec<Term>) -> Self {
        self.arguments.insert(name.to_string(), Argument::Terms(terms));
        self
    }

    /// Sets a symbol argument.
    #[must_use]
    pub fn symbol(mut self, name: &str, symbol: &str) -> Self {
        self.arguments
            .insert(name.to_string(), Argument::Symbol(symbol.to_string()));
        self
    }

    /// Sets a flag argument.
    #[must_use]
    pub fn flag(mut self, name: &str, flag: bool) -> Self {
        self.arguments.insert(name.to_string(), Argument::Flag(flag));
        self
    }

    /// Adds debug metadata.
    #[must_use]
    pub fn display(mut self, key: &str, value: &str) -> Self {
        self.display.insert(key.to_string(), value.to_string());
        self
    }

    /// Pre-order walk over this node and all descendants.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Node)) {
        visit(self);
        for arm in &self.arms {
            arm.walk(visit);
        }
    }

    /// Number of nodes in this tree.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut n = 0;
        self.walk(&mut |_| n += 1);
        n
    }
}

/// A named, pre-linked rule block: a root node plus its register count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compiled {
    /// Block name, unique within an evaluation.
    pub name: String,
    /// Root of the node tree.
    pub head: Node,
    /// Register row width.
    pub regs: usize,
    /// Emits a trace event per row and node.
    #[serde(default)]
    pub tracing: bool,
    /// Runs only in the first cycle of runs triggered by injected events.
    #[serde(default)]
    pub event: bool,
}

impl Compiled {
    /// A regular block.
    #[must_use]
    pub fn new(name: &str, head: Node, regs: usize) -> Self {
        Self {
            name: name.to_string(),
            head,
            regs,
            tracing: false,
            event: false,
        }
    }

    /// Marks this block as event-triggered.
    #[must_use]
    pub fn on_event(mut self) -> Self {
        self.event = true;
        self
    }

    /// Enables per-row tracing for this block.
    #[must_use]
    pub fn traced(mut self) -> Self {
        self.tracing = true;
        self
    }
}
