//! # blockflow - incremental fixed-point execution for rule blocks
//!
//! blockflow runs compiled, datalog-style rule blocks over a versioned fact
//! store until nothing changes, then commits the run's durable changes and
//! streams the resulting insertions and retractions to subscribers.
//!
//! ## Core Concepts
//!
//! - **Bag**: a durable multiset of `(key, relation, value)` tuples
//! - **Block**: a compiled rule, an operator chain over a register row
//! - **Evaluation**: a set of blocks bound to bags through named scopes
//! - **Run**: cycles of block passes until presence stops changing
//!
//! ## Usage
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use blockflow::{build_evaluation, Bag, Compiled, MemoryBag, Node, RunOutcome, RuntimeConfig, Term, Uuid};
//!
//! let bag = Arc::new(MemoryBag::generate());
//! let scopes = HashMap::from([("session".to_string(), bag.uuid())]);
//! let mut eval = build_evaluation(
//!     RuntimeConfig::default(),
//!     scopes,
//!     [bag.clone() as Arc<dyn Bag>],
//!     |outcome: &RunOutcome| println!("{} changes", outcome.changes.len()),
//!     |message: &str, _bag: Option<Uuid>| eprintln!("{message}"),
//! )?;
//!
//! // adult(P) :- age(P, A), A >= 18.
//! let head = Node::new(1, "scan")
//!     .term("key", Term::reg(0, "P"))
//!     .term("relation", Term::constant("age"))
//!     .term("value", Term::reg(1, "A"))
//!     .arm(
//!         Node::new(2, "filter")
//!             .symbol("op", ">=")
//!             .term("left", Term::reg(1, "A"))
//!             .term("right", Term::constant(18))
//!             .arm(
//!                 Node::new(3, "insert")
//!                     .symbol("mode", "bind")
//!                     .term("key", Term::reg(0, "P"))
//!                     .term("relation", Term::constant("adult"))
//!                     .term("value", Term::constant(true)),
//!             ),
//!     );
//! eval.build(&Compiled::new("adults", head, 2))?;
//!
//! let outcome = eval
//!     .inject_event("{\"scope\":\"session\",\"key\":\"alice\",\"relation\":\"age\",\"value\":34}\n", true)?
//!     .expect("sync injection runs");
//! assert_eq!(outcome.changes.len(), 2);
//! # Ok::<(), blockflow::EngineError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod block;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod exec;
pub mod id;
pub mod ir;
pub mod perf;
pub mod reconcile;
pub mod region;
pub mod runtime;
pub mod solution;
pub mod storage;
pub mod stream;
pub mod value;

// Re-export primary types at crate root for convenience
pub use block::{builders_table, Block, BlockBuilder, BuildFn, BuilderTable, DEFAULT_SCOPE};
pub use config::RuntimeConfig;
pub use error::{CompileError, ConfigError, EngineError, EngineResult, EventError, ExecError};
pub use evaluation::{
    build_evaluation, Completion, ErrorHandler, EventFact, EventScanner, Evaluation, EvaluationState,
    RunOutcome, EVENT_INPUT,
};
pub use exec::{Frame, Op, Operator, Row};
pub use id::Uuid;
pub use ir::{load_program, to_json_pretty, Argument, Compiled, Node, Term};
pub use perf::{Perf, PerfSnapshot};
pub use reconcile::Reconciler;
pub use runtime::{Pending, Session};
pub use solution::{
    Change, ChangeBatch, ChangeKind, Fact, Mode, Multiplicity, Pattern, Solution, Tuple, View,
};
pub use storage::{Bag, MemoryBag, StorageError, TxId};
pub use stream::ChangeStream;
pub use value::Value;

#[cfg(feature = "persistent")]
pub use storage::{filebag_init, FileBag, PersistentConfig};
