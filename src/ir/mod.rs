//! Intermediate representation of compiled rule programs.
//!
//! A program is a list of [`Compiled`] blocks, each a tree of [`Node`]s
//! produced by an external rule compiler. The IR is serializable so
//! programs can be loaded from disk, logged, and inspected.

mod node;
mod serialization;
mod validation;

pub use node::{Argument, Compiled, Node, Term};
pub use serialization::{from_json, load_program, to_json_pretty};
pub use validation::{max_register, validate_block, validate_program, MAX_DEPTH, MAX_REGISTERS};
