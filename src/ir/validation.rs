//! Program validation.
//!
//! Programs arrive as JSON from an external compiler, so every block is
//! checked before it is built. A register index at or beyond the block's
//! register count would otherwise be an out-of-bounds read at run time.

use std::collections::HashSet;

use crate::error::CompileError;
use crate::ir::node::{Compiled, Node};

/// Conservative upper bound for register files.
pub const MAX_REGISTERS: usize = 4096;

/// Conservative upper bound for tree depth; building recurses per arm.
pub const MAX_DEPTH: usize = 512;

/// Highest register index referenced anywhere in the tree.
#[must_use]
pub fn max_register(node: &Node) -> Option<usize> {
    let mut max = None;
    node.walk(&mut |n| {
        for arg in n.arguments.values() {
            for index in arg.terms().filter_map(|t| t.register()) {
                max = Some(max.map_or(index, |m: usize| m.max(index)));
            }
        }
    });
    max
}

fn depth(node: &Node) -> usize {
    1 + node.arms.iter().map(depth).max().unwrap_or(0)
}

/// Checks one block.
///
/// # Errors
/// - `RegisterOutOfBounds` if any term references a register `>= regs`
/// - `InvalidProgram` for empty names, oversized register files or trees
pub fn validate_block(block: &Compiled) -> Result<(), CompileError> {
    if block.name.trim().is_empty() {
        return Err(CompileError::InvalidProgram {
            reason: "block name must not be empty".to_string(),
        });
    }
    if block.regs > MAX_REGISTERS {
        return Err(CompileError::InvalidProgram {
            reason: format!(
                "block '{}' declares {} registers (max {MAX_REGISTERS})",
                block.name, block.regs
            ),
        });
    }
    if depth(&block.head) > MAX_DEPTH {
        return Err(CompileError::InvalidProgram {
            reason: format!("block '{}' is nested deeper than {MAX_DEPTH}", block.name),
        });
    }
    if let Some(index) = max_register(&block.head) {
        if index >= block.regs {
            return Err(CompileError::RegisterOutOfBounds {
                block: block.name.clone(),
                index,
                regs: block.regs,
            });
        }
    }
    Ok(())
}

/// Checks a whole program: every block, and that block names are unique.
///
/// # Errors
/// The first failing block's error.
pub fn validate_program(blocks: &[Compiled]) -> Result<(), CompileError> {
    let mut names = HashSet::new();
    for block in blocks {
        validate_block(block)?;
        if !names.insert(block.name.as_str()) {
            return Err(CompileError::InvalidProgram {
                reason: format!("duplicate block name '{}'", block.name),
            });
        }
    }
    Ok(())
}
