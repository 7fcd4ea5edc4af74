//! Program loading.
//!
//! Programs are JSON arrays of compiled blocks. Serde provides the format;
//! this module applies load-time options, validates, and keeps formatting
//! stable.

use std::fmt::Write as _;

use crate::error::{CompileError, EngineResult};
use crate::ir::node::Compiled;
use crate::ir::validation::{max_register, validate_program};

/// Serialize a program to pretty JSON.
pub fn to_json_pretty(blocks: &[Compiled]) -> EngineResult<String> {
    serde_json::to_string_pretty(blocks).map_err(|e| {
        CompileError::InvalidProgram {
            reason: format!("serialize program: {e}"),
        }
        .into()
    })
}

/// Deserialize a program without validating it.
pub fn from_json(s: &str) -> EngineResult<Vec<Compiled>> {
    serde_json::from_str::<Vec<Compiled>>(s).map_err(|e| {
        CompileError::InvalidProgram {
            reason: format!("deserialize program: {e}"),
        }
        .into()
    })
}

/// Loads a program and describes it.
///
/// With `traced` set every block is traced. Returns the blocks and a
/// human-readable summary, one line per block.
///
/// # Errors
/// `CompileError::InvalidProgram` on malformed JSON, or the first
/// validation failure.
pub fn load_program(buffer: &str, traced: bool) -> EngineResult<(Vec<Compiled>, String)> {
    let mut blocks = from_json(buffer)?;
    if traced {
        blocks.iter_mut().for_each(|b| b.tracing = true);
    }
    validate_program(&blocks).map_err(|e| {
        tracing::error!(error = %e, "program rejected");
        e
    })?;

    let mut description = String::new();
    for block in &blocks {
        let _ = writeln!(
            description,
            "{}{}: {} nodes, {} registers (max used: {}){}",
            if block.event { "event " } else { "" },
            block.name,
            block.head.size(),
            block.regs,
            max_register(&block.head).map_or_else(|| "none".to_string(), |r| r.to_string()),
            if block.tracing { ", traced" } else { "" },
        );
    }
    tracing::debug!(blocks = blocks.len(), "loaded program");
    Ok((blocks, description))
}
