//! Error types for blockflow.
//!
//! All errors are strongly typed using thiserror. Build-time failures are
//! `CompileError`s, failures while a run is in progress are `ExecError`s, and
//! everything is folded into `EngineError` at the public API.

use thiserror::Error;

use crate::id::Uuid;
use crate::storage::StorageError;

/// Errors raised while turning a node tree into an operator chain.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A node type no operator is registered for.
    #[error("Unknown node type '{kind}' in block '{block}'")]
    UnknownNodeType {
        /// Node type name.
        kind: String,
        /// Block name.
        block: String,
    },

    /// A node argument is missing or has the wrong shape.
    #[error("Malformed argument '{argument}' on '{kind}' node: {reason}")]
    MalformedArgument {
        /// Node type name.
        kind: String,
        /// Argument name.
        argument: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A scope name that is not configured.
    #[error("Unknown scope '{scope}'")]
    UnknownScope {
        /// Scope name.
        scope: String,
    },

    /// A register index past the block's register count.
    #[error("Register {index} out of bounds in block '{block}' (regs: {regs})")]
    RegisterOutOfBounds {
        /// Block name.
        block: String,
        /// Offending register index.
        index: usize,
        /// Registers the block declares.
        regs: usize,
    },

    /// The program as a whole is rejected.
    #[error("Invalid program: {reason}")]
    InvalidProgram {
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors raised while a run is in progress.
#[derive(Debug, Error)]
pub enum ExecError {
    /// A bag failed to stage or commit.
    #[error("Storage error on bag {bag}: {message}")]
    Storage {
        /// Bag identifier.
        bag: Uuid,
        /// Underlying error message.
        message: String,
    },

    /// The run was cancelled before reaching a fixed point.
    #[error("Run cancelled")]
    Cancelled,

    /// The cycle limit was reached without a fixed point.
    #[error("No fixed point after {cycles} cycles")]
    NonConvergence {
        /// Cycles executed.
        cycles: usize,
    },

    /// The evaluation has been closed.
    #[error("Evaluation is closed")]
    Closed,

    /// The operation is not allowed in the current state.
    #[error("Cannot {operation} while evaluation is {state}")]
    InvalidState {
        /// Operation attempted.
        operation: String,
        /// Current state name.
        state: String,
    },

    /// A blocking wait ran out of time.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// Elapsed wait in milliseconds.
        duration_ms: u64,
    },

    /// The other end of a channel is gone.
    #[error("Channel disconnected: {path}")]
    Disconnected {
        /// Name of the channel or queue.
        path: String,
    },

    /// The bounded queue has no room.
    #[error("Queue full on {path} (capacity {capacity})")]
    QueueFull {
        /// Name of the channel or queue.
        path: String,
        /// Configured capacity.
        capacity: usize,
    },
}

impl ExecError {
    /// The bag this error originated from, if any.
    #[must_use]
    pub const fn bag(&self) -> Option<Uuid> {
        match self {
            Self::Storage { bag, .. } => Some(*bag),
            _ => None,
        }
    }
}

/// Errors raised while scanning injected event buffers.
#[derive(Debug, Error)]
pub enum EventError {
    /// A line that does not parse as an event.
    #[error("Malformed event on line {line}: {reason}")]
    Malformed {
        /// One-based line number.
        line: usize,
        /// Why it was rejected.
        reason: String,
    },

    /// An event names a scope that is not configured.
    #[error("Event references unknown scope '{scope}'")]
    UnknownScope {
        /// Scope name.
        scope: String,
    },

    /// An event whose multiplicity is zero.
    #[error("Event on line {line} has zero multiplicity")]
    ZeroMultiplicity {
        /// One-based line number.
        line: usize,
    },

    /// The event queue cannot take the whole buffer.
    #[error("Event queue full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity.
        capacity: usize,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds an out-of-range or inconsistent value.
    #[error("Invalid configuration field '{field}': {reason}")]
    Invalid {
        /// Configuration field name.
        field: String,
        /// Why the value is rejected.
        reason: String,
    },

    /// A scope points at a bag the evaluation was not given.
    #[error("Scope '{scope}' maps to bag {bag} which is not persisted")]
    UnboundScope {
        /// Scope name.
        scope: String,
        /// Bag identifier.
        bag: Uuid,
    },
}

/// Top-level error type for blockflow.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Build-time failure.
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Failure during a run.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecError),

    /// Rejected event buffer.
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// Rejected configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage failure outside a run.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invariant violation inside the engine.
    #[error("Internal error: {message}")]
    Internal {
        /// Underlying error message.
        message: String,
    },
}

impl EngineError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a compile error.
    #[must_use]
    pub const fn is_compile(&self) -> bool {
        matches!(self, Self::Compile(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an event error.
    #[must_use]
    pub const fn is_event(&self) -> bool {
        matches!(self, Self::Event(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// The bag this error originated from, if any.
    #[must_use]
    pub const fn bag(&self) -> Option<Uuid> {
        match self {
            Self::Execution(e) => e.bag(),
            _ => None,
        }
    }

    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(
                e,
                ExecError::Storage { .. } | ExecError::Timeout { .. } | ExecError::QueueFull { .. }
            ),
            Self::Event(e) => matches!(e, EventError::QueueFull { .. }),
            Self::Compile(_) | Self::Config(_) | Self::Storage(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for blockflow operations.
pub type EngineResult<T> = Result<T, EngineError>;
