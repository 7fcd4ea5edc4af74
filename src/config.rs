//! Runtime configuration.
//!
//! Everything an evaluation needs from its environment is passed in through
//! [`RuntimeConfig`]; there is no process-wide state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for one evaluation and its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory relative file bags are resolved against.
    pub path_root: PathBuf,
    /// Poison released rows instead of recycling them.
    pub fence: bool,
    /// Abort a run that has not reached a fixed point after this many cycles.
    pub max_cycles: Option<usize>,
    /// Maximum number of injected facts waiting for the next run.
    pub event_queue_capacity: usize,
    /// Batches buffered per change subscriber before batches are dropped.
    pub stream_capacity: usize,
    /// Requests buffered in front of a session worker.
    pub session_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            path_root: PathBuf::from("."),
            fence: false,
            max_cycles: None,
            event_queue_capacity: 64 * 1024,
            stream_capacity: 1024,
            session_queue_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first offending field.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let capacities = [
            ("event_queue_capacity", self.event_queue_capacity),
            ("stream_capacity", self.stream_capacity),
            ("session_queue_capacity", self.session_queue_capacity),
        ];
        for (field, value) in capacities {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.max_cycles == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_cycles".to_string(),
                reason: "must allow at least one cycle".to_string(),
            });
        }
        Ok(self)
    }

    /// Resolves `path` against `path_root` unless it is absolute.
    #[must_use]
    pub fn resolve(&self, path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        if path.is_absolute() {
            path
        } else {
            self.path_root.join(path)
        }
    }
}
