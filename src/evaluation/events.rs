//! Event buffer scanning.
//!
//! Injected buffers hold newline-delimited JSON records:
//!
//! ```text
//! {"scope": "session", "key": "alice", "relation": "birth_year", "value": 1990}
//! {"scope": "session", "key": "alice", "relation": "person", "value": true, "multiplicity": -1}
//! ```
//!
//! `scope` is a scope name or the hex form of a persisted bag. Plain JSON
//! numbers, strings and booleans map to values; the tagged `Value` form is
//! accepted as well. A buffer that ends mid-line keeps the partial line until
//! a later buffer completes it. A buffer with a bad line is rejected whole.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::error::EventError;
use crate::id::Uuid;
use crate::solution::{Multiplicity, Tuple};
use crate::value::Value;

/// One injected fact waiting for the next run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFact {
    /// Bag the fact is committed to.
    pub scope: Uuid,
    /// The injected fact.
    pub tuple: Tuple,
    /// Signed change; negative retracts.
    pub multiplicity: Multiplicity,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EventValue {
    Tagged(Value),
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<EventValue> for Value {
    fn from(v: EventValue) -> Self {
        match v {
            EventValue::Tagged(v) => v,
            EventValue::Bool(b) => Self::Boolean(b),
            EventValue::Number(n) => Self::Number(n),
            EventValue::Text(s) => Self::from(s),
        }
    }
}

fn default_multiplicity() -> Multiplicity {
    1
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EventRecord {
    scope: String,
    key: EventValue,
    relation: EventValue,
    value: EventValue,
    #[serde(default = "default_multiplicity")]
    multiplicity: Multiplicity,
}

/// Facts parsed from a buffer, not yet consumed by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scanned {
    facts: Vec<EventFact>,
    pending: String,
    lines: usize,
}

impl Scanned {
    /// Number of parsed facts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Whether no complete line held a fact.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

/// Incremental parser for event buffers.
#[derive(Debug, Default)]
pub struct EventScanner {
    scopes: HashMap<String, Uuid>,
    persisted: HashSet<Uuid>,
    pending: String,
    line: usize,
}

impl EventScanner {
    /// A scanner resolving names through `scopes` and hex ids through `persisted`.
    #[must_use]
    pub fn new(scopes: HashMap<String, Uuid>, persisted: HashSet<Uuid>) -> Self {
        Self {
            scopes,
            persisted,
            pending: String::new(),
            line: 0,
        }
    }

    /// Bytes of an incomplete trailing line held back from earlier buffers.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Complete lines seen so far, blank ones included.
    #[must_use]
    pub const fn lines(&self) -> usize {
        self.line
    }

    /// Parses every complete line of `buffer` (after any held-back prefix)
    /// without consuming anything.
    ///
    /// # Errors
    /// `Malformed`, `UnknownScope` or `ZeroMultiplicity`; the scanner is
    /// left as it was.
    pub fn parse(&self, buffer: &str) -> Result<Scanned, EventError> {
        let mut joined = String::with_capacity(self.pending.len() + buffer.len());
        joined.push_str(&self.pending);
        joined.push_str(buffer);
        let Some(end) = joined.rfind('\n') else {
            return Ok(Scanned {
                facts: Vec::new(),
                pending: joined,
                lines: 0,
            });
        };
        let pending = joined[end + 1..].to_string();

        let mut facts = Vec::new();
        let mut lines = 0;
        for raw in joined[..end].split('\n') {
            lines += 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            facts.push(self.parse_line(raw, self.line + lines)?);
        }
        Ok(Scanned { facts, pending, lines })
    }

    /// Consumes a parse result, keeping its trailing partial line.
    pub fn accept(&mut self, scanned: Scanned) -> Vec<EventFact> {
        self.pending = scanned.pending;
        self.line += scanned.lines;
        scanned.facts
    }

    /// Parses and consumes `buffer` in one step.
    ///
    /// # Errors
    /// As [`EventScanner::parse`]; nothing is consumed on error.
    pub fn scan(&mut self, buffer: &str) -> Result<Vec<EventFact>, EventError> {
        let scanned = self.parse(buffer)?;
        Ok(self.accept(scanned))
    }

    fn parse_line(&self, raw: &str, line: usize) -> Result<EventFact, EventError> {
        let record: EventRecord = serde_json::from_str(raw).map_err(|e| EventError::Malformed {
            line,
            reason: e.to_string(),
        })?;
        if record.multiplicity == 0 {
            return Err(EventError::ZeroMultiplicity { line });
        }
        Ok(EventFact {
            scope: self.resolve_scope(&record.scope)?,
            tuple: Tuple {
                key: record.key.into(),
                relation: record.relation.into(),
                value: record.value.into(),
            },
            multiplicity: record.multiplicity,
        })
    }

    fn resolve_scope(&self, scope: &str) -> Result<Uuid, EventError> {
        if let Some(uuid) = self.scopes.get(scope) {
            return Ok(*uuid);
        }
        Uuid::parse(scope)
            .ok()
            .filter(|uuid| self.persisted.contains(uuid))
            .ok_or_else(|| EventError::UnknownScope {
                scope: scope.to_string(),
            })
    }
}
