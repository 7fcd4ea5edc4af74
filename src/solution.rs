//! Facts, multiplicity tables, and the read view blocks scan.
//!
//! A `Solution` holds two multiplicity tables per scope:
//! - `binds`: derived support, recomputed on every run and never persisted
//! - `commits`: durable deltas that are applied to bags once the run is stable
//!
//! A fact is present in the `View` iff its bag multiplicity plus both
//! overlays is positive.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::id::Uuid;
use crate::storage::Bag;
use crate::value::{key_of_bytes, Value};

/// Signed support count. Positive asserts, negative retracts.
pub type Multiplicity = i64;

/// An entity/attribute/value triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    /// Entity the fact is about.
    pub key: Value,
    /// Attribute (relation name).
    pub relation: Value,
    /// Attribute value.
    pub value: Value,
}

impl Tuple {
    /// Creates a tuple.
    pub fn new(key: impl Into<Value>, relation: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            relation: relation.into(),
            value: value.into(),
        }
    }

    /// Stable content hash of the whole tuple.
    #[must_use]
    pub fn key_of(&self) -> u64 {
        let mut buf = Vec::with_capacity(48);
        self.key.encode_into(&mut buf);
        self.relation.encode_into(&mut buf);
        self.value.encode_into(&mut buf);
        key_of_bytes(&buf)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {})", self.relation, self.key, self.value)
    }
}

/// A tuple inside a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fact {
    /// Bag the fact lives in.
    pub scope: Uuid,
    /// The fact itself.
    pub tuple: Tuple,
}

impl Fact {
    /// A fact in `scope`.
    #[must_use]
    pub const fn new(scope: Uuid, tuple: Tuple) -> Self {
        Self { scope, tuple }
    }

    /// Content-derived identity of the fact.
    #[must_use]
    pub fn key_of(&self) -> u64 {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(self.scope.as_bytes());
        self.tuple.key.encode_into(&mut buf);
        self.tuple.relation.encode_into(&mut buf);
        self.tuple.value.encode_into(&mut buf);
        key_of_bytes(&buf)
    }
}

/// How an insert operator contributes a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Derived support; disappears when no longer derived.
    Bind,
    /// Durable change applied to the target bag when the run is stable.
    Commit,
}

/// Scan pattern: each position is either bound to a value or open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pattern {
    /// Required key, or `None` to match any.
    pub key: Option<Value>,
    /// Required relation, or `None` to match any.
    pub relation: Option<Value>,
    /// Required value, or `None` to match any.
    pub value: Option<Value>,
}

impl Pattern {
    /// Matches every tuple.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            key: None,
            relation: None,
            value: None,
        }
    }

    /// Returns true if every bound position equals the tuple's.
    #[must_use]
    pub fn matches(&self, tuple: &Tuple) -> bool {
        self.key.as_ref().map_or(true, |k| *k == tuple.key)
            && self.relation.as_ref().map_or(true, |r| *r == tuple.relation)
            && self.value.as_ref().map_or(true, |v| *v == tuple.value)
    }
}

type Table = HashMap<Uuid, HashMap<Tuple, Multiplicity>>;

/// Multiplicity tables for one block, one cycle, or a merged run state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Solution {
    binds: Table,
    commits: Table,
}

impl Solution {
    /// An empty solution.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, mode: Mode) -> &Table {
        match mode {
            Mode::Bind => &self.binds,
            Mode::Commit => &self.commits,
        }
    }

    fn table_mut(&mut self, mode: Mode) -> &mut Table {
        match mode {
            Mode::Bind => &mut self.binds,
            Mode::Commit => &mut self.commits,
        }
    }

    /// Adds `delta` to the accumulator and returns the new multiplicity.
    /// Entries that reach zero are removed.
    pub fn add(&mut self, mode: Mode, scope: Uuid, tuple: &Tuple, delta: Multiplicity) -> Multiplicity {
        if delta == 0 {
            return self.get(mode, scope, tuple);
        }
        let relation = self.table_mut(mode).entry(scope).or_default();
        let slot = relation.entry(tuple.clone()).or_insert(0);
        *slot += delta;
        let next = *slot;
        if next == 0 {
            relation.remove(tuple);
            if relation.is_empty() {
                self.table_mut(mode).remove(&scope);
            }
        }
        next
    }

    /// Multiplicity of a tuple in one table; zero if absent.
    #[must_use]
    pub fn get(&self, mode: Mode, scope: Uuid, tuple: &Tuple) -> Multiplicity {
        self.table(mode)
            .get(&scope)
            .and_then(|r| r.get(tuple))
            .copied()
            .unwrap_or(0)
    }

    /// Combined bind and commit multiplicity for a tuple.
    #[must_use]
    pub fn overlay(&self, scope: Uuid, tuple: &Tuple) -> Multiplicity {
        self.get(Mode::Bind, scope, tuple) + self.get(Mode::Commit, scope, tuple)
    }

    /// Iterates `(scope, tuple, multiplicity)` for one mode.
    pub fn iter(&self, mode: Mode) -> impl Iterator<Item = (Uuid, &Tuple, Multiplicity)> + '_ {
        self.table(mode)
            .iter()
            .flat_map(|(scope, rel)| rel.iter().map(move |(t, m)| (*scope, t, *m)))
    }

    /// Every fact with a non-zero entry in either table.
    #[must_use]
    pub fn facts(&self) -> HashSet<Fact> {
        self.iter(Mode::Bind)
            .chain(self.iter(Mode::Commit))
            .map(|(scope, t, _)| Fact::new(scope, t.clone()))
            .collect()
    }

    /// A copy holding only the commit table.
    #[must_use]
    pub fn commits_only(&self) -> Self {
        Self {
            binds: Table::new(),
            commits: self.commits.clone(),
        }
    }

    /// Scopes with at least one commit entry.
    pub fn commit_scopes(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.commits.keys().copied()
    }

    /// Number of entries across both tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.binds.values().map(HashMap::len).sum::<usize>()
            + self.commits.values().map(HashMap::len).sum::<usize>()
    }

    /// Returns true if both tables are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.binds.is_empty() && self.commits.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.binds.clear();
        self.commits.clear();
    }

    /// Adds every entry of `other` scaled by `sign`.
    pub fn merge(&mut self, other: &Self, sign: Multiplicity) {
        for mode in [Mode::Bind, Mode::Commit] {
            for (scope, tuple, m) in other.iter(mode) {
                self.add(mode, scope, tuple, m * sign);
            }
        }
    }

    fn matching(&self, scope: Uuid, pattern: &Pattern, out: &mut HashMap<Tuple, Multiplicity>) {
        for table in [&self.binds, &self.commits] {
            if let Some(rel) = table.get(&scope) {
                for (t, m) in rel {
                    if pattern.matches(t) {
                        *out.entry(t.clone()).or_insert(0) += *m;
                    }
                }
            }
        }
    }
}

/// Output of every block in the current run, keyed by block index.
pub type BlockSolution = BTreeMap<usize, Solution>;

/// Read-only view over bag contents overlaid with a run's solution.
pub struct View<'a> {
    bags: &'a HashMap<Uuid, Arc<dyn Bag>>,
    solution: &'a Solution,
}

impl<'a> View<'a> {
    /// A view of `bags` overlaid with `solution`.
    #[must_use]
    pub fn new(bags: &'a HashMap<Uuid, Arc<dyn Bag>>, solution: &'a Solution) -> Self {
        Self { bags, solution }
    }

    fn bag(&self, scope: Uuid) -> Result<&Arc<dyn Bag>, ExecError> {
        self.bags.get(&scope).ok_or_else(|| ExecError::Storage {
            bag: scope,
            message: "bag is not persisted in this evaluation".to_string(),
        })
    }

    /// Total multiplicity of a fact.
    pub fn multiplicity(&self, scope: Uuid, tuple: &Tuple) -> Result<Multiplicity, ExecError> {
        let base = self
            .bag(scope)?
            .multiplicity(tuple)
            .map_err(|e| ExecError::Storage {
                bag: scope,
                message: e.to_string(),
            })?;
        Ok(base + self.solution.overlay(scope, tuple))
    }

    /// Whether the fact is present; read errors count as absent.
    #[must_use]
    pub fn is_present(&self, scope: Uuid, tuple: &Tuple) -> bool {
        self.multiplicity(scope, tuple).map_or(false, |m| m > 0)
    }

    /// Collects present tuples in `scope` matching `pattern`.
    ///
    /// Results are materialized so the bag lock is released before any
    /// downstream operator runs.
    pub fn scan(&self, scope: Uuid, pattern: &Pattern) -> Result<Vec<Tuple>, ExecError> {
        let mut totals: HashMap<Tuple, Multiplicity> = HashMap::new();
        self.bag(scope)?
            .scan(pattern, &mut |t, m| {
                *totals.entry(t.clone()).or_insert(0) += m;
            })
            .map_err(|e| ExecError::Storage {
                bag: scope,
                message: e.to_string(),
            })?;
        self.solution.matching(scope, pattern, &mut totals);
        let mut present: Vec<Tuple> = totals
            .into_iter()
            .filter_map(|(t, m)| (m > 0).then_some(t))
            .collect();
        present.sort_by_key(Tuple::key_of);
        Ok(present)
    }

    /// Every present fact in the given scopes.
    pub fn present_facts(&self, scopes: impl IntoIterator<Item = Uuid>) -> Result<HashSet<Fact>, ExecError> {
        let mut out = HashSet::new();
        for scope in scopes {
            for tuple in self.scan(scope, &Pattern::any())? {
                out.insert(Fact::new(scope, tuple));
            }
        }
        Ok(out)
    }
}

/// Direction of a presence change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The fact became present.
    Insert,
    /// The fact stopped being present.
    Retract,
}

/// A presence change observed between two stable states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Whether the fact appeared or disappeared.
    pub kind: ChangeKind,
    /// The fact whose presence changed.
    pub fact: Fact,
}

/// Changes produced by one run, delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Evaluation that produced the run.
    pub evaluation: Uuid,
    /// Run sequence number within the evaluation.
    pub run: u64,
    /// When the run became stable.
    pub at: DateTime<Utc>,
    /// Presence changes, retractions first.
    pub changes: Vec<Change>,
}

/// Presence diff between two fact sets, sorted for stable output.
#[must_use]
pub fn diff(before: &HashSet<Fact>, after: &HashSet<Fact>) -> Vec<Change> {
    let mut changes: Vec<Change> = after
        .difference(before)
        .map(|f| Change {
            kind: ChangeKind::Insert,
            fact: f.clone(),
        })
        .chain(before.difference(after).map(|f| Change {
            kind: ChangeKind::Retract,
            fact: f.clone(),
        }))
        .collect();
    changes.sort_by_key(|c| (c.kind == ChangeKind::Insert, c.fact.key_of()));
    changes
}
