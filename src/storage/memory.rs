//! In-memory bag.
//!
//! Thread-safe and shareable between evaluations. It is intended for
//! embedded usage, tests, and as the reference implementation of `Bag`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::id::Uuid;
use crate::solution::{Multiplicity, Pattern, Tuple};
use crate::storage::traits::{Bag, BagHandler, StorageError, TxId};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Committed contents plus in-flight transactions.
#[derive(Debug, Default)]
pub(crate) struct BagState {
    pub(crate) base: HashMap<Tuple, Multiplicity>,
    pub(crate) staged: HashMap<TxId, HashMap<Tuple, Multiplicity>>,
    pub(crate) applied: HashSet<TxId>,
}

impl BagState {
    pub(crate) fn apply(&mut self, tuple: &Tuple, delta: Multiplicity) {
        if delta == 0 {
            return;
        }
        let slot = self.base.entry(tuple.clone()).or_insert(0);
        *slot += delta;
        if *slot == 0 {
            self.base.remove(tuple);
        }
    }

    pub(crate) fn stage(&mut self, tx: TxId, tuple: &Tuple, net: Multiplicity) {
        let pending = self.staged.entry(tx).or_default();
        if net == 0 {
            pending.remove(tuple);
        } else {
            pending.insert(tuple.clone(), net);
        }
    }

    /// Staged deltas for `tx` in a deterministic order, or `None` if the
    /// transaction was already applied.
    pub(crate) fn take_staged(&mut self, tx: TxId) -> Option<Vec<(Tuple, Multiplicity)>> {
        if self.applied.contains(&tx) {
            self.staged.remove(&tx);
            return None;
        }
        let mut deltas: Vec<(Tuple, Multiplicity)> =
            self.staged.remove(&tx).unwrap_or_default().into_iter().collect();
        deltas.sort_by_key(|(t, _)| t.key_of());
        Some(deltas)
    }

    pub(crate) fn apply_commit(&mut self, tx: TxId, deltas: &[(Tuple, Multiplicity)]) {
        for (tuple, delta) in deltas {
            self.apply(tuple, *delta);
        }
        self.applied.insert(tx);
    }

    pub(crate) fn scan(&self, pattern: &Pattern, handler: &mut BagHandler<'_>) {
        for (tuple, m) in &self.base {
            if pattern.matches(tuple) {
                handler(tuple, *m);
            }
        }
    }
}

/// Thread-safe in-memory bag.
#[derive(Debug)]
pub struct MemoryBag {
    uuid: Uuid,
    state: RwLock<BagState>,
}

impl MemoryBag {
    /// Create a new empty bag.
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            state: RwLock::new(BagState::default()),
        }
    }

    /// Create a bag with a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::generate())
    }

    /// Writes directly to the committed contents, bypassing transactions.
    pub fn seed(&self, tuple: &Tuple, multiplicity: Multiplicity) -> Result<(), StorageError> {
        self.state
            .write()
            .map_err(|_| lock_err("bag.seed"))?
            .apply(tuple, multiplicity);
        Ok(())
    }

    /// Number of transactions with staged but uncommitted deltas.
    pub fn pending_transactions(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("bag.pending"))?.staged.len())
    }
}

impl Bag for MemoryBag {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn scan(&self, pattern: &Pattern, handler: &mut BagHandler<'_>) -> Result<(), StorageError> {
        self.state
            .read()
            .map_err(|_| lock_err("bag.scan"))?
            .scan(pattern, handler);
        Ok(())
    }

    fn multiplicity(&self, tuple: &Tuple) -> Result<Multiplicity, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("bag.multiplicity"))?;
        Ok(state.base.get(tuple).copied().unwrap_or(0))
    }

    fn stage(&self, tx: TxId, tuple: &Tuple, net: Multiplicity) -> Result<(), StorageError> {
        self.state
            .write()
            .map_err(|_| lock_err("bag.stage"))?
            .stage(tx, tuple, net);
        Ok(())
    }

    fn prepare(&self, _tx: TxId) -> Result<(), StorageError> {
        self.state.read().map_err(|_| lock_err("bag.prepare"))?;
        Ok(())
    }

    fn commit(&self, tx: TxId) -> Result<Vec<(Tuple, Multiplicity)>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("bag.commit"))?;
        let Some(deltas) = state.take_staged(tx) else {
            return Ok(Vec::new());
        };
        state.apply_commit(tx, &deltas);
        Ok(deltas)
    }

    fn abort(&self, tx: TxId) -> Result<(), StorageError> {
        self.state
            .write()
            .map_err(|_| lock_err("bag.abort"))?
            .staged
            .remove(&tx);
        Ok(())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("bag.len"))?.base.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn person(name: &str) -> Tuple {
        Tuple::new(name, "person", true)
    }

    #[test]
    fn stage_is_invisible_until_commit() {
        let bag = MemoryBag::generate();
        let tx = TxId::new(Uuid::generate(), 1);
        bag.stage(tx, &person("alice"), 1).unwrap();
        assert_eq!(bag.multiplicity(&person("alice")).unwrap(), 0);

        let applied = bag.commit(tx).unwrap();
        assert_eq!(applied, vec![(person("alice"), 1)]);
        assert_eq!(bag.multiplicity(&person("alice")).unwrap(), 1);
    }

    #[test]
    fn stage_has_set_semantics() {
        let bag = MemoryBag::generate();
        let tx = TxId::new(Uuid::generate(), 1);
        bag.stage(tx, &person("alice"), 2).unwrap();
        bag.stage(tx, &person("alice"), 2).unwrap();
        bag.commit(tx).unwrap();
        assert_eq!(bag.multiplicity(&person("alice")).unwrap(), 2);
    }

    #[test]
    fn recommit_is_a_noop() {
        let bag = MemoryBag::generate();
        let tx = TxId::new(Uuid::generate(), 1);
        bag.stage(tx, &person("alice"), 1).unwrap();
        bag.commit(tx).unwrap();
        bag.stage(tx, &person("alice"), 1).unwrap();
        assert!(bag.commit(tx).unwrap().is_empty());
        assert_eq!(bag.multiplicity(&person("alice")).unwrap(), 1);
        assert_eq!(bag.pending_transactions().unwrap(), 0);
    }

    #[test]
    fn abort_discards_staged() {
        let bag = MemoryBag::generate();
        let tx = TxId::new(Uuid::generate(), 1);
        bag.stage(tx, &person("alice"), 1).unwrap();
        bag.abort(tx).unwrap();
        assert!(bag.commit(tx).unwrap().is_empty());
        assert!(bag.is_empty().unwrap());
    }

    #[test]
    fn retraction_to_zero_removes_tuple() {
        let bag = MemoryBag::generate();
        bag.seed(&person("alice"), 1).unwrap();
        let tx = TxId::new(Uuid::generate(), 1);
        bag.stage(tx, &person("alice"), -1).unwrap();
        bag.commit(tx).unwrap();
        assert_eq!(bag.len().unwrap(), 0);
    }

    #[test]
    fn scan_filters_by_pattern() {
        let bag = MemoryBag::generate();
        bag.seed(&person("alice"), 1).unwrap();
        bag.seed(&Tuple::new("alice", "birth_year", 1990), 1).unwrap();
        let pattern = Pattern {
            relation: Some("person".into()),
            ..Pattern::any()
        };
        let mut seen = Vec::new();
        bag.scan(&pattern, &mut |t, m| seen.push((t.clone(), m))).unwrap();
        assert_eq!(seen, vec![(person("alice"), 1)]);
    }

    #[test]
    fn concurrent_commits_do_not_lose_updates() {
        let bag = Arc::new(MemoryBag::generate());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bag = Arc::clone(&bag);
            handles.push(thread::spawn(move || {
                let ev = Uuid::generate();
                for run in 0..50 {
                    let tx = TxId::new(ev, run);
                    bag.stage(tx, &Tuple::new("counter", "hits", 0), 1).unwrap();
                    bag.commit(tx).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bag.multiplicity(&Tuple::new("counter", "hits", 0)).unwrap(), 400);
    }
}
