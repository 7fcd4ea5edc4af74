//! Error propagation tests.
//!
//! A bag that fails writes for one relation must reach the error handler
//! with the bag's UUID, abort the run, and close the evaluation exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use blockflow::{
    build_evaluation, Bag, Compiled, EngineError, EvaluationState, ExecError, MemoryBag, Multiplicity,
    Node, Pattern, RunOutcome, RuntimeConfig, StorageError, Term, Tuple, TxId, Uuid,
};
use blockflow::storage::BagHandler;

/// Delegates to a memory bag but refuses to stage one relation, and
/// optionally refuses every commit at the prepare step.
struct FailingBag {
    inner: MemoryBag,
    poisoned: &'static str,
    refuse_prepare: bool,
}

impl Bag for FailingBag {
    fn uuid(&self) -> Uuid {
        self.inner.uuid()
    }

    fn scan(&self, pattern: &Pattern, handler: &mut BagHandler<'_>) -> Result<(), StorageError> {
        self.inner.scan(pattern, handler)
    }

    fn multiplicity(&self, tuple: &Tuple) -> Result<Multiplicity, StorageError> {
        self.inner.multiplicity(tuple)
    }

    fn stage(&self, tx: TxId, tuple: &Tuple, net: Multiplicity) -> Result<(), StorageError> {
        if tuple.relation.as_text() == Some(self.poisoned) {
            return Err(StorageError::BackendError("disk full".to_string()));
        }
        self.inner.stage(tx, tuple, net)
    }

    fn prepare(&self, tx: TxId) -> Result<(), StorageError> {
        if self.refuse_prepare {
            return Err(StorageError::BackendError("log unavailable".to_string()));
        }
        self.inner.prepare(tx)
    }

    fn commit(&self, tx: TxId) -> Result<Vec<(Tuple, Multiplicity)>, StorageError> {
        self.inner.commit(tx)
    }

    fn abort(&self, tx: TxId) -> Result<(), StorageError> {
        self.inner.abort(tx)
    }

    fn len(&self) -> Result<usize, StorageError> {
        self.inner.len()
    }
}

type Reports = Arc<Mutex<Vec<(String, Option<Uuid>)>>>;

fn commit_block(from: &str, to: &str) -> Compiled {
    let head = Node::new(1, "scan")
        .term("key", Term::reg(0, "K"))
        .term("relation", Term::constant(from))
        .term("value", Term::reg(1, "V"))
        .arm(
            Node::new(2, "insert")
                .symbol("mode", "commit")
                .term("key", Term::reg(0, "K"))
                .term("relation", Term::constant(to))
                .term("value", Term::reg(1, "V")),
        );
    Compiled::new(&format!("{from}_to_{to}"), head, 2)
}

#[test]
fn test_bag_failure_reaches_handler_and_closes_once() {
    let inner = MemoryBag::generate();
    inner.seed(&Tuple::new("k", "a", 1), 1).unwrap();
    let bag = Arc::new(FailingBag {
        inner,
        poisoned: "x",
        refuse_prepare: false,
    });
    let uuid = bag.uuid();

    let reports: Reports = Arc::default();
    let seen = Arc::clone(&reports);
    let completions = Arc::new(Mutex::new(0));
    let done = Arc::clone(&completions);
    let mut eval = build_evaluation(
        RuntimeConfig::default(),
        HashMap::from([("session".to_string(), uuid)]),
        [Arc::clone(&bag) as Arc<dyn Bag>],
        move |_: &RunOutcome| *done.lock().unwrap() += 1,
        move |message: &str, bag: Option<Uuid>| seen.lock().unwrap().push((message.to_string(), bag)),
    )
    .unwrap();

    let closes = Arc::new(Mutex::new(0));
    let closed = Arc::clone(&closes);
    eval.on_terminal(move || *closed.lock().unwrap() += 1);

    // The first block stages fine; the second one hits the poisoned relation.
    eval.build(&commit_block("a", "b")).unwrap();
    eval.build(&commit_block("a", "x")).unwrap();

    let err = eval.execute().unwrap_err();
    assert_eq!(err.bag(), Some(uuid));
    assert!(matches!(err, EngineError::Execution(ExecError::Storage { .. })));
    assert_eq!(eval.state(), EvaluationState::Closed);

    {
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].0.is_empty());
        assert_eq!(reports[0].1, Some(uuid));
    }
    assert_eq!(*completions.lock().unwrap(), 0);

    // Staged writes of the failed run never land.
    assert_eq!(bag.multiplicity(&Tuple::new("k", "b", 1)).unwrap(), 0);
    assert_eq!(bag.inner.pending_transactions().unwrap(), 0);

    eval.close();
    drop(eval);
    assert_eq!(*closes.lock().unwrap(), 1);
}

#[test]
fn test_refused_prepare_commits_no_bag() {
    // Touched bags commit in id order, so the healthy one would go first.
    let healthy = Arc::new(MemoryBag::new(Uuid::from_bytes([1; 12])));
    healthy.seed(&Tuple::new("k", "a", 1), 1).unwrap();
    let failing = Arc::new(FailingBag {
        inner: MemoryBag::new(Uuid::from_bytes([2; 12])),
        poisoned: "",
        refuse_prepare: true,
    });

    let reports: Reports = Arc::default();
    let seen = Arc::clone(&reports);
    let mut eval = build_evaluation(
        RuntimeConfig::default(),
        HashMap::from([
            ("session".to_string(), healthy.uuid()),
            ("far".to_string(), failing.uuid()),
        ]),
        [
            Arc::clone(&healthy) as Arc<dyn Bag>,
            Arc::clone(&failing) as Arc<dyn Bag>,
        ],
        |_: &RunOutcome| {},
        move |message: &str, bag: Option<Uuid>| seen.lock().unwrap().push((message.to_string(), bag)),
    )
    .unwrap();

    let far = Node::new(1, "scan")
        .term("key", Term::reg(0, "K"))
        .term("relation", Term::constant("a"))
        .term("value", Term::reg(1, "V"))
        .arm(
            Node::new(2, "insert")
                .symbol("mode", "commit")
                .symbol("scope", "far")
                .term("key", Term::reg(0, "K"))
                .term("relation", Term::constant("c"))
                .term("value", Term::reg(1, "V")),
        );
    eval.build(&commit_block("a", "b")).unwrap();
    eval.build(&Compiled::new("a_to_far_c", far, 2)).unwrap();

    let err = eval.execute().unwrap_err();
    assert_eq!(err.bag(), Some(failing.uuid()));
    assert_eq!(reports.lock().unwrap()[0].1, Some(failing.uuid()));

    // Neither side of the run landed, and nothing is left staged.
    assert_eq!(healthy.multiplicity(&Tuple::new("k", "b", 1)).unwrap(), 0);
    assert_eq!(failing.multiplicity(&Tuple::new("k", "c", 1)).unwrap(), 0);
    assert_eq!(healthy.pending_transactions().unwrap(), 0);
    assert_eq!(failing.inner.pending_transactions().unwrap(), 0);
}

#[test]
fn test_unknown_node_type_fails_build_only() {
    let bag = Arc::new(MemoryBag::generate());
    let mut eval = build_evaluation(
        RuntimeConfig::default(),
        HashMap::from([("session".to_string(), bag.uuid())]),
        [bag as Arc<dyn Bag>],
        |_: &RunOutcome| {},
        |_: &str, _: Option<Uuid>| {},
    )
    .unwrap();
    let err = eval.build(&Compiled::new("odd", Node::new(1, "teleport"), 0)).unwrap_err();
    assert!(err.is_compile());
    // A failed build leaves the evaluation usable.
    assert!(eval.execute().is_ok());
}
