//! Durability of committed runs across file bag reopen.

#![cfg(feature = "persistent")]

use std::collections::HashMap;
use std::sync::Arc;

use blockflow::{
    build_evaluation, filebag_init, Bag, Compiled, Node, PersistentConfig, RunOutcome, RuntimeConfig, Term,
    Tuple, Uuid,
};
use tempfile::tempdir;

fn copy_block() -> Compiled {
    let head = Node::new(1, "scan")
        .term("key", Term::reg(0, "K"))
        .term("relation", Term::constant("reading"))
        .term("value", Term::reg(1, "V"))
        .arm(
            Node::new(2, "insert")
                .symbol("mode", "commit")
                .term("key", Term::reg(0, "K"))
                .term("relation", Term::constant("archived"))
                .term("value", Term::reg(1, "V")),
        );
    Compiled::new("archive", head, 2)
}

fn run_once(bag: Arc<dyn Bag>, buffer: &str) {
    let mut eval = build_evaluation(
        RuntimeConfig::default(),
        HashMap::from([("session".to_string(), bag.uuid())]),
        [bag],
        |_: &RunOutcome| {},
        |message: &str, _: Option<Uuid>| panic!("{message}"),
    )
    .unwrap();
    eval.build(&copy_block()).unwrap();
    eval.inject_event(buffer, true).unwrap();
}

#[test]
fn test_commits_survive_reopen() {
    let dir = tempdir().unwrap();
    let uuid = Uuid::generate();
    {
        let bag = Arc::new(filebag_init(dir.path(), uuid, None).unwrap());
        run_once(bag, "{\"scope\":\"session\",\"key\":\"s1\",\"relation\":\"reading\",\"value\":21.5}\n");
    }

    let bag = filebag_init(dir.path(), uuid, None).unwrap();
    assert_eq!(bag.multiplicity(&Tuple::new("s1", "reading", 21.5)).unwrap(), 1);
    assert_eq!(bag.multiplicity(&Tuple::new("s1", "archived", 21.5)).unwrap(), 1);
    assert_eq!(bag.len().unwrap(), 2);
}

#[test]
fn test_retraction_survives_compaction() {
    let dir = tempdir().unwrap();
    let uuid = Uuid::generate();
    let config = PersistentConfig {
        max_wal_size: PersistentConfig::MIN_WAL_SIZE,
        sync_on_write: false,
    };
    {
        let bag: Arc<dyn Bag> = Arc::new(filebag_init(dir.path(), uuid, Some(config)).unwrap());
        for i in 0..50 {
            let line = format!("{{\"scope\":\"session\",\"key\":\"s{i}\",\"relation\":\"reading\",\"value\":{i}}}\n");
            run_once(Arc::clone(&bag), &line);
        }
        run_once(
            Arc::clone(&bag),
            "{\"scope\":\"session\",\"key\":\"s0\",\"relation\":\"reading\",\"value\":0,\"multiplicity\":-1}\n",
        );
    }

    let bag = filebag_init(dir.path(), uuid, Some(config)).unwrap();
    assert_eq!(bag.multiplicity(&Tuple::new("s0", "reading", 0)).unwrap(), 0);
    assert_eq!(bag.multiplicity(&Tuple::new("s49", "reading", 49)).unwrap(), 1);
}

#[test]
fn test_second_open_is_locked_out() {
    let dir = tempdir().unwrap();
    let uuid = Uuid::generate();
    let _held = filebag_init(dir.path(), uuid, None).unwrap();
    assert!(filebag_init(dir.path(), uuid, None).is_err());
}

#[test]
fn test_directory_belongs_to_one_bag() {
    let dir = tempdir().unwrap();
    drop(filebag_init(dir.path(), Uuid::generate(), None).unwrap());
    assert!(filebag_init(dir.path(), Uuid::generate(), None).is_err());
}
