//! Evaluations on different threads sharing bags.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use blockflow::{
    build_evaluation, Bag, Compiled, MemoryBag, Node, RunOutcome, RuntimeConfig, Session, Term, Tuple, Uuid,
};

fn counter_block() -> Compiled {
    let head = Node::new(1, "scan")
        .term("key", Term::reg(0, "K"))
        .term("relation", Term::constant("hit"))
        .term("value", Term::reg(1, "V"))
        .arm(
            Node::new(2, "insert")
                .symbol("mode", "bind")
                .term("key", Term::reg(0, "K"))
                .term("relation", Term::constant("seen"))
                .term("value", Term::reg(1, "V")),
        );
    Compiled::new("seen", head, 2)
}

#[test]
fn test_shared_bag_loses_no_updates() {
    let bag = Arc::new(MemoryBag::generate());
    let workers = 4;
    let per_worker = 25;

    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let bag = Arc::clone(&bag);
            thread::spawn(move || {
                let mut eval = build_evaluation(
                    RuntimeConfig::default(),
                    HashMap::from([("session".to_string(), bag.uuid())]),
                    [bag as Arc<dyn Bag>],
                    |_: &RunOutcome| {},
                    |message: &str, _: Option<Uuid>| panic!("{message}"),
                )
                .unwrap();
                eval.build(&counter_block()).unwrap();
                for i in 0..per_worker {
                    let line = format!(
                        "{{\"scope\":\"session\",\"key\":\"w{w}\",\"relation\":\"hit\",\"value\":{i}}}\n\
                         {{\"scope\":\"session\",\"key\":\"shared\",\"relation\":\"hit\",\"value\":0}}\n"
                    );
                    eval.inject_event(&line, true).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(bag.len().unwrap(), workers * per_worker + 1);
    let shared = bag.multiplicity(&Tuple::new("shared", "hit", 0)).unwrap();
    assert_eq!(shared, i64::try_from(workers * per_worker).unwrap());
}

#[test]
fn test_sessions_run_side_by_side() {
    let bag = Arc::new(MemoryBag::generate());
    let sessions: Vec<Session> = (0..2)
        .map(|_| {
            let mut eval = build_evaluation(
                RuntimeConfig::default(),
                HashMap::from([("session".to_string(), bag.uuid())]),
                [Arc::clone(&bag) as Arc<dyn Bag>],
                |_: &RunOutcome| {},
                |_: &str, _: Option<Uuid>| {},
            )
            .unwrap();
            eval.build(&counter_block()).unwrap();
            Session::spawn(eval).unwrap()
        })
        .collect();

    for (n, session) in sessions.iter().enumerate() {
        let line = format!("{{\"scope\":\"session\",\"key\":\"s{n}\",\"relation\":\"hit\",\"value\":1}}\n");
        session.inject(&line, true).unwrap();
    }
    // Each session derives from everything committed so far.
    let outcome = sessions[0].execute().unwrap();
    assert_eq!(outcome.solution.len(), 2);
    assert_eq!(bag.len().unwrap(), 2);
}
