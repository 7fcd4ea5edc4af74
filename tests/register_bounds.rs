//! Build-time register bound checks on randomized node trees.

use std::collections::HashMap;
use std::sync::Arc;

use blockflow::ir::max_register;
use blockflow::{
    build_evaluation, load_program, to_json_pretty, Bag, CompileError, Compiled, EngineError, Evaluation,
    MemoryBag, Node, RunOutcome, RuntimeConfig, Term, Uuid,
};
use proptest::prelude::*;

fn evaluation() -> Evaluation {
    let bag = Arc::new(MemoryBag::generate());
    build_evaluation(
        RuntimeConfig::default(),
        HashMap::from([("session".to_string(), bag.uuid())]),
        [bag as Arc<dyn Bag>],
        |_: &RunOutcome| {},
        |_: &str, _: Option<Uuid>| {},
    )
    .unwrap()
}

/// A chain of `move` nodes, one per `(from, out)` pair.
fn chain(moves: &[(usize, usize)]) -> Node {
    moves
        .iter()
        .enumerate()
        .rev()
        .fold(None, |next: Option<Node>, (i, (from, out))| {
            let node = Node::new(i64::try_from(i).unwrap(), "move")
                .term("from", Term::reg(*from, "F"))
                .term("out", Term::reg(*out, "O"));
            Some(match next {
                Some(next) => node.arm(next),
                None => node,
            })
        })
        .unwrap()
}

proptest! {
    #[test]
    fn out_of_bounds_registers_never_build(
        moves in prop::collection::vec((0usize..24, 0usize..24), 1..8),
        regs in 0usize..24,
    ) {
        let head = chain(&moves);
        let max = max_register(&head).unwrap();
        let mut eval = evaluation();
        let result = eval.build(&Compiled::new("fuzz", head, regs));
        if max >= regs {
            let rejected = matches!(
                result,
                Err(EngineError::Compile(CompileError::RegisterOutOfBounds { index, .. })) if index == max
            );
            prop_assert!(rejected);
        } else {
            prop_assert!(result.is_ok());
        }
    }

    #[test]
    fn arguments_inside_nested_arms_are_checked(depth in 1usize..6, regs in 1usize..8) {
        let mut node = Node::new(0, "move")
            .term("from", Term::constant(1))
            .term("out", Term::reg(regs, "X"));
        for i in 1..=depth {
            node = Node::new(i64::try_from(i).unwrap(), "move")
                .term("from", Term::constant(1))
                .term("out", Term::reg(0, "Y"))
                .arm(node);
        }
        let mut eval = evaluation();
        prop_assert!(eval.build(&Compiled::new("nested", node, regs)).is_err());
    }
}

#[test]
fn test_loaded_program_is_checked_too() {
    let head = chain(&[(0, 1), (1, 5)]);
    let json = to_json_pretty(&[Compiled::new("bad", head, 3)]).unwrap();
    let err = load_program(&json, false).unwrap_err();
    assert!(err.is_compile());

    let head = chain(&[(0, 1), (1, 2)]);
    let json = to_json_pretty(&[Compiled::new("good", head, 3)]).unwrap();
    let (blocks, description) = load_program(&json, true).unwrap();
    assert!(blocks[0].tracing);
    assert!(description.contains("good"));
    assert!(evaluation().build(&blocks[0]).is_ok());
}
