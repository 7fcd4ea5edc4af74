//! The insertion reconciler.
//!
//! Every multiplicity change made by a block flows through [`Reconciler`].
//! Inserts accumulate into `t_solution`, the executing block's output for
//! the current cycle. Commit-mode inserts also stage the fact's run-wide net
//! delta into the target bag, so the bag always holds exactly what the
//! transaction will apply. Sealing swaps the block's output into the run's
//! solution and reports which facts crossed zero.
//!
//! Staging is keyed by `(tx, tuple)` with set semantics, which makes every
//! forward idempotent: re-running a block re-stages the same totals.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::error::ExecError;
use crate::id::Uuid;
use crate::solution::{BlockSolution, Fact, Mode, Multiplicity, Solution, Tuple, View};
use crate::storage::{Bag, TxId};

/// What sealing one block changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SealReport {
    /// Facts whose presence flipped when the block's output was swapped in.
    pub crossed: Vec<Fact>,
    /// Entries in the block's new output.
    pub entries: usize,
}

/// Multiplicity bookkeeping for one evaluation.
#[derive(Debug, Default)]
pub struct Reconciler {
    tx: Option<TxId>,
    t_solution: Solution,
    touched: BTreeSet<Uuid>,
    inserts: u64,
    rejected: u64,
}

fn storage_error(bag: Uuid, e: impl ToString) -> ExecError {
    ExecError::Storage {
        bag,
        message: e.to_string(),
    }
}

fn bag_for(bags: &HashMap<Uuid, Arc<dyn Bag>>, scope: Uuid) -> Result<&Arc<dyn Bag>, ExecError> {
    bags.get(&scope)
        .ok_or_else(|| storage_error(scope, "bag is not persisted in this evaluation"))
}

impl Reconciler {
    /// Starts a new transaction and drops all accumulated state.
    pub fn begin(&mut self, tx: TxId) {
        self.tx = Some(tx);
        self.t_solution.clear();
        self.touched.clear();
    }

    /// The open transaction, if a run is in progress.
    #[must_use]
    pub const fn tx(&self) -> Option<TxId> {
        self.tx
    }

    /// Output of the executing block so far.
    #[must_use]
    pub const fn t_solution(&self) -> &Solution {
        &self.t_solution
    }

    /// Bags with staged writes in the open transaction.
    pub fn touched(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.touched.iter().copied()
    }

    /// Inserts accepted since creation.
    #[must_use]
    pub const fn inserts(&self) -> u64 {
        self.inserts
    }

    /// Zero-multiplicity inserts rejected since creation.
    #[must_use]
    pub const fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Ends the transaction, returning the bags it touched.
    pub fn finish(&mut self) -> Vec<Uuid> {
        self.tx = None;
        self.t_solution.clear();
        std::mem::take(&mut self.touched).into_iter().collect()
    }

    /// Adds `multiplicity` to the executing block's accumulator for a fact.
    ///
    /// `solution` is the run's sealed state and `previous` the executing
    /// block's last sealed output, which for commits may be carried over
    /// from an earlier run; together with the accumulator they give
    /// the run-wide net a commit-mode fact will apply to its bag.
    ///
    /// # Errors
    /// - `ExecError::InvalidState` outside a run
    /// - `ExecError::Storage` if the target bag is missing or staging fails
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        bags: &HashMap<Uuid, Arc<dyn Bag>>,
        solution: &Solution,
        previous: Option<&Solution>,
        scope: Uuid,
        tuple: Tuple,
        multiplicity: Multiplicity,
        mode: Mode,
    ) -> Result<(), ExecError> {
        let Some(tx) = self.tx else {
            return Err(ExecError::InvalidState {
                operation: "insert".to_string(),
                state: "idle".to_string(),
            });
        };
        if multiplicity == 0 {
            self.rejected += 1;
            tracing::warn!(scope = %scope, tuple = %tuple, "rejected zero-multiplicity insert");
            return Ok(());
        }

        let acc = self.t_solution.add(mode, scope, &tuple, multiplicity);
        self.inserts += 1;

        if mode == Mode::Commit {
            let prior = previous.map_or(0, |p| p.get(Mode::Commit, scope, &tuple));
            let net = solution.get(Mode::Commit, scope, &tuple) - prior + acc;
            bag_for(bags, scope)?
                .stage(tx, &tuple, net)
                .map_err(|e| storage_error(scope, e))?;
            self.touched.insert(scope);
        }
        Ok(())
    }

    /// Replaces block `block`'s sealed output with the accumulated one.
    ///
    /// `solution` is adjusted by the difference, commit nets of every fact
    /// the block produced before or now are re-staged, and facts whose
    /// presence in the view changed are reported.
    ///
    /// # Errors
    /// `ExecError::Storage` on bag read or staging failures.
    pub fn seal(
        &mut self,
        block: usize,
        bags: &HashMap<Uuid, Arc<dyn Bag>>,
        block_solution: &mut BlockSolution,
        solution: &mut Solution,
    ) -> Result<SealReport, ExecError> {
        let fresh = std::mem::take(&mut self.t_solution);
        let stale = block_solution.remove(&block).unwrap_or_default();

        let mut facts: HashSet<Fact> = stale.facts();
        facts.extend(fresh.facts());

        let mut before = Vec::with_capacity(facts.len());
        {
            let view = View::new(bags, solution);
            for fact in &facts {
                before.push(view.multiplicity(fact.scope, &fact.tuple)? > 0);
            }
        }

        solution.merge(&stale, -1);
        solution.merge(&fresh, 1);

        let mut crossed = Vec::new();
        {
            let view = View::new(bags, solution);
            for (fact, was) in facts.iter().zip(before) {
                if (view.multiplicity(fact.scope, &fact.tuple)? > 0) != was {
                    crossed.push(fact.clone());
                }
            }
        }
        crossed.sort_by_key(Fact::key_of);

        if let Some(tx) = self.tx {
            let commits: HashSet<(Uuid, &Tuple)> = stale
                .iter(Mode::Commit)
                .chain(fresh.iter(Mode::Commit))
                .map(|(scope, t, _)| (scope, t))
                .collect();
            for (scope, tuple) in commits {
                let net = solution.get(Mode::Commit, scope, tuple);
                bag_for(bags, scope)?
                    .stage(tx, tuple, net)
                    .map_err(|e| storage_error(scope, e))?;
                self.touched.insert(scope);
            }
        }

        let report = SealReport {
            crossed,
            entries: fresh.len(),
        };
        block_solution.insert(block, fresh);
        Ok(report)
    }
}
