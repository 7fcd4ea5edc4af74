//! The fixed-point scheduler.
//!
//! A run repeats cycles until one leaves the presence of every fact
//! unchanged. Each cycle runs the blocks in list order; a block sees the
//! sealed output of every block before it in the same cycle. Presence only
//! changes when a block is sealed, so the facts reported as crossed by the
//! seals of a cycle are the only ones that need comparing against the
//! cycle's starting state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::block::Block;
use crate::error::{EngineError, EngineResult, ExecError};
use crate::evaluation::{Evaluation, EvaluationState, RunOutcome, EVENT_INPUT};
use crate::exec::Frame;
use crate::id::Uuid;
use crate::reconcile::{Reconciler, SealReport};
use crate::region::Region;
use crate::solution::{diff, BlockSolution, ChangeBatch, Fact, Mode, Solution, View};
use crate::storage::{Bag, TxId};

/// Runs one block pass and seals its output.
#[allow(clippy::too_many_arguments)]
fn run_block(
    block: &mut Block,
    working: &mut Region,
    bags: &HashMap<Uuid, Arc<dyn Bag>>,
    solution: &mut Solution,
    block_solution: &mut BlockSolution,
    reconciler: &mut Reconciler,
    cancel: &AtomicBool,
) -> Result<SealReport, ExecError> {
    let id = block.id();
    {
        let mut frame = Frame {
            region: working,
            bags,
            solution: &*solution,
            previous: block_solution.get(&id),
            reconciler: &mut *reconciler,
            cancel,
            block: id,
        };
        block.run(&mut frame)?;
    }
    reconciler.seal(id, bags, block_solution, solution)
}

fn present(view: &View<'_>, fact: &Fact) -> Result<bool, ExecError> {
    Ok(view.multiplicity(fact.scope, &fact.tuple)? > 0)
}

impl Evaluation {
    /// Runs to a fixed point and commits the run's changes.
    ///
    /// # Errors
    /// - `ExecError::Closed` / `InvalidState` if the evaluation cannot run
    /// - any runtime error; the evaluation is closed before it is returned
    pub fn execute(&mut self) -> EngineResult<RunOutcome> {
        self.guard("execute")?;
        self.start_fixedpoint();
        match self.run_solver().and_then(|()| self.stabilize()) {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Opens a new transaction and clears all run state.
    ///
    /// Each block starts from the commits it made in earlier runs, so
    /// re-deriving a committed fact stages nothing and dropping it stages
    /// the retraction.
    pub(crate) fn start_fixedpoint(&mut self) {
        self.run += 1;
        self.block_solution.clone_from(&self.committed);
        self.solution.clear();
        self.last_f_solution.clear();
        self.reconciler.begin(TxId::new(self.id, self.run));
        self.working.reset();
        self.cycles = 0;
        self.cycle_time = Duration::ZERO;
        self.non_empty = false;
        self.bk = None;
        self.event_run = !self.events.is_empty();
        self.t = Some(Instant::now());
        self.state = EvaluationState::Running;
        tracing::debug!(evaluation = %self.id, run = self.run, events = self.events.len(), "run started");
    }

    /// Runs cycles until one changes nothing.
    pub(crate) fn run_solver(&mut self) -> Result<(), ExecError> {
        loop {
            if let Some(max) = self.config.max_cycles {
                if self.cycles >= max {
                    return Err(ExecError::NonConvergence {
                        cycles: self.cycles,
                    });
                }
            }
            self.cycle()?;
            if !self.non_empty {
                return Ok(());
            }
        }
    }

    fn cycle(&mut self) -> Result<(), ExecError> {
        let started = Instant::now();
        self.cycles += 1;
        self.last_f_solution.clone_from(&self.solution);
        self.working.reset();

        let mut crossed: HashSet<Fact> = HashSet::new();
        if self.cycles == 1 {
            if self.event_run {
                crossed.extend(self.event_input()?.crossed);
            }
            let Self {
                event_blocks,
                working,
                persisted,
                solution,
                block_solution,
                reconciler,
                cancel,
                bk,
                event_run,
                ..
            } = self;
            if *event_run {
                for block in event_blocks.iter_mut() {
                    *bk = Some(block.id());
                    let report = run_block(block, working, persisted, solution, block_solution, reconciler, cancel)?;
                    crossed.extend(report.crossed);
                }
            }
        }

        let Self {
            blocks,
            working,
            persisted,
            solution,
            block_solution,
            reconciler,
            cancel,
            bk,
            ..
        } = self;
        for block in blocks.iter_mut() {
            *bk = Some(block.id());
            let report = run_block(block, working, persisted, solution, block_solution, reconciler, cancel)?;
            crossed.extend(report.crossed);
        }
        self.bk = None;

        let now = View::new(&self.persisted, &self.solution);
        let before = View::new(&self.persisted, &self.last_f_solution);
        let mut changed = 0usize;
        for fact in &crossed {
            if present(&now, fact)? != present(&before, fact)? {
                changed += 1;
            }
        }
        self.non_empty = changed > 0;
        self.cycle_time = started.elapsed();
        tracing::debug!(
            evaluation = %self.id,
            run = self.run,
            cycle = self.cycles,
            changed,
            elapsed_us = u64::try_from(self.cycle_time.as_micros()).unwrap_or(u64::MAX),
            "cycle finished"
        );
        Ok(())
    }

    /// Commit-inserts the queued event facts and seals them.
    fn event_input(&mut self) -> Result<SealReport, ExecError> {
        let events: Vec<_> = self.events.drain(..).collect();
        for event in events {
            self.reconciler.insert(
                &self.persisted,
                &self.solution,
                None,
                event.scope,
                event.tuple,
                event.multiplicity,
                Mode::Commit,
            )?;
        }
        self.reconciler
            .seal(EVENT_INPUT, &self.persisted, &mut self.block_solution, &mut self.solution)
    }

    /// Diffs the final view, commits touched bags and reports the run.
    fn stabilize(&mut self) -> Result<RunOutcome, ExecError> {
        let mut candidates = self.solution.facts();
        candidates.extend(self.previous_view.iter().cloned());

        // Evaluated before the commit folds this run's deltas into the bags.
        let empty = Solution::new();
        let base = View::new(&self.persisted, &empty);
        let view = View::new(&self.persisted, &self.solution);
        let mut before = HashSet::new();
        let mut after = HashSet::new();
        for fact in candidates {
            let was = self.previous_view.contains(&fact) || present(&base, &fact)?;
            let is = present(&view, &fact)?;
            if was {
                before.insert(fact.clone());
            }
            if is {
                after.insert(fact);
            }
        }
        let changes = diff(&before, &after);

        if let Some(tx) = self.reconciler.tx() {
            let touched = self.reconciler.finish();
            for uuid in &touched {
                let Some(bag) = self.persisted.get(uuid) else { continue };
                if let Err(e) = bag.prepare(tx) {
                    self.abort_bags(tx, &touched);
                    return Err(ExecError::Storage {
                        bag: *uuid,
                        message: e.to_string(),
                    });
                }
            }
            for (i, uuid) in touched.iter().enumerate() {
                let Some(bag) = self.persisted.get(uuid) else { continue };
                match bag.commit(tx) {
                    Ok(applied) => tracing::debug!(bag = %uuid, deltas = applied.len(), "bag committed"),
                    Err(e) => {
                        // Bags before this one keep their commit.
                        if i > 0 {
                            tracing::error!(tx = %tx, committed = ?&touched[..i], "commit failed after other bags committed");
                        }
                        self.abort_bags(tx, &touched[i..]);
                        return Err(ExecError::Storage {
                            bag: *uuid,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        // Event-driven output accumulates, so only rule blocks carry support.
        let transient: HashSet<usize> = self.event_blocks.iter().map(Block::id).chain([EVENT_INPUT]).collect();
        self.committed = self
            .block_solution
            .iter()
            .filter(|(id, _)| !transient.contains(*id))
            .map(|(id, output)| (*id, output.commits_only()))
            .filter(|(_, commits)| !commits.is_empty())
            .collect();
        self.previous_view = after;
        self.state = EvaluationState::Stable;

        let elapsed = self.t.map_or(Duration::ZERO, |t| t.elapsed());
        let outcome = RunOutcome {
            evaluation: self.id,
            run: self.run,
            cycles: self.cycles,
            block_solution: self.block_solution.clone(),
            solution: self.solution.clone(),
            changes,
            elapsed,
        };
        if !outcome.changes.is_empty() {
            self.subscribers.publish(&ChangeBatch {
                evaluation: self.id,
                run: self.run,
                at: Utc::now(),
                changes: outcome.changes.clone(),
            });
        }
        tracing::info!(
            evaluation = %self.id,
            run = self.run,
            cycles = self.cycles,
            changes = outcome.changes.len(),
            subscribers = self.subscribers.len(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "run stable"
        );
        self.complete.complete(&outcome);
        Ok(outcome)
    }

    fn abort_bags(&self, tx: TxId, bags: &[Uuid]) {
        for uuid in bags {
            if let Some(bag) = self.persisted.get(uuid) {
                if let Err(e) = bag.abort(tx) {
                    tracing::warn!(bag = %uuid, error = %e, "abort failed");
                }
            }
        }
    }

    /// Aborts the run, reports the error and closes the evaluation.
    fn fail(&mut self, err: ExecError) -> EngineError {
        if let Some(tx) = self.reconciler.tx() {
            let touched = self.reconciler.finish();
            self.abort_bags(tx, &touched);
        }
        self.bk = None;
        self.state = EvaluationState::Error;
        tracing::error!(evaluation = %self.id, run = self.run, bag = ?err.bag(), error = %err, "run failed");
        if !matches!(err, ExecError::Cancelled) {
            self.error_handler.handle(&err.to_string(), err.bag());
        }
        self.close();
        err.into()
    }
}
