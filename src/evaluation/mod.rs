//! Evaluations: the lifecycle around a set of blocks.
//!
//! An [`Evaluation`] binds scope names to persisted bags, owns the blocks
//! built for it and the multiplicity tables of the current run, and reports
//! each stable run to its [`Completion`] hook and change subscribers.
//!
//! Lifecycle: [`build_evaluation`] → [`Evaluation::build`] per block →
//! any number of [`Evaluation::execute`] / [`Evaluation::inject_event`] →
//! [`Evaluation::close`]. A runtime error closes the evaluation.

mod events;
mod scheduler;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use events::{EventFact, EventScanner, Scanned};

use crate::block::{Block, BlockBuilder, BuilderTable};
use crate::config::RuntimeConfig;
use crate::error::{CompileError, ConfigError, EngineResult, EventError, ExecError};
use crate::exec::Frame;
use crate::id::Uuid;
use crate::ir::{validate_program, Compiled};
use crate::perf::{Counters, PerfSnapshot};
use crate::reconcile::Reconciler;
use crate::region::{Region, RegionStats};
use crate::solution::{BlockSolution, Change, Fact, Solution};
use crate::storage::Bag;
use crate::stream::{ChangeStream, Subscribers};

/// Block id under which injected event facts are sealed.
pub const EVENT_INPUT: usize = usize::MAX;

/// Where an evaluation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvaluationState {
    /// Built, no run yet.
    Idle,
    /// A run is in progress.
    Running,
    /// The last run reached a fixed point.
    Stable,
    /// The last run failed; the evaluation is being closed.
    Error,
    /// Closed; no further runs.
    Closed,
}

impl EvaluationState {
    /// Lowercase name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stable => "stable",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for EvaluationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives runtime errors with the bag they originated from.
pub trait ErrorHandler: Send {
    fn handle(&mut self, message: &str, bag: Option<Uuid>);
}

impl<F> ErrorHandler for F
where
    F: FnMut(&str, Option<Uuid>) + Send,
{
    fn handle(&mut self, message: &str, bag: Option<Uuid>) {
        self(message, bag);
    }
}

/// Receives every stable run.
pub trait Completion: Send {
    fn complete(&mut self, outcome: &RunOutcome);
}

impl<F> Completion for F
where
    F: FnMut(&RunOutcome) + Send,
{
    fn complete(&mut self, outcome: &RunOutcome) {
        self(outcome);
    }
}

/// Result of one run that reached a fixed point.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Evaluation that ran.
    pub evaluation: Uuid,
    /// Run sequence number, starting at 1.
    pub run: u64,
    /// Cycles executed, including the final quiet one.
    pub cycles: usize,
    /// Final output of each block, keyed by block id.
    pub block_solution: BlockSolution,
    /// Binds of the run plus the commit deltas it applied.
    pub solution: Solution,
    /// Presence changes against the previous run's final view.
    pub changes: Vec<Change>,
    /// Wall time from run start to stable.
    pub elapsed: Duration,
}

type TerminalHook = Box<dyn FnOnce() + Send>;

/// One evaluation of a rule program over a set of persisted bags.
pub struct Evaluation {
    id: Uuid,
    config: RuntimeConfig,
    h: Region,
    working: Region,
    reconciler: Reconciler,
    scanner: EventScanner,
    error_handler: Box<dyn ErrorHandler>,
    complete: Box<dyn Completion>,
    terminal: Option<TerminalHook>,
    counters: Counters,
    builders: BuilderTable,
    block_solution: BlockSolution,
    /// Commit contributions of each block as of the last stable run.
    committed: BlockSolution,
    solution: Solution,
    last_f_solution: Solution,
    persisted: HashMap<Uuid, Arc<dyn Bag>>,
    scopes: HashMap<String, Uuid>,
    blocks: Vec<Block>,
    event_blocks: Vec<Block>,
    next_block: usize,
    t: Option<Instant>,
    cycle_time: Duration,
    cycles: usize,
    non_empty: bool,
    run: u64,
    bk: Option<usize>,
    events: VecDeque<EventFact>,
    event_run: bool,
    previous_view: HashSet<Fact>,
    subscribers: Subscribers,
    cancel: Arc<AtomicBool>,
    state: EvaluationState,
}

impl fmt::Debug for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluation")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("run", &self.run)
            .field("blocks", &self.blocks.len())
            .field("event_blocks", &self.event_blocks.len())
            .field("pending_events", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// Creates an evaluation; see [`Evaluation::new`].
///
/// # Errors
/// As [`Evaluation::new`].
pub fn build_evaluation(
    config: RuntimeConfig,
    scopes: HashMap<String, Uuid>,
    persisted: impl IntoIterator<Item = Arc<dyn Bag>>,
    completion: impl Completion + 'static,
    error_handler: impl ErrorHandler + 'static,
) -> EngineResult<Evaluation> {
    Evaluation::new(config, scopes, persisted, completion, error_handler)
}

impl Evaluation {
    /// Creates an idle evaluation with no blocks.
    ///
    /// # Errors
    /// - `ConfigError::Invalid` if `config` does not validate
    /// - `ConfigError::UnboundScope` if a scope names a bag not in `persisted`
    pub fn new(
        config: RuntimeConfig,
        scopes: HashMap<String, Uuid>,
        persisted: impl IntoIterator<Item = Arc<dyn Bag>>,
        completion: impl Completion + 'static,
        error_handler: impl ErrorHandler + 'static,
    ) -> EngineResult<Self> {
        let config = config.validate()?;
        let persisted: HashMap<Uuid, Arc<dyn Bag>> =
            persisted.into_iter().map(|bag| (bag.uuid(), bag)).collect();
        for (scope, bag) in &scopes {
            if !persisted.contains_key(bag) {
                return Err(ConfigError::UnboundScope {
                    scope: scope.clone(),
                    bag: *bag,
                }
                .into());
            }
        }

        let id = Uuid::generate();
        let scanner = EventScanner::new(scopes.clone(), persisted.keys().copied().collect());
        let subscribers = Subscribers::new(config.stream_capacity);
        tracing::debug!(evaluation = %id, scopes = scopes.len(), bags = persisted.len(), "evaluation created");
        Ok(Self {
            id,
            h: Region::new(format!("evaluation:{id}"), config.fence),
            working: Region::new(format!("working:{id}"), config.fence),
            config,
            reconciler: Reconciler::default(),
            scanner,
            error_handler: Box::new(error_handler),
            complete: Box::new(completion),
            terminal: None,
            counters: Counters::default(),
            builders: BuilderTable::default(),
            block_solution: BlockSolution::new(),
            committed: BlockSolution::new(),
            solution: Solution::new(),
            last_f_solution: Solution::new(),
            persisted,
            scopes,
            blocks: Vec::new(),
            event_blocks: Vec::new(),
            next_block: 0,
            t: None,
            cycle_time: Duration::ZERO,
            cycles: 0,
            non_empty: false,
            run: 0,
            bk: None,
            events: VecDeque::new(),
            event_run: false,
            previous_view: HashSet::new(),
            subscribers,
            cancel: Arc::new(AtomicBool::new(false)),
            state: EvaluationState::Idle,
        })
    }

    /// Replaces the node builder table used by later [`Evaluation::build`]s.
    #[must_use]
    pub fn with_builders(mut self, builders: BuilderTable) -> Self {
        self.builders = builders;
        self
    }

    /// Registers a hook that runs once when the evaluation closes.
    pub fn on_terminal(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.terminal = Some(Box::new(hook));
    }

    fn guard(&self, operation: &str) -> Result<(), ExecError> {
        match self.state {
            EvaluationState::Closed => Err(ExecError::Closed),
            EvaluationState::Running | EvaluationState::Error => Err(ExecError::InvalidState {
                operation: operation.to_string(),
                state: self.state.to_string(),
            }),
            EvaluationState::Idle | EvaluationState::Stable => Ok(()),
        }
    }

    /// Builds `compiled` and adds it to this evaluation. Event blocks run
    /// only in the first cycle of runs that consume injected events.
    ///
    /// # Errors
    /// - `ExecError::Closed` after close
    /// - `CompileError` from validation or building; nothing is added
    pub fn build(&mut self, compiled: &Compiled) -> EngineResult<usize> {
        self.guard("build")?;
        let duplicate = self
            .blocks
            .iter()
            .chain(&self.event_blocks)
            .any(|b| b.name() == compiled.name);
        if duplicate {
            return Err(CompileError::InvalidProgram {
                reason: format!("duplicate block name '{}'", compiled.name),
            }
            .into());
        }

        let id = self.next_block;
        let block = BlockBuilder::build(
            compiled,
            id,
            &self.builders,
            &self.scopes,
            &mut self.counters,
            self.config.fence,
        )
        .map_err(|e| {
            tracing::error!(evaluation = %self.id, block = %compiled.name, error = %e, "block build failed");
            e
        })?;
        self.next_block += 1;
        tracing::debug!(evaluation = %self.id, block = %compiled.name, id, event = block.is_event(), "block built");
        if block.is_event() {
            self.event_blocks.push(block);
        } else {
            self.blocks.push(block);
        }
        Ok(id)
    }

    /// Builds a whole program in order.
    ///
    /// # Errors
    /// The first failing block's error; blocks before it stay built.
    pub fn build_program(&mut self, program: &[Compiled]) -> EngineResult<Vec<usize>> {
        validate_program(program)?;
        program.iter().map(|compiled| self.build(compiled)).collect()
    }

    /// Parses `buffer` and queues its facts for the next run's first cycle.
    /// With `sync`, runs to a fixed point before returning.
    ///
    /// # Errors
    /// - `EventError` for bad records or a full event queue; the buffer is
    ///   then not consumed and can be injected again
    /// - anything [`Evaluation::execute`] returns when `sync` is set
    pub fn inject_event(&mut self, buffer: &str, sync: bool) -> EngineResult<Option<RunOutcome>> {
        self.guard("inject events")?;
        let scanned = self.scanner.parse(buffer)?;
        let capacity = self.config.event_queue_capacity;
        if self.events.len() + scanned.len() > capacity {
            tracing::warn!(evaluation = %self.id, capacity, "event queue full");
            return Err(EventError::QueueFull { capacity }.into());
        }
        let facts = self.scanner.accept(scanned);
        tracing::debug!(evaluation = %self.id, facts = facts.len(), sync, "events queued");
        self.events.extend(facts);
        if sync {
            return self.execute().map(Some);
        }
        Ok(None)
    }

    /// Tears down every block, drops subscribers and fires the terminal
    /// hook. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == EvaluationState::Closed {
            return;
        }
        let Self {
            h,
            working,
            persisted,
            solution,
            reconciler,
            cancel,
            blocks,
            event_blocks,
            ..
        } = self;
        for block in blocks.iter_mut().chain(event_blocks.iter_mut()) {
            let mut frame = Frame {
                region: &mut *h,
                bags: &*persisted,
                solution: &*solution,
                previous: None,
                reconciler: &mut *reconciler,
                cancel: &**cancel,
                block: block.id(),
            };
            if let Err(e) = block.close(&mut frame) {
                tracing::warn!(block = %block.name(), error = %e, "block close failed");
            }
        }
        working.release_all();
        h.release_all();
        self.subscribers.clear();
        self.events.clear();
        self.state = EvaluationState::Closed;
        tracing::debug!(evaluation = %self.id, runs = self.run, "evaluation closed");
        if let Some(hook) = self.terminal.take() {
            hook();
        }
    }

    /// A stream of the change batches of later runs.
    pub fn subscribe(&mut self) -> ChangeStream {
        self.subscribers.subscribe()
    }

    /// Snapshot of every operator counter.
    #[must_use]
    pub fn counters(&self) -> Vec<PerfSnapshot> {
        self.counters.snapshot()
    }

    /// Flag that abandons the current run after the current row when set.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Identity of this evaluation; also the `evaluation` half of its transaction ids.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> EvaluationState {
        self.state
    }

    /// Configuration the evaluation was created with.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Scope names and the bags they resolve to.
    #[must_use]
    pub const fn scopes(&self) -> &HashMap<String, Uuid> {
        &self.scopes
    }

    /// The persisted bag behind a scope name.
    #[must_use]
    pub fn bag(&self, scope: &str) -> Option<&Arc<dyn Bag>> {
        self.scopes.get(scope).and_then(|uuid| self.persisted.get(uuid))
    }

    /// Sealed state of the current or last run.
    #[must_use]
    pub const fn solution(&self) -> &Solution {
        &self.solution
    }

    /// Per-block output of the current or last run.
    #[must_use]
    pub const fn block_solution(&self) -> &BlockSolution {
        &self.block_solution
    }

    /// Names of regular blocks in execution order.
    #[must_use]
    pub fn block_names(&self) -> Vec<&str> {
        self.blocks.iter().map(Block::name).collect()
    }

    /// Names of event blocks in execution order.
    #[must_use]
    pub fn event_block_names(&self) -> Vec<&str> {
        self.event_blocks.iter().map(Block::name).collect()
    }

    /// Runs started so far.
    #[must_use]
    pub const fn runs(&self) -> u64 {
        self.run
    }

    /// Cycles of the current or last run.
    #[must_use]
    pub const fn cycles(&self) -> usize {
        self.cycles
    }

    /// Duration of the most recent cycle.
    #[must_use]
    pub const fn cycle_time(&self) -> Duration {
        self.cycle_time
    }

    /// Whether the most recent cycle changed presence.
    #[must_use]
    pub const fn non_empty(&self) -> bool {
        self.non_empty
    }

    /// Block executing right now, if a run is inside a block.
    #[must_use]
    pub const fn current_block(&self) -> Option<usize> {
        self.bk
    }

    /// Event facts waiting for the next run.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Accounting for the long-lived and the working region.
    #[must_use]
    pub fn region_stats(&self) -> (RegionStats, RegionStats) {
        (self.h.stats(), self.working.stats())
    }
}

impl Drop for Evaluation {
    fn drop(&mut self) {
        self.close();
    }
}
