//! Threaded session runtime.
//!
//! An [`Evaluation`] runs on one logical thread. A [`Session`] moves it onto
//! a dedicated worker fed by a bounded channel, so callers on other threads
//! can inject events, wait for runs, and subscribe without sharing the
//! evaluation itself.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::error::{EngineError, EngineResult, ExecError};
use crate::evaluation::{Evaluation, RunOutcome};
use crate::perf::PerfSnapshot;
use crate::stream::ChangeStream;

const PATH: &str = "session";

fn disconnected() -> EngineError {
    EngineError::Execution(ExecError::Disconnected {
        path: PATH.to_string(),
    })
}

enum Request {
    Inject {
        buffer: String,
        sync: bool,
        reply: Sender<EngineResult<Option<RunOutcome>>>,
    },
    Execute {
        reply: Sender<EngineResult<RunOutcome>>,
    },
    Subscribe {
        reply: Sender<ChangeStream>,
    },
    Counters {
        reply: Sender<Vec<PerfSnapshot>>,
    },
    Close,
}

/// Handle for a request the worker has accepted.
pub struct Pending<T> {
    rx: Receiver<EngineResult<T>>,
}

impl<T> Pending<T> {
    /// Waits for the result.
    pub fn join(self) -> EngineResult<T> {
        self.rx.recv().map_err(|_| disconnected())?
    }

    /// Waits for the result with a timeout.
    pub fn join_timeout(self, timeout: Duration) -> EngineResult<T> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => EngineError::Execution(ExecError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })?
    }
}

/// Runs the events left queued by coalesced async injections.
fn run_owed(evaluation: &mut Evaluation) {
    if evaluation.pending_events() == 0 {
        return;
    }
    if let Err(e) = evaluation.execute() {
        tracing::warn!(evaluation = %evaluation.id(), error = %e, "deferred run failed");
    }
}

fn serve(mut evaluation: Evaluation, rx: &Receiver<Request>) {
    // Set while async injections wait for a run.
    let mut owed = false;
    loop {
        let request = if owed {
            match rx.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Empty) => {
                    owed = false;
                    run_owed(&mut evaluation);
                    continue;
                }
                Err(TryRecvError::Disconnected) => {
                    run_owed(&mut evaluation);
                    break;
                }
            }
        } else {
            match rx.recv() {
                Ok(request) => request,
                Err(_) => break,
            }
        };
        // Anything that observes the evaluation sees the owed run first.
        if owed && matches!(request, Request::Subscribe { .. } | Request::Counters { .. }) {
            owed = false;
            run_owed(&mut evaluation);
        }
        match request {
            Request::Inject { buffer, sync, reply } => {
                let result = match evaluation.inject_event(&buffer, false) {
                    // Async injections coalesce until the queue is drained.
                    Ok(_) if sync || rx.is_empty() => {
                        owed = false;
                        evaluation.execute().map(Some)
                    }
                    Ok(_) => {
                        owed = true;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Request::Execute { reply } => {
                owed = false;
                let _ = reply.send(evaluation.execute());
            }
            Request::Subscribe { reply } => {
                let _ = reply.send(evaluation.subscribe());
            }
            Request::Counters { reply } => {
                let _ = reply.send(evaluation.counters());
            }
            Request::Close => break,
        }
    }
    evaluation.close();
    tracing::debug!(evaluation = %evaluation.id(), "session worker stopped");
}

/// An evaluation owned by a worker thread.
pub struct Session {
    tx: Sender<Request>,
    worker: Option<JoinHandle<()>>,
    cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
    capacity: usize,
}

impl Session {
    /// Moves `evaluation` onto a new worker thread.
    ///
    /// # Errors
    /// `EngineError::Internal` if the thread cannot be spawned.
    pub fn spawn(evaluation: Evaluation) -> EngineResult<Self> {
        let capacity = evaluation.config().session_queue_capacity;
        let cancel = evaluation.cancel_handle();
        let (tx, rx) = bounded::<Request>(capacity);
        let name = format!("blockflow-{}", evaluation.id());
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || serve(evaluation, &rx))
            .map_err(|e| EngineError::internal(format!("failed to spawn session worker: {e}")))?;
        Ok(Self {
            tx,
            worker: Some(worker),
            cancel,
            capacity,
        })
    }

    fn submit(&self, request: Request) -> EngineResult<()> {
        match self.tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EngineError::Execution(ExecError::QueueFull {
                path: PATH.to_string(),
                capacity: self.capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(disconnected()),
        }
    }

    /// Queues `buffer` for injection.
    ///
    /// The returned handle resolves once the injection was handled: with
    /// `sync`, after the run that consumed the events; otherwise possibly
    /// with `None` when the run is deferred until the queue drains or a
    /// later request needs the evaluation.
    ///
    /// # Errors
    /// `QueueFull` or `Disconnected` if the worker cannot accept requests.
    pub fn inject_async(&self, buffer: &str, sync: bool) -> EngineResult<Pending<Option<RunOutcome>>> {
        let (reply, rx) = bounded(1);
        self.submit(Request::Inject {
            buffer: buffer.to_string(),
            sync,
            reply,
        })?;
        Ok(Pending { rx })
    }

    /// Injects `buffer`; with `sync`, waits for the run that consumed it.
    ///
    /// # Errors
    /// Submission errors, or whatever the evaluation returned when `sync`.
    pub fn inject(&self, buffer: &str, sync: bool) -> EngineResult<Option<RunOutcome>> {
        let pending = self.inject_async(buffer, sync)?;
        if sync {
            pending.join()
        } else {
            Ok(None)
        }
    }

    /// Runs the evaluation to a fixed point and waits for the outcome.
    ///
    /// # Errors
    /// Submission errors or the run's error.
    pub fn execute(&self) -> EngineResult<RunOutcome> {
        let (reply, rx) = bounded(1);
        self.submit(Request::Execute { reply })?;
        Pending { rx }.join()
    }

    /// Subscribes to the evaluation's change batches.
    ///
    /// # Errors
    /// Submission errors.
    pub fn subscribe(&self) -> EngineResult<ChangeStream> {
        let (reply, rx) = bounded(1);
        self.submit(Request::Subscribe { reply })?;
        rx.recv().map_err(|_| disconnected())
    }

    /// Snapshot of the evaluation's operator counters.
    ///
    /// # Errors
    /// Submission errors.
    pub fn counters(&self) -> EngineResult<Vec<PerfSnapshot>> {
        let (reply, rx) = bounded(1);
        self.submit(Request::Counters { reply })?;
        rx.recv().map_err(|_| disconnected())
    }

    /// Cancels any run in progress and stops the worker after it.
    pub fn close(&mut self) {
        self.cancel.store(true, std::sync::atomic::Ordering::Release);
        // A full queue still ends: the sender is dropped below.
        let _ = self.tx.try_send(Request::Close);
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (closed, _) = bounded(1);
        drop(std::mem::replace(&mut self.tx, closed));
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("session worker panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
