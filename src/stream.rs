//! Change streams for subscribers of an evaluation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::error::{EngineError, EngineResult, ExecError};
use crate::solution::ChangeBatch;

const PATH: &str = "change_stream";

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Receiving end of a subscription.
///
/// Every stable run with at least one presence change publishes one
/// [`ChangeBatch`]. A subscriber that falls more than the configured
/// capacity behind loses batches; [`ChangeStream::dropped`] counts them.
#[derive(Debug)]
pub struct ChangeStream {
    rx: Receiver<ChangeBatch>,
    dropped: Arc<AtomicU64>,
}

impl ChangeStream {
    /// Receive the next batch (blocking).
    pub fn recv(&self) -> EngineResult<ChangeBatch> {
        self.rx.recv().map_err(|_| {
            EngineError::Execution(ExecError::Disconnected {
                path: PATH.to_string(),
            })
        })
    }

    /// Receive the next batch with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> EngineResult<ChangeBatch> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => EngineError::Execution(ExecError::Timeout {
                duration_ms: timeout_ms(timeout),
            }),
            RecvTimeoutError::Disconnected => EngineError::Execution(ExecError::Disconnected {
                path: PATH.to_string(),
            }),
        })
    }

    /// Returns a batch if one is ready.
    pub fn try_recv(&self) -> EngineResult<Option<ChangeBatch>> {
        match self.rx.try_recv() {
            Ok(batch) => Ok(Some(batch)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(EngineError::Execution(ExecError::Disconnected {
                path: PATH.to_string(),
            })),
        }
    }

    /// Batches lost because this stream was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Subscriber {
    tx: Sender<ChangeBatch>,
    dropped: Arc<AtomicU64>,
}

/// Publishing side, owned by the evaluation.
pub(crate) struct Subscribers {
    capacity: usize,
    list: Vec<Subscriber>,
}

impl Subscribers {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            list: Vec::new(),
        }
    }

    pub(crate) fn subscribe(&mut self) -> ChangeStream {
        let (tx, rx) = bounded(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.list.push(Subscriber {
            tx,
            dropped: Arc::clone(&dropped),
        });
        ChangeStream { rx, dropped }
    }

    /// Never blocks: full subscribers lose the batch, gone ones are removed.
    pub(crate) fn publish(&mut self, batch: &ChangeBatch) {
        self.list.retain(|sub| match sub.tx.try_send(batch.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(run = batch.run, "change subscriber is full, batch dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Disconnects every stream.
    pub(crate) fn clear(&mut self) {
        self.list.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Uuid;
    use chrono::Utc;

    fn batch(run: u64) -> ChangeBatch {
        ChangeBatch {
            evaluation: Uuid::generate(),
            run,
            at: Utc::now(),
            changes: Vec::new(),
        }
    }

    #[test]
    fn publish_reaches_every_stream() {
        let mut subs = Subscribers::new(4);
        let a = subs.subscribe();
        let b = subs.subscribe();
        subs.publish(&batch(1));
        assert_eq!(a.recv().unwrap().run, 1);
        assert_eq!(b.try_recv().unwrap().map(|b| b.run), Some(1));
    }

    #[test]
    fn full_stream_counts_drops() {
        let mut subs = Subscribers::new(1);
        let stream = subs.subscribe();
        subs.publish(&batch(1));
        subs.publish(&batch(2));
        assert_eq!(stream.dropped(), 1);
        assert_eq!(stream.recv().unwrap().run, 1);
    }

    #[test]
    fn dropped_stream_is_removed() {
        let mut subs = Subscribers::new(1);
        drop(subs.subscribe());
        subs.publish(&batch(1));
        assert_eq!(subs.len(), 0);
    }

    #[test]
    fn timeout_and_disconnect_are_distinct() {
        let mut subs = Subscribers::new(1);
        let stream = subs.subscribe();
        let err = stream.recv_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, EngineError::Execution(ExecError::Timeout { .. })));

        subs.clear();
        let err = stream.recv_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, EngineError::Execution(ExecError::Disconnected { .. })));
    }
}
