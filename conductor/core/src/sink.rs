//! Rendering Sinks
//!
//! The dispatcher pushes ordered deltas and exactly one terminal callback
//! into a [`DeltaSink`]. What the sink does with them (SSE frames, a test
//! transcript, a concatenated answer) is its own business.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, Semaphore};

use crate::error::StreamError;
use crate::messages::{Delta, StreamEvent};

/// The sink's consumer has gone away
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("sink closed")]
pub struct SinkClosed;

/// Receiver of one channel's output
///
/// `accept` may block to exert backpressure. After the last `accept`, exactly
/// one of `finish`, `fail` or `cancelled` is called.
#[async_trait]
pub trait DeltaSink: Send + Sync {
    /// Take one fragment
    async fn accept(&self, delta: Delta) -> Result<(), SinkClosed>;

    /// The answer completed
    async fn finish(&self);

    /// The answer failed
    async fn fail(&self, error: &StreamError);

    /// The answer was abandoned
    async fn cancelled(&self) {}
}

/// Sink that forwards [`StreamEvent`]s into a bounded channel
///
/// The HTTP layer turns the receiving half into a server-sent event stream.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    terminal_timeout: Duration,
}

impl EventSink {
    /// Create a sink and the receiver it feeds
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                terminal_timeout: Duration::from_secs(5),
            },
            rx,
        )
    }

    /// Bound on waiting for room for the terminal event
    #[must_use]
    pub fn with_terminal_timeout(mut self, timeout: Duration) -> Self {
        self.terminal_timeout = timeout;
        self
    }

    async fn send_terminal(&self, event: StreamEvent) {
        if let Err(e) = self.tx.send_timeout(event, self.terminal_timeout).await {
            tracing::debug!(error = %e, "Terminal event not delivered");
        }
    }
}

#[async_trait]
impl DeltaSink for EventSink {
    async fn accept(&self, delta: Delta) -> Result<(), SinkClosed> {
        self.tx
            .send(StreamEvent::from(&delta))
            .await
            .map_err(|_| SinkClosed)
    }

    async fn finish(&self) {
        self.send_terminal(StreamEvent::End).await;
    }

    async fn fail(&self, error: &StreamError) {
        self.send_terminal(StreamEvent::Error {
            message: error.to_string(),
        })
        .await;
    }

    async fn cancelled(&self) {
        // Best effort: the client that superseded this stream is usually
        // already reading a different one
        if let Err(e) = self.tx.try_send(StreamEvent::Cancelled) {
            tracing::debug!(error = %e, "Cancelled event not delivered");
        }
    }
}

/// One callback observed by a [`CollectingSink`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkRecord {
    /// `accept`
    Delta(Delta),
    /// `finish`
    Finished,
    /// `fail`
    Failed(StreamError),
    /// `cancelled`
    Cancelled,
}

impl SinkRecord {
    /// Whether this record ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

/// Sink that records everything it is given
///
/// Backs the non-streaming answer path and the test suites. A gated sink
/// blocks in `accept` until [`release`](Self::release) hands out permits,
/// which models a slow renderer.
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<SinkRecord>>,
    gate: Option<Arc<Semaphore>>,
    closed: AtomicBool,
    changed: Notify,
}

impl CollectingSink {
    /// Create a sink that accepts immediately
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink whose `accept` waits for a permit per delta
    #[must_use]
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    /// Let `n` more deltas through a gated sink
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Simulate the consumer going away
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.close();
        }
    }

    /// Everything recorded so far
    #[must_use]
    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().clone()
    }

    /// Accepted deltas in order
    #[must_use]
    pub fn deltas(&self) -> Vec<Delta> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::Delta(delta) => Some(delta.clone()),
                _ => None,
            })
            .collect()
    }

    /// Accepted text, concatenated
    #[must_use]
    pub fn text(&self) -> String {
        self.deltas().into_iter().map(|delta| delta.text).collect()
    }

    /// The terminal record, if one arrived
    #[must_use]
    pub fn terminal(&self) -> Option<SinkRecord> {
        self.records
            .lock()
            .iter()
            .find(|record| record.is_terminal())
            .cloned()
    }

    /// Wait until at least `n` records have arrived
    pub async fn wait_for_records(&self, n: usize) {
        loop {
            let changed = self.changed.notified();
            if self.records.lock().len() >= n {
                return;
            }
            changed.await;
        }
    }

    fn push(&self, record: SinkRecord) {
        self.records.lock().push(record);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl DeltaSink for CollectingSink {
    async fn accept(&self, delta: Delta) -> Result<(), SinkClosed> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| SinkClosed)?.forget();
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkClosed);
        }
        self.push(SinkRecord::Delta(delta));
        Ok(())
    }

    async fn finish(&self) {
        self.push(SinkRecord::Finished);
    }

    async fn fail(&self, error: &StreamError) {
        self.push(SinkRecord::Failed(error.clone()));
    }

    async fn cancelled(&self) {
        self.push(SinkRecord::Cancelled);
    }
}
