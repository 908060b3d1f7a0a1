//! Delta Channel
//!
//! The ordered, finite, non-restartable stream of text fragments produced by
//! one generation request. The channel validates what the backend sends and
//! turns it into [`ChannelEvent`]s ending in exactly one [`TerminalMarker`].
//!
//! # Cancellation
//!
//! Two tokens are involved:
//!
//! - the channel token, fired by whoever supersedes or closes the channel;
//!   the channel then yields [`TerminalMarker::Cancel`] and drops anything
//!   still buffered
//! - a child token handed to the backend producer; the channel fires it on
//!   its own (protocol violation, backpressure, client gone) without turning
//!   the terminal marker into a cancel
//!
//! Cancelling the channel token also fires the child, so the backend always
//! hears about a cancel.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendFragment, GenerationBackend, GenerationRequest};
use crate::error::StreamError;
use crate::messages::{ChannelId, Delta};

/// How a channel ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalMarker {
    /// The backend completed the answer
    End,
    /// The channel failed
    Error(StreamError),
    /// The channel was cancelled from outside
    Cancel,
}

impl TerminalMarker {
    /// Short label for logs and stats
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::End => "end",
            Self::Error(_) => "error",
            Self::Cancel => "cancel",
        }
    }
}

/// One item pulled from a channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// An in-order text fragment
    Delta(Delta),
    /// The final event; nothing follows it
    Terminal(TerminalMarker),
}

/// Counters for one channel
#[derive(Clone, Debug)]
pub struct ChannelStats {
    /// Fragments accepted
    pub deltas: u64,
    /// When the channel was opened
    pub started_at: Instant,
    /// When the last fragment was accepted
    pub last_delta_at: Option<Instant>,
}

/// Cheap, cloneable control handle for a live channel
///
/// The session keeps one of these for its active channel. Dropping the last
/// [`DeltaChannel`] marks the handle done.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    id: ChannelId,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl ChannelHandle {
    /// The channel's identity
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Request cancellation without waiting
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the channel's consumer has finished with it
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Cancel and wait until the channel has wound down
    ///
    /// Gives up after `grace` with a warning; returns whether the channel
    /// finished in time.
    pub async fn cancel_and_wait(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        let mut done = self.done.clone();
        let finished = tokio::time::timeout(grace, done.wait_for(|finished| *finished))
            .await
            .is_ok();
        if !finished {
            tracing::warn!(
                channel_id = %self.id,
                grace_ms = grace.as_millis() as u64,
                "Cancelled channel did not wind down within grace period, abandoning it"
            );
        }
        finished
    }
}

/// The consumer side of one generation request
pub struct DeltaChannel {
    id: ChannelId,
    receiver: mpsc::Receiver<BackendFragment>,
    /// Sequence number the next fragment must carry
    next_sequence: u64,
    terminal: bool,
    /// Fired from outside to cancel
    cancel: CancellationToken,
    /// Handed to the producer; fired on internal stops
    producer: CancellationToken,
    done: watch::Sender<bool>,
    stats: ChannelStats,
}

impl std::fmt::Debug for DeltaChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaChannel")
            .field("id", &self.id)
            .field("next_sequence", &self.next_sequence)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

impl DeltaChannel {
    /// Open a channel for `request` against `backend`
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::BackendUnavailable`] if the backend refuses or
    /// cannot be reached.
    pub async fn open(
        backend: &dyn GenerationBackend,
        request: &GenerationRequest,
    ) -> Result<Self, StreamError> {
        let cancel = CancellationToken::new();
        let producer = cancel.child_token();

        let receiver = backend
            .open(request, producer.clone())
            .await
            .map_err(|e| StreamError::BackendUnavailable(e.to_string()))?;

        Ok(Self::from_receiver(receiver, cancel, producer))
    }

    /// Wrap an already-open fragment receiver
    #[must_use]
    pub fn from_parts(receiver: mpsc::Receiver<BackendFragment>) -> Self {
        let cancel = CancellationToken::new();
        let producer = cancel.child_token();
        Self::from_receiver(receiver, cancel, producer)
    }

    fn from_receiver(
        receiver: mpsc::Receiver<BackendFragment>,
        cancel: CancellationToken,
        producer: CancellationToken,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id: ChannelId::next(),
            receiver,
            next_sequence: 0,
            terminal: false,
            cancel,
            producer,
            done,
            stats: ChannelStats {
                deltas: 0,
                started_at: Instant::now(),
                last_delta_at: None,
            },
        }
    }

    /// The channel's identity
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// A control handle for this channel
    #[must_use]
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            id: self.id,
            cancel: self.cancel.clone(),
            done: self.done.subscribe(),
        }
    }

    /// The outer cancellation token
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether a terminal marker has been yielded
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Tell the producer to stop without cancelling the channel
    pub fn stop_producer(&self) {
        self.producer.cancel();
    }

    /// Pull the next event
    ///
    /// Yields `None` once the terminal marker has been returned. Cancel-safe:
    /// dropping the future before it resolves loses nothing.
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        if self.terminal {
            return None;
        }

        let fragment = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                return Some(self.terminate(TerminalMarker::Cancel));
            }
            fragment = self.receiver.recv() => fragment,
        };

        let event = match fragment {
            Some(BackendFragment::Token { sequence, text }) => {
                if sequence != self.next_sequence {
                    tracing::warn!(
                        channel_id = %self.id,
                        expected = self.next_sequence,
                        received = sequence,
                        "Backend delivered fragment out of order"
                    );
                    self.stop_producer();
                    return Some(self.terminate(TerminalMarker::Error(StreamError::Protocol {
                        expected: self.next_sequence,
                        received: sequence,
                    })));
                }
                self.next_sequence += 1;
                self.stats.deltas += 1;
                self.stats.last_delta_at = Some(Instant::now());
                ChannelEvent::Delta(Delta {
                    channel_id: self.id,
                    sequence,
                    text,
                })
            }
            Some(BackendFragment::Complete) => self.terminate(TerminalMarker::End),
            Some(BackendFragment::Error(message)) => {
                self.terminate(TerminalMarker::Error(StreamError::Backend(message)))
            }
            None => self.terminate(TerminalMarker::Error(StreamError::Disconnected)),
        };

        Some(event)
    }

    fn terminate(&mut self, marker: TerminalMarker) -> ChannelEvent {
        self.terminal = true;
        ChannelEvent::Terminal(marker)
    }

    /// Wait for the producer to drop its sender
    ///
    /// Fragments still arriving are discarded. Returns whether the producer
    /// let go within `grace`; a producer that outlives it is abandoned with a
    /// warning.
    pub async fn release(&mut self, grace: Duration) -> bool {
        self.stop_producer();
        let drain = async {
            while self.receiver.recv().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_ok() {
            return true;
        }
        tracing::warn!(
            channel_id = %self.id,
            grace_ms = grace.as_millis() as u64,
            "Backend producer still holds its stream after grace period"
        );
        false
    }
}

impl Drop for DeltaChannel {
    fn drop(&mut self) {
        // Unblock anyone in cancel_and_wait
        self.producer.cancel();
        self.done.send_replace(true);
    }
}
