//! Stream Failure Taxonomy
//!
//! Every failure is local to one channel. None of these are fatal to the
//! process, and a session that saw one can accept a new request right away.
//!
//! Supersession is deliberately absent: a channel cancelled because a newer
//! request arrived ends with [`TerminalMarker::Cancel`], which is expected
//! behavior and not an error.
//!
//! [`TerminalMarker::Cancel`]: crate::streaming::TerminalMarker::Cancel

use std::time::Duration;

use thiserror::Error;

use crate::messages::SessionId;

/// Errors surfaced by channels, sessions, and the dispatcher
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A request targeted a session that has been closed
    #[error("session {0} is closed")]
    ClosedSession(SessionId),

    /// The backend delivered fragments out of order or twice
    #[error("protocol violation: expected sequence {expected}, received {received}")]
    Protocol {
        /// Sequence number the channel was waiting for
        expected: u64,
        /// Sequence number that actually arrived
        received: u64,
    },

    /// The backend could not be reached when opening the channel
    #[error("generation backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The sink could not keep pace and the buffer stayed full too long
    #[error("sink too slow: buffer of {capacity} deltas stayed full for {waited:?}")]
    Backpressure {
        /// Configured buffer bound
        capacity: usize,
        /// How long the producer was blocked before giving up
        waited: Duration,
    },

    /// The backend reported a failure mid-stream
    #[error("generation failed: {0}")]
    Backend(String),

    /// The backend released the stream without a completion marker
    #[error("stream disconnected unexpectedly")]
    Disconnected,

    /// The request itself was rejected before any channel was opened
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StreamError {
    /// Whether the client caused this error (bad input, closed session)
    #[must_use]
    pub fn is_client_fault(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::ClosedSession(_))
    }
}
