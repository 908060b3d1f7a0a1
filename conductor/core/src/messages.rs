//! Identifiers and Wire Events
//!
//! Types that cross the boundary between the conductor and the rendering
//! layer. A client names its conversation with a [`SessionId`]; every
//! generation request gets a fresh [`ChannelId`]; text flows out as
//! [`Delta`]s and reaches the client as [`StreamEvent`]s.
//!
//! # Wire Format
//!
//! Each [`StreamEvent`] becomes one server-push frame:
//!
//! ```text
//! event: delta
//! data: {"type":"delta","text":"Hel"}
//!
//! event: end
//! data: {"type":"end"}
//!
//! ```
//!
//! The explicit `end` frame lets a client tell graceful completion apart from
//! a dropped connection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted length of a client-supplied session token
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Session identifier
///
/// Opaque and stable for one client conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("session_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Parse a client-supplied session token
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSessionId`] when the token is empty, longer than
    /// [`MAX_SESSION_ID_LEN`], or contains characters outside `[A-Za-z0-9_-]`.
    pub fn parse(token: &str) -> Result<Self, InvalidSessionId> {
        if token.is_empty() {
            return Err(InvalidSessionId::Empty);
        }
        if token.len() > MAX_SESSION_ID_LEN {
            return Err(InvalidSessionId::TooLong(token.len()));
        }
        if let Some(c) = token
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(InvalidSessionId::BadCharacter(c));
        }
        Ok(Self(token.to_string()))
    }

    /// Borrow the raw token
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejection reason for a malformed session token
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InvalidSessionId {
    /// Token was empty
    #[error("session id must not be empty")]
    Empty,
    /// Token exceeded the length limit
    #[error("session id is {0} bytes, limit is {MAX_SESSION_ID_LEN}")]
    TooLong(usize),
    /// Token contained a disallowed character
    #[error("session id contains invalid character {0:?}")]
    BadCharacter(char),
}

/// Unique identifier for one delta channel
///
/// Allocated from a process-wide counter, so a value is never handed out
/// twice during the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate the next channel ID
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// One incremental fragment of generated text
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    /// Channel that produced this fragment
    pub channel_id: ChannelId,
    /// Position within the channel, starting at 0
    pub sequence: u64,
    /// The fragment text
    pub text: String,
}

/// Event pushed to a streaming client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A fragment of answer text
    Delta {
        /// The fragment text
        text: String,
    },
    /// The answer completed normally
    End,
    /// The answer failed
    Error {
        /// Human-readable failure description
        message: String,
    },
    /// The answer was abandoned because a newer request superseded it
    Cancelled,
}

impl StreamEvent {
    /// The `event:` field name used on the wire
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::End => "end",
            Self::Error { .. } => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// The `data:` payload (the event as compact JSON)
    #[must_use]
    pub fn data(&self) -> String {
        // Serializing a tagged enum of strings cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether this event ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta { .. })
    }
}

impl From<&Delta> for StreamEvent {
    fn from(delta: &Delta) -> Self {
        Self::Delta {
            text: delta.text.clone(),
        }
    }
}
