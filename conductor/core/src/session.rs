//! Session Management
//!
//! A session is the per-conversation state that owns at most one active
//! delta channel at a time.
//!
//! # State Machine
//!
//! ```text
//!            attach                 detach (end / error / cancel)
//!   Idle ───────────────▶ Streaming ─────────────────────────────▶ Idle
//!                          │    ▲
//!                          └────┘ attach (supersedes the old channel)
//!
//!   any state ── close ──▶ Closed (terminal)
//! ```
//!
//! # Concurrency
//!
//! `reserve`, `attach` and `close` are serialized per session by an async
//! operation gate, so two requests on the same session never interleave their
//! channel swaps. `detach` only takes the short state lock, which lets a
//! finishing relay report back while an `attach` is waiting for it to wind
//! down.
//!
//! A request takes a [`RequestTicket`] before it opens its backend stream.
//! Only the newest ticket may attach; a request whose open finishes after a
//! newer request reserved the session has lost, however long either open
//! took.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::StreamError;
use crate::messages::{ChannelId, SessionId};
use crate::streaming::ChannelHandle;

/// Session state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No channel is active
    Idle,
    /// A channel is streaming
    Streaming,
    /// Session has been closed; no further requests are accepted
    Closed,
}

/// Why a channel is being detached
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachReason {
    /// The backend finished the answer
    Completed,
    /// The channel failed
    Failed,
    /// The channel was cancelled
    Cancelled,
}

/// Per-session counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// When the session was created (Unix timestamp ms)
    pub created_at: u64,
    /// Channels attached
    pub requests: u64,
    /// Channels that completed
    pub completed: u64,
    /// Channels that failed
    pub failed: u64,
    /// Channels that were cancelled or superseded
    pub cancelled: u64,
}

/// A request's claim on a session, taken before its channel is opened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestTicket(u64);

struct SessionInner {
    state: SessionState,
    active: Option<ChannelHandle>,
    latest_request: u64,
    evicted: bool,
    last_activity: Instant,
    stats: SessionStats,
}

/// One client conversation
pub struct Session {
    id: SessionId,
    cancel_grace: Duration,
    inner: Mutex<SessionInner>,
    op_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("active", &inner.active.as_ref().map(ChannelHandle::id))
            .finish()
    }
}

impl Session {
    /// Create an idle session
    ///
    /// `cancel_grace` bounds how long `attach` and `close` wait for a
    /// displaced channel to wind down.
    #[must_use]
    pub fn new(id: SessionId, cancel_grace: Duration) -> Self {
        Self {
            id,
            cancel_grace,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                active: None,
                latest_request: 0,
                evicted: false,
                last_activity: Instant::now(),
                stats: SessionStats {
                    created_at: now_ms(),
                    ..Default::default()
                },
            }),
            op_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Get the session ID
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Whether the session has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// The channel currently owned by this session
    #[must_use]
    pub fn active_channel(&self) -> Option<ChannelId> {
        self.inner.lock().active.as_ref().map(ChannelHandle::id)
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.inner.lock().stats.clone()
    }

    /// Whether the session was closed by the idle sweep rather than by its
    /// client
    #[must_use]
    pub fn was_evicted(&self) -> bool {
        self.inner.lock().evicted
    }

    /// Reset the idle clock
    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    /// How long the session has been idle as of `now`
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.lock().last_activity)
    }

    /// Make `handle` the active channel
    ///
    /// Any channel already active is cancelled and awaited (bounded by the
    /// cancel grace) after the swap, so it can never deliver on behalf of
    /// this session again.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ClosedSession`] if the session is closed; the
    /// caller still owns `handle` and must stop it.
    pub async fn attach(&self, handle: ChannelHandle) -> Result<(), StreamError> {
        let _gate = self.op_gate.lock().await;

        let displaced = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return Err(StreamError::ClosedSession(self.id.clone()));
            }
            // Outranks any request still opening
            inner.latest_request += 1;
            let displaced = inner.active.replace(handle);
            inner.state = SessionState::Streaming;
            inner.last_activity = Instant::now();
            inner.stats.requests += 1;
            if displaced.is_some() {
                inner.stats.cancelled += 1;
            }
            displaced
        };

        if let Some(old) = displaced {
            tracing::debug!(
                session_id = %self.id,
                channel_id = %old.id(),
                "Superseding in-flight channel"
            );
            old.cancel_and_wait(self.cancel_grace).await;
        }

        Ok(())
    }

    /// Claim the session for a new request
    ///
    /// The channel currently streaming is cancelled and awaited (bounded)
    /// before this returns, so the new request's backend is only opened once
    /// the old answer has stopped. Any request that reserved earlier and has
    /// not attached yet is outranked.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ClosedSession`] if the session is closed.
    pub async fn reserve(&self) -> Result<RequestTicket, StreamError> {
        let _gate = self.op_gate.lock().await;

        let (ticket, displaced) = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return Err(StreamError::ClosedSession(self.id.clone()));
            }
            inner.latest_request += 1;
            inner.last_activity = Instant::now();
            let displaced = inner.active.take();
            if displaced.is_some() {
                inner.state = SessionState::Idle;
                inner.stats.cancelled += 1;
            }
            (RequestTicket(inner.latest_request), displaced)
        };

        if let Some(old) = displaced {
            tracing::debug!(
                session_id = %self.id,
                channel_id = %old.id(),
                "Cancelling in-flight channel for newer request"
            );
            old.cancel_and_wait(self.cancel_grace).await;
        }

        Ok(ticket)
    }

    /// Attach `handle` on behalf of the request holding `ticket`
    ///
    /// Returns false, leaving the session untouched, when a newer request
    /// has reserved the session since; the caller must cancel `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ClosedSession`] if the session was closed
    /// while the request was opening.
    pub async fn attach_reserved(
        &self,
        handle: ChannelHandle,
        ticket: RequestTicket,
    ) -> Result<bool, StreamError> {
        let _gate = self.op_gate.lock().await;

        let displaced = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return Err(StreamError::ClosedSession(self.id.clone()));
            }
            if inner.latest_request != ticket.0 {
                return Ok(false);
            }
            let displaced = inner.active.replace(handle);
            inner.state = SessionState::Streaming;
            inner.last_activity = Instant::now();
            inner.stats.requests += 1;
            if displaced.is_some() {
                inner.stats.cancelled += 1;
            }
            displaced
        };

        if let Some(old) = displaced {
            old.cancel_and_wait(self.cancel_grace).await;
        }

        Ok(true)
    }

    /// Release `channel_id` if it is still the active channel
    ///
    /// Returns false (and changes nothing) when a newer channel has already
    /// replaced it, or when it was detached before.
    pub fn detach(&self, channel_id: ChannelId, reason: DetachReason) -> bool {
        let mut inner = self.inner.lock();
        let is_active = inner
            .active
            .as_ref()
            .is_some_and(|active| active.id() == channel_id);
        if !is_active {
            return false;
        }

        inner.active = None;
        if inner.state == SessionState::Streaming {
            inner.state = SessionState::Idle;
        }
        inner.last_activity = Instant::now();
        match reason {
            DetachReason::Completed => inner.stats.completed += 1,
            DetachReason::Failed => inner.stats.failed += 1,
            DetachReason::Cancelled => inner.stats.cancelled += 1,
        }
        true
    }

    /// Close the session
    ///
    /// Cancels the active channel and waits for it (bounded). Closed is
    /// terminal; calling this again does nothing.
    pub async fn close(&self) {
        self.close_as(false).await;
    }

    /// Close the session on behalf of the idle sweep
    pub(crate) async fn evict(&self) {
        self.close_as(true).await;
    }

    async fn close_as(&self, evicted: bool) {
        let _gate = self.op_gate.lock().await;

        let active = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.evicted = evicted;
            let active = inner.active.take();
            if active.is_some() {
                inner.stats.cancelled += 1;
            }
            active
        };

        if let Some(handle) = active {
            handle.cancel_and_wait(self.cancel_grace).await;
        }

        tracing::info!(session_id = %self.id, evicted, "Session closed");
    }
}

/// Get current time in milliseconds since Unix epoch
fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
