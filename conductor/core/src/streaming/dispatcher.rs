//! Stream Dispatcher
//!
//! Accepts a question for a session, opens a delta channel against the
//! backend, and relays the channel's output into the caller's sink.
//!
//! # Relay Layout
//!
//! ```text
//!  backend ──▶ DeltaChannel ──▶ relay ──▶ [bounded buffer] ──▶ pump ──▶ sink
//!                                 │                              │
//!                                 └──────── halt token ──────────┘
//! ```
//!
//! The relay pulls from the channel and blocks when the buffer is full
//! (block-producer). If the buffer stays full longer than the backpressure
//! timeout the channel fails with [`StreamError::Backpressure`]. The pump
//! checks the channel's cancel token before every delivery, so nothing
//! reaches the sink after a cancel. Either side can halt the other.
//!
//! A new request on a session always wins. It reserves the session before
//! opening its backend stream, which cancels whatever the session was
//! streaming; a slower, older request that finishes opening afterwards is
//! cancelled instead of attached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::{ChannelEvent, DeltaChannel, TerminalMarker};
use crate::backend::{GenerationBackend, GenerationRequest};
use crate::config::ConductorConfig;
use crate::error::StreamError;
use crate::messages::{ChannelId, Delta, SessionId};
use crate::registry::SessionRegistry;
use crate::session::{DetachReason, RequestTicket, Session};
use crate::sink::{CollectingSink, DeltaSink};

/// Dispatcher settings
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Model passed to the backend
    pub model: String,
    /// Persona preamble
    pub system_prompt: Option<String>,
    /// Answer style hint
    pub style_hint: Option<String>,
    /// Deltas buffered between relay and sink
    pub buffer_capacity: usize,
    /// How long a full buffer may block the relay
    pub backpressure_timeout: Duration,
    /// Bound on waiting for a producer to let go after a terminal marker
    pub cancel_grace: Duration,
    /// Maximum question length in characters
    pub max_question_len: usize,
    /// Bound on the framed prompt in characters (0 = unbounded)
    pub max_prompt_chars: usize,
    /// Idle time after which sessions are swept
    pub idle_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            model: "phi:2".to_string(),
            system_prompt: None,
            style_hint: None,
            buffer_capacity: 64,
            backpressure_timeout: Duration::from_millis(5000),
            cancel_grace: Duration::from_millis(2000),
            max_question_len: 4000,
            max_prompt_chars: 8000,
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

impl DispatcherConfig {
    /// Derive dispatcher settings from the loaded configuration
    #[must_use]
    pub fn from_config(config: &ConductorConfig) -> Self {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        Self {
            model: config.backend.model.clone(),
            system_prompt: non_empty(&config.backend.system_prompt),
            style_hint: non_empty(&config.backend.style_hint),
            buffer_capacity: config.streaming.buffer_capacity.max(1),
            backpressure_timeout: config.streaming.backpressure_timeout,
            cancel_grace: config.sessions.cancel_grace,
            max_question_len: config.streaming.max_question_len,
            max_prompt_chars: config.streaming.max_prompt_chars,
            idle_timeout: config.sessions.idle_timeout,
        }
    }
}

/// What happened to one dispatched channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalSummary {
    /// Owning session
    pub session_id: SessionId,
    /// The channel
    pub channel_id: ChannelId,
    /// How it ended
    pub marker: TerminalMarker,
    /// Deltas handed to the sink
    pub delivered: u64,
}

/// Receipt for an accepted request
#[derive(Debug)]
pub struct DispatchTicket {
    /// Session the request runs on (generated if the caller sent none)
    pub session_id: SessionId,
    /// Channel carrying the answer
    pub channel_id: ChannelId,
    /// Resolves once the sink has seen its terminal callback
    pub completion: JoinHandle<TerminalSummary>,
}

/// Result of the non-streaming answer path
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Answer {
    /// Session the question ran on
    pub session_id: SessionId,
    /// Concatenated answer text
    pub answer: String,
    /// Whether a newer request cut the answer short
    pub cancelled: bool,
}

/// Dispatcher-wide counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Channels opened
    pub channels_opened: u64,
    /// Channels that completed
    pub completed: u64,
    /// Channels that failed (including failed opens)
    pub failed: u64,
    /// Channels that were cancelled
    pub cancelled: u64,
    /// Deltas handed to sinks
    pub deltas_relayed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    channels_opened: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    deltas_relayed: AtomicU64,
}

impl Counters {
    fn record(&self, marker: &TerminalMarker) {
        let counter = match marker {
            TerminalMarker::End => &self.completed,
            TerminalMarker::Error(_) => &self.failed,
            TerminalMarker::Cancel => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            deltas_relayed: self.deltas_relayed.load(Ordering::Relaxed),
        }
    }
}

/// Routes questions to sessions and relays answers to sinks
pub struct StreamDispatcher {
    registry: Arc<SessionRegistry>,
    backend: Arc<dyn GenerationBackend>,
    config: DispatcherConfig,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for StreamDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDispatcher")
            .field("backend", &self.backend.name())
            .field("sessions", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl StreamDispatcher {
    /// Create a dispatcher over `registry` and `backend`
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        backend: Arc<dyn GenerationBackend>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            backend,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// The session registry
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The generation backend
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn GenerationBackend> {
        &self.backend
    }

    /// Active settings
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    fn validate_question(&self, question: &str) -> Result<(), StreamError> {
        if question.trim().is_empty() {
            return Err(StreamError::InvalidRequest(
                "question must not be empty".to_string(),
            ));
        }
        let len = question.chars().count();
        if len > self.config.max_question_len {
            return Err(StreamError::InvalidRequest(format!(
                "question is {len} characters, limit is {}",
                self.config.max_question_len
            )));
        }
        Ok(())
    }

    fn build_request(&self, question: &str, context: Option<&str>) -> GenerationRequest {
        let mut request = GenerationRequest::new(question.trim(), self.config.model.clone())
            .with_max_prompt_chars(self.config.max_prompt_chars);
        if let Some(context) = context {
            request = request.with_context(context);
        }
        if let Some(system) = &self.config.system_prompt {
            request = request.with_system(system.clone());
        }
        if let Some(hint) = &self.config.style_hint {
            request = request.with_style_hint(hint.clone());
        }
        request
    }

    /// Start answering `question` on `session_id`
    ///
    /// A missing id creates a new session. Any answer already streaming on
    /// the session is cancelled. On success the answer streams into `sink`
    /// in the background; await the ticket's `completion` to observe the
    /// end.
    ///
    /// # Errors
    ///
    /// - [`StreamError::InvalidRequest`] for an empty or oversized question,
    ///   or when the session limit is reached
    /// - [`StreamError::ClosedSession`] if the session was closed
    /// - [`StreamError::BackendUnavailable`] if the backend could not be
    ///   opened; `sink.fail` has already been called in this case
    pub async fn handle_request(
        &self,
        session_id: Option<SessionId>,
        question: &str,
        sink: Arc<dyn DeltaSink>,
    ) -> Result<DispatchTicket, StreamError> {
        self.handle_request_with_context(session_id, question, None, sink)
            .await
    }

    /// Start answering `question` from the given reference `context`
    ///
    /// The context is placed ahead of the question and shortened to fit the
    /// configured prompt bound.
    ///
    /// # Errors
    ///
    /// Same as [`handle_request`](Self::handle_request).
    pub async fn handle_request_with_context(
        &self,
        session_id: Option<SessionId>,
        question: &str,
        context: Option<&str>,
        sink: Arc<dyn DeltaSink>,
    ) -> Result<DispatchTicket, StreamError> {
        self.validate_question(question)?;
        let request = self.build_request(question, context);
        self.dispatch(session_id, &request, sink).await
    }

    /// Start streaming a prompt used verbatim (no question framing)
    ///
    /// Used for the greeting shown when a chat opens.
    ///
    /// # Errors
    ///
    /// Same as [`handle_request`](Self::handle_request).
    pub async fn handle_prompt(
        &self,
        session_id: Option<SessionId>,
        prompt: &str,
        sink: Arc<dyn DeltaSink>,
    ) -> Result<DispatchTicket, StreamError> {
        if prompt.trim().is_empty() {
            return Err(StreamError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        let request = GenerationRequest::new(prompt, self.config.model.clone()).with_raw(true);
        self.dispatch(session_id, &request, sink).await
    }

    async fn dispatch(
        &self,
        session_id: Option<SessionId>,
        request: &GenerationRequest,
        sink: Arc<dyn DeltaSink>,
    ) -> Result<DispatchTicket, StreamError> {
        let session_id = session_id.unwrap_or_default();
        // Reserving cancels the answer in flight before the backend is asked
        // for a new one, even if that open then fails
        let (session, ticket) = self.reserve(&session_id).await?;

        let channel = match DeltaChannel::open(self.backend.as_ref(), request).await {
            Ok(channel) => channel,
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    backend = self.backend.name(),
                    error = %error,
                    "Failed to open channel"
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                sink.fail(&error).await;
                return Err(error);
            }
        };
        let channel_id = channel.id();

        let session = match session.attach_reserved(channel.handle(), ticket).await {
            Ok(attached) => {
                cancel_if_outranked(&session, &channel, attached);
                session
            }
            Err(StreamError::ClosedSession(_)) if session.was_evicted() => {
                // Swept while opening; the id starts over with a fresh session
                tracing::debug!(
                    session_id = %session_id,
                    channel_id = %channel_id,
                    "Session evicted while opening, re-resolving"
                );
                let (fresh, ticket) = match self.reserve(&session_id).await {
                    Ok(reserved) => reserved,
                    Err(error) => {
                        channel.stop_producer();
                        return Err(error);
                    }
                };
                match fresh.attach_reserved(channel.handle(), ticket).await {
                    Ok(attached) => {
                        cancel_if_outranked(&fresh, &channel, attached);
                        fresh
                    }
                    Err(error) => {
                        channel.stop_producer();
                        return Err(error);
                    }
                }
            }
            Err(error) => {
                channel.stop_producer();
                return Err(error);
            }
        };
        self.counters.channels_opened.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            session_id = %session_id,
            channel_id = %channel_id,
            "Channel opened"
        );

        let relay = Relay {
            session,
            sink,
            buffer_capacity: self.config.buffer_capacity.max(1),
            backpressure_timeout: self.config.backpressure_timeout,
            release_grace: self.config.cancel_grace,
            counters: Arc::clone(&self.counters),
        };
        let completion = tokio::spawn(relay.run(channel));

        Ok(DispatchTicket {
            session_id,
            channel_id,
            completion,
        })
    }

    /// Resolve `session_id` and claim it for a new request
    ///
    /// A session the idle sweep closed between lookup and claim is looked up
    /// once more, which yields a fresh session for the same id.
    async fn reserve(
        &self,
        session_id: &SessionId,
    ) -> Result<(Arc<Session>, RequestTicket), StreamError> {
        let session = self.registry.get_or_create(session_id)?;
        match session.reserve().await {
            Ok(ticket) => Ok((session, ticket)),
            Err(StreamError::ClosedSession(_)) if session.was_evicted() => {
                let session = self.registry.get_or_create(session_id)?;
                let ticket = session.reserve().await?;
                Ok((session, ticket))
            }
            Err(error) => Err(error),
        }
    }

    /// Answer `question` and return the whole text at once
    ///
    /// Runs a normal dispatch (so it supersedes and can be superseded) into
    /// a collecting sink.
    ///
    /// # Errors
    ///
    /// Any error from [`handle_request`](Self::handle_request), or the
    /// channel's failure if the answer did not complete.
    pub async fn ask(
        &self,
        session_id: Option<SessionId>,
        question: &str,
    ) -> Result<Answer, StreamError> {
        let sink = Arc::new(CollectingSink::new());
        let ticket = self
            .handle_request(session_id, question, Arc::clone(&sink) as Arc<dyn DeltaSink>)
            .await?;

        let summary = ticket.completion.await.map_err(|e| {
            tracing::error!(error = %e, "Relay task failed");
            StreamError::Disconnected
        })?;

        match summary.marker {
            TerminalMarker::End => Ok(Answer {
                session_id: ticket.session_id,
                answer: sink.text(),
                cancelled: false,
            }),
            TerminalMarker::Cancel => Ok(Answer {
                session_id: ticket.session_id,
                answer: sink.text(),
                cancelled: true,
            }),
            TerminalMarker::Error(error) => Err(error),
        }
    }

    /// Close and remove a session, cancelling its answer
    ///
    /// Returns false if the session did not exist.
    pub async fn close_session(&self, session_id: &SessionId) -> bool {
        self.registry.remove(session_id).await
    }

    /// Evict sessions idle longer than the configured timeout
    pub async fn sweep_idle(&self) -> Vec<SessionId> {
        self.registry.sweep_idle(self.config.idle_timeout).await
    }
}

/// Cancel `channel` if a newer request reserved the session while it was
/// opening
///
/// The relay still runs, so the sink sees a cancel and nothing else.
fn cancel_if_outranked(session: &Session, channel: &DeltaChannel, attached: bool) {
    if attached {
        return;
    }
    tracing::debug!(
        session_id = %session.id(),
        channel_id = %channel.id(),
        "Newer request took the session while opening, cancelling"
    );
    channel.handle().cancel();
}

/// Why the relay half stopped
enum RelayOutcome {
    /// The channel produced its terminal marker, or the relay failed it
    Terminal(TerminalMarker),
    /// The pump asked the relay to stop (sink closed)
    Halted,
}

/// Why the pump half stopped
enum PumpOutcome {
    /// Buffer drained after the relay finished
    Drained,
    /// The channel was cancelled
    Cancelled,
    /// The relay asked the pump to stop
    Halted,
    /// The sink's consumer went away
    SinkClosed,
}

/// Everything one relay task needs
struct Relay {
    session: Arc<Session>,
    sink: Arc<dyn DeltaSink>,
    buffer_capacity: usize,
    backpressure_timeout: Duration,
    release_grace: Duration,
    counters: Arc<Counters>,
}

impl Relay {
    async fn run(self, mut channel: DeltaChannel) -> TerminalSummary {
        let channel_id = channel.id();
        let session_id = self.session.id().clone();
        let cancel = channel.cancel_token();
        let halt = CancellationToken::new();
        let (buffer_tx, buffer_rx) = mpsc::channel::<Delta>(self.buffer_capacity);

        let (relay_outcome, (pump_outcome, delivered)) = tokio::join!(
            self.relay(&mut channel, buffer_tx, &cancel, &halt),
            self.pump(buffer_rx, &cancel, &halt),
        );

        let marker = match (relay_outcome, pump_outcome) {
            (_, PumpOutcome::Cancelled) => TerminalMarker::Cancel,
            (_, PumpOutcome::SinkClosed) | (RelayOutcome::Halted, _) => {
                tracing::debug!(
                    session_id = %session_id,
                    channel_id = %channel_id,
                    "Client went away, abandoning channel"
                );
                TerminalMarker::Cancel
            }
            (RelayOutcome::Terminal(marker), _) => marker,
        };

        match &marker {
            TerminalMarker::End => self.sink.finish().await,
            TerminalMarker::Error(error) => self.sink.fail(error).await,
            TerminalMarker::Cancel => self.sink.cancelled().await,
        }

        let reason = match &marker {
            TerminalMarker::End => DetachReason::Completed,
            TerminalMarker::Error(_) => DetachReason::Failed,
            TerminalMarker::Cancel => DetachReason::Cancelled,
        };
        self.session.detach(channel_id, reason);
        self.counters.record(&marker);

        match &marker {
            TerminalMarker::Error(error) => tracing::warn!(
                session_id = %session_id,
                channel_id = %channel_id,
                delivered,
                error = %error,
                "Channel failed"
            ),
            TerminalMarker::Cancel => tracing::debug!(
                session_id = %session_id,
                channel_id = %channel_id,
                delivered,
                "Channel cancelled"
            ),
            TerminalMarker::End => tracing::info!(
                session_id = %session_id,
                channel_id = %channel_id,
                delivered,
                "Channel completed"
            ),
        }

        channel.release(self.release_grace).await;

        TerminalSummary {
            session_id,
            channel_id,
            marker,
            delivered,
        }
    }

    /// Channel → buffer
    async fn relay(
        &self,
        channel: &mut DeltaChannel,
        buffer_tx: mpsc::Sender<Delta>,
        cancel: &CancellationToken,
        halt: &CancellationToken,
    ) -> RelayOutcome {
        loop {
            let event = tokio::select! {
                biased;
                event = channel.next() => event,
                () = halt.cancelled() => {
                    channel.stop_producer();
                    return RelayOutcome::Halted;
                }
            };

            let delta = match event {
                Some(ChannelEvent::Delta(delta)) => delta,
                Some(ChannelEvent::Terminal(marker)) => return RelayOutcome::Terminal(marker),
                // next() only yields None after a terminal marker
                None => return RelayOutcome::Terminal(TerminalMarker::End),
            };
            self.session.touch();

            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return RelayOutcome::Terminal(TerminalMarker::Cancel),
                () = halt.cancelled() => {
                    channel.stop_producer();
                    return RelayOutcome::Halted;
                }
                sent = buffer_tx.send_timeout(delta, self.backpressure_timeout) => sent,
            };

            match sent {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    channel.stop_producer();
                    halt.cancel();
                    return RelayOutcome::Terminal(TerminalMarker::Error(
                        StreamError::Backpressure {
                            capacity: self.buffer_capacity,
                            waited: self.backpressure_timeout,
                        },
                    ));
                }
                Err(SendTimeoutError::Closed(_)) => {
                    channel.stop_producer();
                    return RelayOutcome::Halted;
                }
            }
        }
    }

    /// Buffer → sink
    async fn pump(
        &self,
        mut buffer_rx: mpsc::Receiver<Delta>,
        cancel: &CancellationToken,
        halt: &CancellationToken,
    ) -> (PumpOutcome, u64) {
        let mut delivered = 0;
        loop {
            let delta = tokio::select! {
                biased;
                () = cancel.cancelled() => return (PumpOutcome::Cancelled, delivered),
                () = halt.cancelled() => return (PumpOutcome::Halted, delivered),
                delta = buffer_rx.recv() => delta,
            };
            let Some(delta) = delta else {
                return (PumpOutcome::Drained, delivered);
            };

            // An in-flight accept is abandoned on cancel
            let accepted = tokio::select! {
                biased;
                () = cancel.cancelled() => return (PumpOutcome::Cancelled, delivered),
                () = halt.cancelled() => return (PumpOutcome::Halted, delivered),
                accepted = self.sink.accept(delta) => accepted,
            };
            if accepted.is_err() {
                halt.cancel();
                return (PumpOutcome::SinkClosed, delivered);
            }
            delivered += 1;
            self.counters.deltas_relayed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
