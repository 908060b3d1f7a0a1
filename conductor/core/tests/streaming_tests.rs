//! End-to-end streaming tests
//!
//! These drive the dispatcher against the scripted backend and verify the
//! behavior a client can observe: ordering, supersession, failure
//! isolation, backpressure, idle eviction and requests racing each other.
//!
//! Time-dependent tests run on a paused clock and never sleep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stream_conductor_core::{
    BackendError, BackendFragment, CollectingSink, DeltaSink, DetachReason, DispatchTicket,
    DispatcherConfig, EventSink, GenerationBackend, GenerationRequest, RegistryConfig, Script,
    ScriptedBackend, SessionId, SessionRegistry, SessionState, SinkRecord, StreamDispatcher,
    StreamError, StreamEvent, TerminalMarker,
};

// =============================================================================
// Helpers
// =============================================================================

fn config() -> DispatcherConfig {
    DispatcherConfig {
        model: "test-model".to_string(),
        buffer_capacity: 4,
        backpressure_timeout: Duration::from_millis(200),
        cancel_grace: Duration::from_millis(500),
        idle_timeout: Duration::from_secs(30),
        ..DispatcherConfig::default()
    }
}

fn dispatcher(backend: &Arc<ScriptedBackend>) -> StreamDispatcher {
    dispatcher_over(Arc::clone(backend) as Arc<dyn GenerationBackend>)
}

fn dispatcher_over(backend: Arc<dyn GenerationBackend>) -> StreamDispatcher {
    let registry = Arc::new(SessionRegistry::new(RegistryConfig {
        cancel_grace: Duration::from_millis(500),
        max_sessions: 0,
    }));
    StreamDispatcher::new(registry, backend, config())
}

/// Echoing backend whose `open` waits for a go-ahead when the question
/// mentions "slow"
struct SlowOpenBackend {
    inner: ScriptedBackend,
    opening: Notify,
    proceed: Notify,
}

impl SlowOpenBackend {
    fn new() -> Self {
        Self {
            inner: ScriptedBackend::new(),
            opening: Notify::new(),
            proceed: Notify::new(),
        }
    }
}

#[async_trait]
impl GenerationBackend for SlowOpenBackend {
    fn name(&self) -> &'static str {
        "SlowOpen"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn open(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BackendFragment>, BackendError> {
        if request.prompt.contains("slow") {
            self.opening.notify_one();
            self.proceed.notified().await;
        }
        self.inner.open(request, cancel).await
    }
}

fn slow_dispatcher(backend: &Arc<SlowOpenBackend>) -> Arc<StreamDispatcher> {
    Arc::new(dispatcher_over(
        Arc::clone(backend) as Arc<dyn GenerationBackend>
    ))
}

/// Start a request in the background; the backend holds its open
fn spawn_request(
    dispatcher: &Arc<StreamDispatcher>,
    session_id: &SessionId,
    question: &'static str,
    sink: &Arc<CollectingSink>,
) -> JoinHandle<Result<DispatchTicket, StreamError>> {
    let dispatcher = Arc::clone(dispatcher);
    let session_id = session_id.clone();
    let sink = as_sink(sink);
    tokio::spawn(async move {
        dispatcher
            .handle_request(Some(session_id), question, sink)
            .await
    })
}

fn sink() -> Arc<CollectingSink> {
    Arc::new(CollectingSink::new())
}

fn as_sink(sink: &Arc<CollectingSink>) -> Arc<dyn DeltaSink> {
    Arc::clone(sink) as Arc<dyn DeltaSink>
}

async fn wait_for_producers(backend: &ScriptedBackend, expected: usize) {
    for _ in 0..1000 {
        if backend.live_producers() == expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(backend.live_producers(), expected);
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_deltas_arrive_contiguous_from_zero() {
    let backend = Arc::new(ScriptedBackend::new());
    let dispatcher = dispatcher(&backend);
    let sink = sink();

    // Nothing queued: the backend echoes the question word by word
    let ticket = dispatcher
        .handle_request(None, "one two three four", as_sink(&sink))
        .await
        .unwrap();
    let summary = ticket.completion.await.unwrap();

    assert_eq!(summary.marker, TerminalMarker::End);
    let sequences: Vec<u64> = sink.deltas().iter().map(|d| d.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert!(sink.deltas().iter().all(|d| d.channel_id == ticket.channel_id));
    assert_eq!(sink.text(), "one two three four");
    assert_eq!(sink.records().last(), Some(&SinkRecord::Finished));
}

#[tokio::test]
async fn test_sequence_gap_fails_channel() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(
        Script::new()
            .token_at(0, "a")
            .token_at(1, "b")
            .token_at(3, "d")
            .complete(),
    );
    let dispatcher = dispatcher(&backend);
    let sink = sink();

    let ticket = dispatcher
        .handle_request(None, "Count", as_sink(&sink))
        .await
        .unwrap();
    let summary = ticket.completion.await.unwrap();

    let expected = StreamError::Protocol {
        expected: 2,
        received: 3,
    };
    assert_eq!(summary.marker, TerminalMarker::Error(expected.clone()));
    assert_eq!(sink.text(), "ab");
    assert_eq!(sink.terminal(), Some(SinkRecord::Failed(expected)));

    // The session survives a protocol failure
    let session = dispatcher.registry().get(&ticket.session_id).unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.stats().failed, 1);
}

#[tokio::test]
async fn test_backend_disconnect_without_marker() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(Script::new().token("partial").drop_stream());
    let dispatcher = dispatcher(&backend);
    let sink = sink();

    let ticket = dispatcher
        .handle_request(None, "Hi", as_sink(&sink))
        .await
        .unwrap();
    let summary = ticket.completion.await.unwrap();

    assert_eq!(summary.marker, TerminalMarker::Error(StreamError::Disconnected));
    assert_eq!(sink.text(), "partial");
}

// =============================================================================
// Supersession
// =============================================================================

#[tokio::test]
async fn test_new_question_supersedes_in_flight_answer() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(Script::new().token("Hel").hold().token("lo").complete());
    backend.push_script(Script::answer(["Fine", ", thanks"]));
    let dispatcher = dispatcher(&backend);
    let session_id = SessionId::new();

    let first_sink = sink();
    let first = dispatcher
        .handle_request(Some(session_id.clone()), "Hello", as_sink(&first_sink))
        .await
        .unwrap();
    first_sink.wait_for_records(1).await;

    let second_sink = sink();
    let second = dispatcher
        .handle_request(Some(session_id.clone()), "How are you?", as_sink(&second_sink))
        .await
        .unwrap();

    // Attaching the second channel already waited for the first to wind down
    let first_summary = first.completion.await.unwrap();
    assert_eq!(first_summary.marker, TerminalMarker::Cancel);
    assert_eq!(first_sink.text(), "Hel");
    assert_eq!(first_sink.terminal(), Some(SinkRecord::Cancelled));

    let second_summary = second.completion.await.unwrap();
    assert_eq!(second_summary.marker, TerminalMarker::End);
    assert_eq!(second_sink.text(), "Fine, thanks");
    assert_ne!(first.channel_id, second.channel_id);

    // A late "lo" never shows up anywhere
    backend.release();
    wait_for_producers(&backend, 0).await;
    assert_eq!(first_sink.text(), "Hel");
    assert_eq!(second_sink.text(), "Fine, thanks");

    let session = dispatcher.registry().get(&session_id).unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    let stats = session.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cancelled, 1);
}

#[tokio::test]
async fn test_superseded_event_stream_ends_with_cancelled() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(Script::new().token("Hel").hold().complete());
    backend.push_script(Script::answer(["Bye"]));
    let dispatcher = dispatcher(&backend);
    let session_id = SessionId::new();

    let (first_sink, mut first_events) = EventSink::channel(8);
    let first = dispatcher
        .handle_request(Some(session_id.clone()), "Hello", Arc::new(first_sink))
        .await
        .unwrap();
    assert_eq!(
        first_events.recv().await,
        Some(StreamEvent::Delta { text: "Hel".into() })
    );

    let (second_sink, mut second_events) = EventSink::channel(8);
    let second = dispatcher
        .handle_request(Some(session_id), "Goodbye", Arc::new(second_sink))
        .await
        .unwrap();

    first.completion.await.unwrap();
    second.completion.await.unwrap();

    assert_eq!(first_events.recv().await, Some(StreamEvent::Cancelled));
    assert_eq!(first_events.recv().await, None);

    assert_eq!(
        second_events.recv().await,
        Some(StreamEvent::Delta { text: "Bye".into() })
    );
    assert_eq!(second_events.recv().await, Some(StreamEvent::End));
    assert_eq!(second_events.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_stubborn_producer_does_not_block_next_request() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_ignore_cancel(true);
    backend.push_script(Script::new().token("a").hold().token("late").complete());
    backend.push_script(Script::answer(["b"]));
    let dispatcher = dispatcher(&backend);
    let session_id = SessionId::new();

    let first_sink = sink();
    let first = dispatcher
        .handle_request(Some(session_id.clone()), "First", as_sink(&first_sink))
        .await
        .unwrap();
    first_sink.wait_for_records(1).await;

    let second_sink = sink();
    let second = dispatcher
        .handle_request(Some(session_id), "Second", as_sink(&second_sink))
        .await
        .unwrap();

    assert_eq!(first.completion.await.unwrap().marker, TerminalMarker::Cancel);
    assert_eq!(second.completion.await.unwrap().marker, TerminalMarker::End);
    assert_eq!(second_sink.text(), "b");

    // The first producer was abandoned, not waited on forever
    assert_eq!(backend.live_producers(), 1);
    backend.release();
    wait_for_producers(&backend, 0).await;
    assert_eq!(first_sink.text(), "a");
}

// =============================================================================
// Failure isolation
// =============================================================================

#[tokio::test]
async fn test_backend_unavailable_still_cancels_prior_answer() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(Script::new().token("Hel").hold().complete());
    let dispatcher = dispatcher(&backend);
    let session_id = SessionId::new();

    let first_sink = sink();
    let first = dispatcher
        .handle_request(Some(session_id.clone()), "Hello", as_sink(&first_sink))
        .await
        .unwrap();
    first_sink.wait_for_records(1).await;

    backend.set_unavailable(true);
    let second_sink = sink();
    let err = dispatcher
        .handle_request(Some(session_id.clone()), "Again", as_sink(&second_sink))
        .await
        .unwrap_err();

    assert!(matches!(err, StreamError::BackendUnavailable(_)));
    assert!(matches!(
        second_sink.records().as_slice(),
        [SinkRecord::Failed(StreamError::BackendUnavailable(_))]
    ));
    assert_eq!(first.completion.await.unwrap().marker, TerminalMarker::Cancel);

    // The session is usable again once the backend recovers
    backend.set_unavailable(false);
    let answer = dispatcher.ask(Some(session_id), "Back?").await.unwrap();
    assert_eq!(answer.answer, "Back?");
    assert_eq!(dispatcher.stats().failed, 1);
}

#[tokio::test]
async fn test_failure_on_one_session_leaves_others_streaming() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(Script::new().token("steady ").hold().token("on").complete());
    backend.push_script(Script::new().token("oops").fail("model crashed"));
    let dispatcher = dispatcher(&backend);

    let healthy_sink = sink();
    let healthy = dispatcher
        .handle_request(None, "Tell me", as_sink(&healthy_sink))
        .await
        .unwrap();
    healthy_sink.wait_for_records(1).await;

    let broken_sink = sink();
    let broken = dispatcher
        .handle_request(None, "Break", as_sink(&broken_sink))
        .await
        .unwrap();
    assert_ne!(healthy.session_id, broken.session_id);
    assert_eq!(
        broken.completion.await.unwrap().marker,
        TerminalMarker::Error(StreamError::Backend("model crashed".into()))
    );

    backend.release();
    assert_eq!(healthy.completion.await.unwrap().marker, TerminalMarker::End);
    assert_eq!(healthy_sink.text(), "steady on");
}

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    let backend = Arc::new(ScriptedBackend::new());
    let dispatcher = Arc::new(dispatcher(&backend));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let question = format!("question number {i}");
                let answer = dispatcher.ask(None, &question).await.unwrap();
                (question, answer)
            })
        })
        .collect();

    for task in tasks {
        let (question, answer) = task.await.unwrap();
        assert_eq!(answer.answer, question);
        assert!(!answer.cancelled);
    }
    assert_eq!(dispatcher.registry().len(), 8);
    assert_eq!(dispatcher.stats().completed, 8);
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_sink_fails_with_backpressure() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(Script::answer((0..10).map(|i| format!("t{i} "))));
    let dispatcher = dispatcher(&backend);
    let sink = Arc::new(CollectingSink::gated());

    let ticket = dispatcher
        .handle_request(None, "Flood me", as_sink(&sink))
        .await
        .unwrap();
    let summary = ticket.completion.await.unwrap();

    let expected = StreamError::Backpressure {
        capacity: 4,
        waited: Duration::from_millis(200),
    };
    assert_eq!(summary.marker, TerminalMarker::Error(expected.clone()));
    assert_eq!(summary.delivered, 0);
    assert_eq!(sink.records(), vec![SinkRecord::Failed(expected)]);
    assert_eq!(backend.live_producers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sink_keeping_pace_is_not_failed() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(Script::answer((0..10).map(|i| format!("t{i} "))));
    let dispatcher = dispatcher(&backend);
    let sink = Arc::new(CollectingSink::gated());
    sink.release(10);

    let ticket = dispatcher
        .handle_request(None, "Flood me", as_sink(&sink))
        .await
        .unwrap();
    let summary = ticket.completion.await.unwrap();

    assert_eq!(summary.marker, TerminalMarker::End);
    assert_eq!(summary.delivered, 10);
}

// =============================================================================
// Session lifecycle
// =============================================================================

#[tokio::test]
async fn test_close_session_cancels_and_releases_producer() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(Script::new().token("a").hold().token("b").complete());
    let dispatcher = dispatcher(&backend);
    let sink = sink();

    let ticket = dispatcher
        .handle_request(None, "Hi", as_sink(&sink))
        .await
        .unwrap();
    sink.wait_for_records(1).await;
    let session = dispatcher.registry().get(&ticket.session_id).unwrap();

    assert!(dispatcher.close_session(&ticket.session_id).await);
    assert!(session.is_closed());
    assert!(!dispatcher.registry().contains(&ticket.session_id));

    let summary = ticket.completion.await.unwrap();
    assert_eq!(summary.marker, TerminalMarker::Cancel);
    assert_eq!(sink.terminal(), Some(SinkRecord::Cancelled));
    assert_eq!(backend.live_producers(), 0);

    assert!(!dispatcher.close_session(&ticket.session_id).await);
}

#[tokio::test]
async fn test_reused_id_after_close_starts_fresh() {
    let backend = Arc::new(ScriptedBackend::new());
    let dispatcher = dispatcher(&backend);
    let session_id = SessionId::new();

    dispatcher.ask(Some(session_id.clone()), "first").await.unwrap();
    let old = dispatcher.registry().get(&session_id).unwrap();
    dispatcher.close_session(&session_id).await;

    dispatcher.ask(Some(session_id.clone()), "second").await.unwrap();
    let fresh = dispatcher.registry().get(&session_id).unwrap();
    assert!(!Arc::ptr_eq(&old, &fresh));
    assert_eq!(fresh.stats().requests, 1);
}

#[tokio::test]
async fn test_repeated_detach_is_noop() {
    let backend = Arc::new(ScriptedBackend::new());
    let dispatcher = dispatcher(&backend);

    let ticket = dispatcher
        .handle_request(None, "Hi there", as_sink(&sink()))
        .await
        .unwrap();
    let summary = ticket.completion.await.unwrap();
    let session = dispatcher.registry().get(&ticket.session_id).unwrap();
    let before = session.stats();

    assert!(!session.detach(summary.channel_id, DetachReason::Completed));
    assert!(!session.detach(summary.channel_id, DetachReason::Failed));
    assert_eq!(session.stats(), before);
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_are_swept() {
    let backend = Arc::new(ScriptedBackend::new());
    let dispatcher = dispatcher(&backend);

    let stale = dispatcher.ask(None, "old").await.unwrap().session_id;
    tokio::time::advance(Duration::from_secs(20)).await;
    let recent = dispatcher.ask(None, "new").await.unwrap().session_id;
    tokio::time::advance(Duration::from_secs(11)).await;

    let evicted = dispatcher.sweep_idle().await;
    assert_eq!(evicted, vec![stale.clone()]);
    assert!(!dispatcher.registry().contains(&stale));
    assert!(dispatcher.registry().contains(&recent));
}

#[tokio::test(start_paused = true)]
async fn test_streaming_keeps_session_alive() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_script(Script::new().token("a").hold().token("b").complete());
    let dispatcher = dispatcher(&backend);
    let sink = sink();

    let ticket = dispatcher
        .handle_request(None, "Slow", as_sink(&sink))
        .await
        .unwrap();
    sink.wait_for_records(1).await;

    tokio::time::advance(Duration::from_secs(25)).await;
    backend.release();
    ticket.completion.await.unwrap();
    tokio::time::advance(Duration::from_secs(25)).await;

    // Last activity was the final fragment, 25s ago
    assert!(dispatcher.sweep_idle().await.is_empty());
    assert!(dispatcher.registry().contains(&ticket.session_id));
}

// =============================================================================
// Races
// =============================================================================

#[tokio::test]
async fn test_newer_question_wins_over_slower_older_open() {
    let backend = Arc::new(SlowOpenBackend::new());
    let dispatcher = slow_dispatcher(&backend);
    let session_id = SessionId::parse("race").unwrap();

    let older_sink = sink();
    let older = spawn_request(&dispatcher, &session_id, "A slow", &older_sink);
    backend.opening.notified().await;

    // B is asked after A but its backend answers first
    let newer_sink = sink();
    let newer = dispatcher
        .handle_request(Some(session_id.clone()), "B", as_sink(&newer_sink))
        .await
        .unwrap();
    assert_eq!(newer.completion.await.unwrap().marker, TerminalMarker::End);

    backend.proceed.notify_one();
    let older = older.await.unwrap().unwrap();
    assert_eq!(older.completion.await.unwrap().marker, TerminalMarker::Cancel);

    assert_eq!(newer_sink.text(), "B");
    assert!(older_sink.deltas().is_empty());
    assert_eq!(older_sink.terminal(), Some(SinkRecord::Cancelled));

    let session = dispatcher.registry().get(&session_id).unwrap();
    assert_eq!(session.active_channel(), None);
    assert_eq!(session.stats().requests, 1);
    assert_eq!(session.stats().completed, 1);
}

#[tokio::test]
async fn test_new_question_cancels_prior_answer_before_opening() {
    let backend = Arc::new(SlowOpenBackend::new());
    backend
        .inner
        .push_script(Script::new().token("Hel").hold().complete());
    let dispatcher = slow_dispatcher(&backend);
    let session_id = SessionId::parse("ordered").unwrap();

    let first_sink = sink();
    let first = dispatcher
        .handle_request(Some(session_id.clone()), "Hello", as_sink(&first_sink))
        .await
        .unwrap();
    first_sink.wait_for_records(1).await;

    // The old answer is already cancelled while the new open is pending
    let second_sink = sink();
    let second = spawn_request(&dispatcher, &session_id, "slow follow-up", &second_sink);
    backend.opening.notified().await;
    assert_eq!(first.completion.await.unwrap().marker, TerminalMarker::Cancel);

    backend.proceed.notify_one();
    let second = second.await.unwrap().unwrap();
    assert_eq!(second.completion.await.unwrap().marker, TerminalMarker::End);
    assert_eq!(second_sink.text(), "slow follow-up");
}

#[tokio::test(start_paused = true)]
async fn test_request_racing_idle_sweep_keeps_session() {
    let backend = Arc::new(SlowOpenBackend::new());
    let dispatcher = slow_dispatcher(&backend);
    let session_id = SessionId::parse("returning").unwrap();

    dispatcher.ask(Some(session_id.clone()), "hello").await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;

    let sink = sink();
    let request = spawn_request(&dispatcher, &session_id, "slow again", &sink);
    backend.opening.notified().await;

    // The lookup counted as activity
    assert!(dispatcher.sweep_idle().await.is_empty());

    backend.proceed.notify_one();
    let ticket = request.await.unwrap().unwrap();
    assert_eq!(ticket.completion.await.unwrap().marker, TerminalMarker::End);
    assert_eq!(sink.text(), "slow again");
}

#[tokio::test(start_paused = true)]
async fn test_session_swept_while_opening_is_recreated() {
    let backend = Arc::new(SlowOpenBackend::new());
    let dispatcher = slow_dispatcher(&backend);
    let session_id = SessionId::parse("swept").unwrap();

    let sink = sink();
    let request = spawn_request(&dispatcher, &session_id, "slow start", &sink);
    backend.opening.notified().await;

    tokio::time::advance(Duration::from_secs(2)).await;
    let swept = dispatcher.registry().get(&session_id).unwrap();
    let evicted = dispatcher
        .registry()
        .sweep_idle(Duration::from_secs(1))
        .await;
    assert_eq!(evicted, vec![session_id.clone()]);
    assert!(swept.was_evicted());

    // Eviction is not a client close: the request lands on a fresh session
    backend.proceed.notify_one();
    let ticket = request.await.unwrap().unwrap();
    assert_eq!(ticket.completion.await.unwrap().marker, TerminalMarker::End);
    assert_eq!(sink.text(), "slow start");

    let current = dispatcher.registry().get(&session_id).unwrap();
    assert!(!Arc::ptr_eq(&swept, &current));
    assert_eq!(current.stats().completed, 1);
}

#[tokio::test]
async fn test_explicit_close_while_opening_is_reported() {
    let backend = Arc::new(SlowOpenBackend::new());
    let dispatcher = slow_dispatcher(&backend);
    let session_id = SessionId::parse("closing").unwrap();

    let sink = sink();
    let request = spawn_request(&dispatcher, &session_id, "slow goodbye", &sink);
    backend.opening.notified().await;

    let session = dispatcher.registry().get(&session_id).unwrap();
    session.close().await;

    backend.proceed.notify_one();
    let err = request.await.unwrap().unwrap_err();
    assert_eq!(err, StreamError::ClosedSession(session_id));
}
