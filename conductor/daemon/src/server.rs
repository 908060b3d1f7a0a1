//! HTTP Surface
//!
//! Puts the stream dispatcher behind a small axum router. Answers stream to
//! the browser as server-sent events, one `event:` per [`StreamEvent`]:
//!
//! ```text
//! GET /ask-stream?question=Hello&session_id=abc
//!
//! event: delta
//! data: {"type":"delta","text":"Hel"}
//!
//! event: delta
//! data: {"type":"delta","text":"lo"}
//!
//! event: end
//! data: {"type":"end"}
//! ```
//!
//! The session id is echoed in the `x-session-id` header so a client that
//! sent none can keep talking to the session it was given. Closing the
//! event stream counts as walking away: the answer is cancelled.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use stream_conductor_core::{
    ConductorConfig, DispatcherStats, EventSink, SessionId, StreamDispatcher, StreamError,
    StreamEvent,
};

/// Response header carrying the session id
pub const SESSION_HEADER: &str = "x-session-id";

/// Interval between SSE keep-alive comments
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state behind every route
pub struct AppState {
    /// Routes questions to sessions
    pub dispatcher: StreamDispatcher,
    /// Resolved configuration
    pub config: ConductorConfig,
}

impl AppState {
    /// Bundle a dispatcher with the configuration it was built from
    pub fn new(dispatcher: StreamDispatcher, config: ConductorConfig) -> Self {
        Self { dispatcher, config }
    }
}

/// Query string of `/ask` and `/ask-stream`
#[derive(Debug, Deserialize)]
pub struct AskQuery {
    /// The user's question
    #[serde(default)]
    pub question: String,
    /// Session to continue (a new one is created when absent)
    pub session_id: Option<String>,
}

/// Query string of `/intro`
#[derive(Debug, Deserialize)]
pub struct IntroQuery {
    /// Session to greet
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct BackendHealth {
    name: &'static str,
    reachable: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    backend: BackendHealth,
    sessions: usize,
    stats: DispatcherStats,
}

#[derive(Debug, Serialize)]
struct Problem {
    r#type: &'static str,
    title: &'static str,
    status: u16,
    detail: String,
}

/// Build the daemon's router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ask-stream", get(ask_stream))
        .route("/intro", get(intro))
        .route("/ask", get(ask))
        .route("/sessions/:id", delete(delete_session))
        .route("/health", get(health))
        .with_state(state)
}

async fn ask_stream(State(state): State<Arc<AppState>>, Query(query): Query<AskQuery>) -> Response {
    let session_id = match resolve_session(query.session_id.as_deref()) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let (sink, events) = EventSink::channel(state.config.streaming.buffer_capacity);
    let result = state
        .dispatcher
        .handle_request(Some(session_id.clone()), &query.question, Arc::new(sink))
        .await;
    stream_or_problem(result.map(|_| ()), &session_id, events)
}

async fn intro(State(state): State<Arc<AppState>>, Query(query): Query<IntroQuery>) -> Response {
    let session_id = match resolve_session(query.session_id.as_deref()) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let (sink, events) = EventSink::channel(state.config.streaming.buffer_capacity);
    let result = state
        .dispatcher
        .handle_prompt(
            Some(session_id.clone()),
            &state.config.backend.greeting_prompt,
            Arc::new(sink),
        )
        .await;
    stream_or_problem(result.map(|_| ()), &session_id, events)
}

async fn ask(State(state): State<Arc<AppState>>, Query(query): Query<AskQuery>) -> Response {
    let session_id = match resolve_session(query.session_id.as_deref()) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.dispatcher.ask(Some(session_id), &query.question).await {
        Ok(answer) => Json(answer).into_response(),
        Err(error) => map_error(&error),
    }
}

async fn delete_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(session_id) = SessionId::parse(&id) else {
        return problem(
            StatusCode::NOT_FOUND,
            "session_not_found",
            &format!("no session {id}"),
        );
    };

    if state.dispatcher.close_session(&session_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        problem(
            StatusCode::NOT_FOUND,
            "session_not_found",
            &format!("no session {session_id}"),
        )
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let backend = state.dispatcher.backend();
    Json(HealthResponse {
        ok: true,
        backend: BackendHealth {
            name: backend.name(),
            reachable: backend.health_check().await,
        },
        sessions: state.dispatcher.registry().len(),
        stats: state.dispatcher.stats(),
    })
}

/// Parse the caller's session id, or mint a new one
fn resolve_session(raw: Option<&str>) -> Result<SessionId, Response> {
    match raw {
        None | Some("") => Ok(SessionId::new()),
        Some(token) => SessionId::parse(token).map_err(|e| {
            problem(StatusCode::BAD_REQUEST, "invalid_session_id", &e.to_string())
        }),
    }
}

/// Turn a dispatch result into an event stream or a problem response
///
/// Backend failures are still streamed: the dispatcher has already queued an
/// `error` event on the sink, which is what an `EventSource` expects to see.
fn stream_or_problem(
    result: Result<(), StreamError>,
    session_id: &SessionId,
    events: mpsc::Receiver<StreamEvent>,
) -> Response {
    match result {
        Err(error) if error.is_client_fault() => map_error(&error),
        Ok(()) | Err(_) => sse_response(session_id, events),
    }
}

fn sse_response(session_id: &SessionId, events: mpsc::Receiver<StreamEvent>) -> Response {
    let stream = ReceiverStream::new(events).map(|event| {
        Ok::<_, Infallible>(Event::default().event(event.event_name()).data(event.data()))
    });

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response();
    if let Ok(value) = HeaderValue::from_str(session_id.as_str()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

fn map_error(error: &StreamError) -> Response {
    let detail = error.to_string();
    match error {
        StreamError::InvalidRequest(_) => {
            problem(StatusCode::BAD_REQUEST, "invalid_request", &detail)
        }
        StreamError::ClosedSession(_) => problem(StatusCode::CONFLICT, "session_closed", &detail),
        StreamError::BackendUnavailable(_) => problem(
            StatusCode::SERVICE_UNAVAILABLE,
            "backend_unavailable",
            &detail,
        ),
        StreamError::Protocol { .. }
        | StreamError::Backend(_)
        | StreamError::Disconnected
        | StreamError::Backpressure { .. } => {
            problem(StatusCode::BAD_GATEWAY, "generation_failed", &detail)
        }
    }
}

fn problem(status: StatusCode, title: &'static str, detail: &str) -> Response {
    (
        status,
        Json(json!(Problem {
            r#type: "about:blank",
            title,
            status: status.as_u16(),
            detail: detail.to_string(),
        })),
    )
        .into_response()
}
