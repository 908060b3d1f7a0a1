//! Stream Conductor Core - Streaming Response Session Manager
//!
//! This crate opens, multiplexes and tears down incremental text-generation
//! streams between clients and a generation backend. It is independent of
//! any transport: the daemon crate puts it behind HTTP, tests drive it
//! directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Clients                                │
//! │        (browser EventSource, curl, in-process sinks)             │
//! └───────────────────────────┬─────────────────────────────────────┘
//!              question + session id │ ▲ delta / end / error / cancelled
//! ┌───────────────────────────┼──────┼──────────────────────────────┐
//! │                    STREAM CONDUCTOR CORE                         │
//! │  ┌────────────────────────┴──────┴─────────────────────────────┐ │
//! │  │                    StreamDispatcher                          │ │
//! │  │  ┌──────────────┐  ┌──────────┐  ┌──────────────┐           │ │
//! │  │  │   Session    │  │ Session  │  │ DeltaChannel │           │ │
//! │  │  │   Registry   │─▶│          │─▶│              │           │ │
//! │  │  └──────────────┘  └──────────┘  └──────┬───────┘           │ │
//! │  └─────────────────────────────────────────┼───────────────────┘ │
//! └────────────────────────────────────────────┼─────────────────────┘
//!                                              │
//!                                   GenerationBackend (Ollama)
//! ```
//!
//! # Key Types
//!
//! - [`StreamDispatcher`]: Entry point; routes questions and relays answers
//! - [`SessionRegistry`]: Process-wide table of sessions
//! - [`Session`]: Owns at most one active channel
//! - [`DeltaChannel`]: Ordered fragments for one request
//! - [`DeltaSink`]: Where answers go
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use stream_conductor_core::{
//!     backend::OllamaBackend, DispatcherConfig, EventSink, RegistryConfig,
//!     SessionRegistry, StreamDispatcher,
//! };
//!
//! let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
//! let backend = Arc::new(OllamaBackend::new("localhost", 11434)?);
//! let dispatcher = StreamDispatcher::new(registry, backend, DispatcherConfig::default());
//!
//! let (sink, mut events) = EventSink::channel(64);
//! let ticket = dispatcher.handle_request(None, "Hello", Arc::new(sink)).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}: {}", event.event_name(), event.data());
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Generation backend abstraction (Ollama, scripted)
//! - [`config`]: TOML, environment and CLI configuration
//! - [`error`]: Failure taxonomy
//! - [`messages`]: Identifiers and wire events
//! - [`registry`]: Session registry and idle sweeping
//! - [`session`]: Per-conversation state machine
//! - [`sink`]: Rendering sinks
//! - [`streaming`]: Delta channels and the dispatcher

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod messages;
pub mod registry;
pub mod session;
pub mod sink;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    BackendError, BackendFragment, GenerationBackend, GenerationRequest, OllamaBackend, Script,
    ScriptedBackend,
};
pub use error::StreamError;
pub use messages::{ChannelId, Delta, InvalidSessionId, SessionId, StreamEvent};
pub use registry::{RegistryConfig, SessionRegistry};
pub use session::{DetachReason, RequestTicket, Session, SessionState, SessionStats};
pub use sink::{CollectingSink, DeltaSink, EventSink, SinkClosed, SinkRecord};

// Streaming exports
pub use streaming::{
    Answer, ChannelEvent, ChannelHandle, DeltaChannel, DispatchTicket, DispatcherConfig,
    DispatcherStats, StreamDispatcher, TerminalMarker, TerminalSummary,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BackendSettings, ConductorConfig,
    ConductorToml, ConfigError, ConfigOverrides, ConfigSource, ServerSettings, SessionSettings,
    StreamingSettings,
};
