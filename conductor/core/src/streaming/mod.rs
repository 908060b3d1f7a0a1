//! Streaming Infrastructure for Concurrent Sessions
//!
//! This module holds the two moving parts between a backend and a client:
//! the [`DeltaChannel`] that validates one request's fragments, and the
//! [`StreamDispatcher`] that binds channels to sessions and relays their
//! output into sinks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       StreamDispatcher                            │
//! │                                                                  │
//! │   handle_request(session, question, sink)                        │
//! │        │                                                         │
//! │        ├─▶ SessionRegistry::get_or_create ──▶ Session            │
//! │        ├─▶ DeltaChannel::open(backend)                           │
//! │        ├─▶ Session::attach  (cancels the previous channel)       │
//! │        └─▶ spawn relay ── deltas ──▶ sink ── terminal ──▶ detach │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Deltas reach the sink in sequence order starting at 0
//! - Exactly one terminal callback, always last
//! - Nothing is delivered after a channel is cancelled
//! - Sessions are isolated: one failing channel never touches another

mod channel;
mod dispatcher;

pub use channel::{ChannelEvent, ChannelHandle, ChannelStats, DeltaChannel, TerminalMarker};
pub use dispatcher::{
    Answer, DispatchTicket, DispatcherConfig, DispatcherStats, StreamDispatcher, TerminalSummary,
};
