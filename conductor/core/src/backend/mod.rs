//! Generation Backend Integration
//!
//! This module provides abstracted access to text-generation backends
//! through a common trait interface.
//!
//! # Available Backends
//!
//! - **Ollama**: Local LLM server (default)
//! - **Scripted**: Deterministic playback for tests and offline demos
//!
//! # Usage
//!
//! ```ignore
//! use stream_conductor_core::backend::{GenerationBackend, GenerationRequest, OllamaBackend};
//! use tokio_util::sync::CancellationToken;
//!
//! let backend = OllamaBackend::new("localhost", 11434)?;
//! let request = GenerationRequest::new("Hello!", "phi:2");
//! let rx = backend.open(&request, CancellationToken::new()).await?;
//! ```

mod ollama;
mod scripted;
mod traits;

pub use ollama::OllamaBackend;
pub use scripted::{Script, ScriptStep, ScriptedBackend};
pub use traits::{BackendError, BackendFragment, GenerationBackend, GenerationRequest};
