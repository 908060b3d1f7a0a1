//! Generation Backend Traits
//!
//! Trait definitions for text-generation backends. The conductor treats a
//! backend as an opaque producer of ordered text fragments; everything about
//! models, prompts on the wire, and HTTP lives behind this trait.
//!
//! # Producer Contract
//!
//! [`GenerationBackend::open`] hands back the receiving half of a bounded
//! channel. The producer task owns the sender and:
//!
//! - numbers fragments 0, 1, 2, ... in send order
//! - ends with exactly one [`BackendFragment::Complete`] or
//!   [`BackendFragment::Error`], or simply drops the sender
//! - stops promptly and drops the sender once the cancellation token fires
//!
//! Dropping the sender is how the producer announces it has released its
//! connection, which is what lets the consumer bound cancellation.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fragment events from a generation backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendFragment {
    /// A piece of generated text
    Token {
        /// Producer-assigned position, starting at 0
        sequence: u64,
        /// The text piece
        text: String,
    },
    /// Generation completed successfully
    Complete,
    /// Generation failed mid-stream
    Error(String),
}

/// Errors from opening or running a backend request
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached
    #[error("backend unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("{backend} returned {status}: {body}")]
    Status {
        /// Backend name
        backend: String,
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// The backend refused to serve the request
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something that could not be understood
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

const CONTEXT_LABEL: &str = "Context:\n";

/// A single generation request
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// The user's question
    pub prompt: String,
    /// Model to use (backend-specific identifier)
    pub model: String,
    /// Whether to stream the response
    pub stream: bool,
    /// Maximum tokens in response (0 = backend default)
    pub max_tokens: u32,
    /// Temperature (0.0-1.0, higher = more creative)
    pub temperature: f32,
    /// Preamble placed before the question
    pub system: Option<String>,
    /// Answer style instruction placed after the question
    pub style_hint: Option<String>,
    /// Reference material the answer should draw on
    pub context: Option<String>,
    /// Bound on the framed prompt in characters (0 = unbounded); the
    /// context is shortened to fit
    pub max_prompt_chars: usize,
    /// Send `prompt` verbatim, without question framing
    pub raw: bool,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: String::new(),
            stream: true,
            max_tokens: 0,
            temperature: 0.7,
            system: None,
            style_hint: None,
            context: None,
            max_prompt_chars: 0,
            raw: false,
        }
    }
}

impl GenerationRequest {
    /// Create a new request with prompt and model
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set system preamble
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set answer style hint
    #[must_use]
    pub fn with_style_hint(mut self, hint: impl Into<String>) -> Self {
        self.style_hint = Some(hint.into());
        self
    }

    /// Set reference context
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Bound the framed prompt length
    #[must_use]
    pub fn with_max_prompt_chars(mut self, max: usize) -> Self {
        self.max_prompt_chars = max;
        self
    }

    /// Send the prompt verbatim
    #[must_use]
    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Assemble the full prompt text sent to the model
    ///
    /// Layout: preamble, blank line, optional `Context:` block, `Question:
    /// ...`, optional `Answer style: ...`, then a trailing `Answer:` cue. When
    /// `max_prompt_chars` is set the context is cut from the end to fit, and
    /// dropped if nothing of it fits. Raw requests are sent as-is.
    #[must_use]
    pub fn full_prompt(&self) -> String {
        if self.raw {
            return self.prompt.clone();
        }

        let mut head = String::new();
        if let Some(ref system) = self.system {
            head.push_str(system);
            head.push_str("\n\n");
        }

        let mut tail = String::new();
        tail.push_str("Question: ");
        tail.push_str(&self.prompt);
        tail.push('\n');
        if let Some(ref hint) = self.style_hint {
            tail.push_str("Answer style: ");
            tail.push_str(hint);
            tail.push('\n');
        }
        tail.push_str("Answer:");

        let context = self
            .context
            .as_deref()
            .and_then(|context| self.fit_context(context, &head, &tail));

        let mut full_prompt = head;
        if let Some(context) = context {
            full_prompt.push_str(CONTEXT_LABEL);
            full_prompt.push_str(context);
            full_prompt.push_str("\n\n");
        }
        full_prompt.push_str(&tail);
        full_prompt
    }

    /// The part of `context` that fits between `head` and `tail`
    fn fit_context<'a>(&self, context: &'a str, head: &str, tail: &str) -> Option<&'a str> {
        let context = context.trim();
        if context.is_empty() {
            return None;
        }
        if self.max_prompt_chars == 0 {
            return Some(context);
        }

        let framing = head.chars().count() + tail.chars().count() + CONTEXT_LABEL.len() + 2;
        let budget = self.max_prompt_chars.checked_sub(framing)?;
        if budget == 0 {
            return None;
        }
        match context.char_indices().nth(budget) {
            Some((cut, _)) => Some(&context[..cut]),
            None => Some(context),
        }
    }
}

/// Generation backend trait
///
/// Implement this trait to plug a different text-generation provider into
/// the dispatcher.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Get the backend name (e.g., "Ollama")
    fn name(&self) -> &'static str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Open a streaming generation
    ///
    /// Returns once the backend has accepted the request; fragments then
    /// arrive on the returned receiver. The producer must stop and drop its
    /// sender when `cancel` fires.
    async fn open(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BackendFragment>, BackendError>;
}
