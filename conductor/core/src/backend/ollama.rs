//! Ollama Backend Implementation
//!
//! Generation backend for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/generate` - Generate completions
//! - `/api/pull` - Download a model so the first request is not a cold start
//! - `/api/tags` - List available models (used as a health probe)
//!
//! Streaming responses are newline-delimited JSON objects. Each carries a
//! `response` piece; the last one has `done: true`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::traits::{BackendError, BackendFragment, GenerationBackend, GenerationRequest};
use crate::config::BackendSettings;

/// One line of an `/api/generate` response
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Parse one NDJSON line; blank lines yield `Ok(None)`
fn parse_generate_line(line: &[u8]) -> Result<Option<GenerateLine>, serde_json::Error> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text).map(Some)
}

/// Send a fragment unless the request was cancelled first
///
/// Returns false when the producer should stop.
async fn emit(
    tx: &mpsc::Sender<BackendFragment>,
    cancel: &CancellationToken,
    fragment: BackendFragment,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(fragment) => sent.is_ok(),
    }
}

/// Forward one NDJSON line to the consumer
///
/// Returns false when the producer should stop (terminal line, cancelled, or
/// the consumer went away).
async fn forward_line(
    line: &[u8],
    sequence: &mut u64,
    tx: &mpsc::Sender<BackendFragment>,
    cancel: &CancellationToken,
) -> bool {
    let parsed = match parse_generate_line(line) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return true,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping unparseable generate line");
            return true;
        }
    };

    if let Some(error) = parsed.error {
        emit(tx, cancel, BackendFragment::Error(error)).await;
        return false;
    }

    if !parsed.response.is_empty() {
        let fragment = BackendFragment::Token {
            sequence: *sequence,
            text: parsed.response,
        };
        if !emit(tx, cancel, fragment).await {
            return false;
        }
        *sequence += 1;
    }

    if parsed.done {
        emit(tx, cancel, BackendFragment::Complete).await;
        return false;
    }

    true
}

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// Timeout for model pulls
    request_timeout: Duration,
    /// Capacity of the per-request fragment channel
    channel_capacity: usize,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed (TLS backend init).
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, BackendError> {
        Self::build(host.into(), port, Duration::from_secs(120), 100)
    }

    /// Create from the `[backend]` configuration section
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn from_settings(settings: &BackendSettings) -> Result<Self, BackendError> {
        Self::build(
            settings.host.clone(),
            settings.port,
            settings.request_timeout,
            settings.channel_capacity,
        )
    }

    fn build(
        host: String,
        port: u16,
        request_timeout: Duration,
        channel_capacity: usize,
    ) -> Result<Self, BackendError> {
        // No overall timeout on the client: a streamed answer may outlive any
        // fixed bound. Pulls set their own.
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            host,
            port,
            request_timeout,
            channel_capacity: channel_capacity.max(1),
            http_client,
        })
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get generate endpoint URL
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Get pull endpoint URL
    fn pull_url(&self) -> String {
        format!("{}/api/pull", self.base_url())
    }

    /// Build the JSON body for `/api/generate`
    fn request_body(request: &GenerationRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": request.full_prompt(),
            "stream": request.stream,
        });

        let mut options = serde_json::Map::new();
        if (request.temperature - 0.7).abs() > f32::EPSILON {
            options.insert("temperature".to_string(), serde_json::json!(request.temperature));
        }
        if request.max_tokens > 0 {
            options.insert("num_predict".to_string(), serde_json::json!(request.max_tokens));
        }
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }

        body
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            backend: self.name().to_string(),
            status,
            body,
        })
    }

    /// Ask Ollama to download `model` so the first question is not a cold start
    ///
    /// # Errors
    ///
    /// Returns an error if Ollama is unreachable or refuses the pull.
    pub async fn pull_model(&self, model: &str) -> Result<(), BackendError> {
        let response = self
            .http_client
            .post(self.pull_url())
            .timeout(self.request_timeout)
            .json(&serde_json::json!({ "name": model, "stream": false }))
            .send()
            .await?;
        self.check_status(response).await?;
        tracing::info!(model = %model, "Model pulled");
        Ok(())
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn open(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BackendFragment>, BackendError> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        let response = self
            .http_client
            .post(self.generate_url())
            .json(&Self::request_body(request))
            .send()
            .await?;
        let response = self.check_status(response).await?;

        let mut stream = response.bytes_stream();
        let model = request.model.clone();

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            let mut sequence: u64 = 0;

            loop {
                let chunk = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        tracing::debug!(model = %model, "Generation cancelled, closing connection");
                        return;
                    }
                    chunk = stream.next() => chunk,
                };

                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        emit(&tx, &cancel, BackendFragment::Error(e.to_string())).await;
                        return;
                    }
                    None => {
                        // A final line may lack its newline; otherwise the
                        // connection closed without a done marker
                        if !buffer.is_empty() {
                            forward_line(&buffer, &mut sequence, &tx, &cancel).await;
                        }
                        return;
                    }
                };

                // Split on raw bytes so multi-byte characters spanning two
                // chunks are decoded whole
                buffer.extend_from_slice(&bytes);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if !forward_line(&line, &mut sequence, &tx, &cancel).await {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
