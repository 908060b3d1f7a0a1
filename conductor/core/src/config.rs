//! TOML Configuration File Support
//!
//! Centralized configuration loading for the stream conductor, supporting a
//! TOML file at `~/.config/stream-conductor/conductor.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//!
//! [backend]
//! host = "localhost"
//! port = 11434
//! model = "phi:2"
//! request_timeout_secs = 120
//! pull_on_start = true
//!
//! [sessions]
//! idle_timeout_secs = 1800
//! sweep_interval_secs = 60
//! cancel_grace_ms = 2000
//! max_sessions = 10000
//!
//! [streaming]
//! buffer_capacity = 64
//! backpressure_timeout_ms = 5000
//! backend_channel_capacity = 100
//! max_question_len = 4000
//! max_prompt_chars = 8000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persona preamble placed before every question
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly online assistant. \
Answer the question clearly and politely. If you do not know the answer, say so.";

/// Answer style hint placed after every streamed question
pub const DEFAULT_STYLE_HINT: &str =
    "format the answer as simple HTML (<p>, <ul>, <li>, <strong> where appropriate), at most 100 words";

/// Prompt used to generate the greeting shown when a chat opens
pub const DEFAULT_GREETING_PROMPT: &str = "You are a friendly online assistant. \
Answer briefly, clearly and politely, in at most 3 sentences.\n\nGreet the user and offer your help.";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Address to bind
    pub host: Option<String>,

    /// Port to bind
    pub port: Option<u16>,
}

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Ollama host
    pub host: Option<String>,

    /// Ollama port
    pub port: Option<u16>,

    /// Model to generate with
    pub model: Option<String>,

    /// Persona preamble
    pub system_prompt: Option<String>,

    /// Answer style hint
    pub style_hint: Option<String>,

    /// Greeting prompt for `/intro`
    pub greeting_prompt: Option<String>,

    /// Timeout for non-streaming calls in seconds
    pub request_timeout_secs: Option<u64>,

    /// Whether to pull the model at startup
    pub pull_on_start: Option<bool>,
}

/// Sessions section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsToml {
    /// Idle time after which a session is evicted, in seconds
    pub idle_timeout_secs: Option<u64>,

    /// How often the idle sweep runs, in seconds
    pub sweep_interval_secs: Option<u64>,

    /// Bound on waiting for a cancelled channel to wind down, in milliseconds
    pub cancel_grace_ms: Option<u64>,

    /// Maximum live sessions (0 = unbounded)
    pub max_sessions: Option<usize>,
}

/// Streaming section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Deltas buffered between relay and sink
    pub buffer_capacity: Option<usize>,

    /// How long a full buffer may block the relay, in milliseconds
    pub backpressure_timeout_ms: Option<u64>,

    /// Fragments buffered between backend producer and channel
    pub backend_channel_capacity: Option<usize>,

    /// Maximum question length in characters
    pub max_question_len: Option<usize>,

    /// Bound on the framed prompt in characters (0 = unbounded)
    pub max_prompt_chars: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Backend configuration section
    pub backend: BackendToml,

    /// Sessions configuration section
    pub sessions: SessionsToml,

    /// Streaming configuration section
    pub streaming: StreamingToml,
}

// =============================================================================
// Resolved Settings
// =============================================================================

/// HTTP listener settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSettings {
    /// Address to bind
    pub host: String,
    /// Port to bind
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl ServerSettings {
    /// `host:port` string for binding
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Generation backend settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendSettings {
    /// Ollama host
    pub host: String,
    /// Ollama port
    pub port: u16,
    /// Model to generate with
    pub model: String,
    /// Persona preamble
    pub system_prompt: String,
    /// Answer style hint
    pub style_hint: String,
    /// Greeting prompt for `/intro`
    pub greeting_prompt: String,
    /// Timeout for non-streaming calls
    pub request_timeout: Duration,
    /// Whether to pull the model at startup
    pub pull_on_start: bool,
    /// Fragments buffered between backend producer and channel
    pub channel_capacity: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 11434,
            model: "phi:2".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            style_hint: DEFAULT_STYLE_HINT.to_string(),
            greeting_prompt: DEFAULT_GREETING_PROMPT.to_string(),
            request_timeout: Duration::from_secs(120),
            pull_on_start: true,
            channel_capacity: 100,
        }
    }
}

/// Session lifecycle settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    /// Idle time after which a session is evicted
    pub idle_timeout: Duration,
    /// How often the idle sweep runs
    pub sweep_interval: Duration,
    /// Bound on waiting for a cancelled channel to wind down
    pub cancel_grace: Duration,
    /// Maximum live sessions (0 = unbounded)
    pub max_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
            cancel_grace: Duration::from_millis(2000),
            max_sessions: 10_000,
        }
    }
}

/// Delta relay settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingSettings {
    /// Deltas buffered between relay and sink
    pub buffer_capacity: usize,
    /// How long a full buffer may block the relay
    pub backpressure_timeout: Duration,
    /// Maximum question length in characters
    pub max_question_len: usize,
    /// Bound on the framed prompt in characters (0 = unbounded)
    pub max_prompt_chars: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            backpressure_timeout: Duration::from_millis(5000),
            max_question_len: 4000,
            max_prompt_chars: 8000,
        }
    }
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the stream conductor
///
/// Use [`load_config`] to load with proper priority handling, then apply
/// [`ConfigOverrides`] from the command line.
#[derive(Clone, Debug)]
pub struct ConductorConfig {
    /// HTTP listener
    pub server: ServerSettings,

    /// Generation backend
    pub backend: BackendSettings,

    /// Session lifecycle
    pub sessions: SessionSettings,

    /// Delta relay
    pub streaming: StreamingSettings,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            backend: BackendSettings::default(),
            sessions: SessionSettings::default(),
            streaming: StreamingSettings::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ConductorConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values that would make the conductor unusable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be non-zero".to_string(),
            ));
        }
        if self.backend.port == 0 {
            return Err(ConfigError::ValidationError(
                "backend.port must be non-zero".to_string(),
            ));
        }
        if self.backend.model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "backend.model must not be empty".to_string(),
            ));
        }
        if self.streaming.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.streaming.max_question_len == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.max_question_len must be at least 1".to_string(),
            ));
        }
        if self.sessions.cancel_grace.is_zero() {
            return Err(ConfigError::ValidationError(
                "sessions.cancel_grace_ms must be non-zero".to_string(),
            ));
        }
        if self.sessions.idle_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "sessions.idle_timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.sessions.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "sessions.sweep_interval_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/stream-conductor/conductor.toml` or
/// `~/.config/stream-conductor/conductor.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("stream-conductor").join("conductor.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ConductorConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ConductorConfig, ConfigError> {
    let mut config = ConductorConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConductorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ConductorConfig, toml: &ConductorToml) {
    // Server
    if let Some(ref host) = toml.server.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = toml.server.port {
        config.server.port = port;
    }

    // Backend
    if let Some(ref host) = toml.backend.host {
        config.backend.host.clone_from(host);
    }
    if let Some(port) = toml.backend.port {
        config.backend.port = port;
    }
    if let Some(ref model) = toml.backend.model {
        config.backend.model.clone_from(model);
    }
    if let Some(ref prompt) = toml.backend.system_prompt {
        config.backend.system_prompt.clone_from(prompt);
    }
    if let Some(ref hint) = toml.backend.style_hint {
        config.backend.style_hint.clone_from(hint);
    }
    if let Some(ref prompt) = toml.backend.greeting_prompt {
        config.backend.greeting_prompt.clone_from(prompt);
    }
    if let Some(secs) = toml.backend.request_timeout_secs {
        config.backend.request_timeout = Duration::from_secs(secs);
    }
    if let Some(pull) = toml.backend.pull_on_start {
        config.backend.pull_on_start = pull;
    }

    // Sessions
    if let Some(secs) = toml.sessions.idle_timeout_secs {
        config.sessions.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.sessions.sweep_interval_secs {
        config.sessions.sweep_interval = Duration::from_secs(secs);
    }
    if let Some(ms) = toml.sessions.cancel_grace_ms {
        config.sessions.cancel_grace = Duration::from_millis(ms);
    }
    if let Some(max) = toml.sessions.max_sessions {
        config.sessions.max_sessions = max;
    }

    // Streaming
    if let Some(capacity) = toml.streaming.buffer_capacity {
        config.streaming.buffer_capacity = capacity;
    }
    if let Some(ms) = toml.streaming.backpressure_timeout_ms {
        config.streaming.backpressure_timeout = Duration::from_millis(ms);
    }
    if let Some(capacity) = toml.streaming.backend_channel_capacity {
        config.backend.channel_capacity = capacity;
    }
    if let Some(len) = toml.streaming.max_question_len {
        config.streaming.max_question_len = len;
    }
    if let Some(max) = toml.streaming.max_prompt_chars {
        config.streaming.max_prompt_chars = max;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut ConductorConfig) {
    // Server
    if let Ok(host) = std::env::var("CONDUCTOR_HOST") {
        config.server.host = host;
        config.source = ConfigSource::Env;
    }
    if let Ok(port) = std::env::var("CONDUCTOR_PORT") {
        if let Ok(p) = port.parse::<u16>() {
            config.server.port = p;
            config.source = ConfigSource::Env;
        }
    }

    // Backend
    if let Ok(host) = std::env::var("OLLAMA_HOST") {
        config.backend.host = host;
        config.source = ConfigSource::Env;
    }
    if let Ok(port) = std::env::var("OLLAMA_PORT") {
        if let Ok(p) = port.parse::<u16>() {
            config.backend.port = p;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(model) = std::env::var("MODEL_NAME") {
        config.backend.model = model;
        config.source = ConfigSource::Env;
    }

    // Sessions
    if let Ok(timeout) = std::env::var("CONDUCTOR_IDLE_TIMEOUT") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.sessions.idle_timeout = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(grace) = std::env::var("CONDUCTOR_CANCEL_GRACE_MS") {
        if let Ok(ms) = grace.parse::<u64>() {
            config.sessions.cancel_grace = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }

    // Streaming
    if let Ok(capacity) = std::env::var("CONDUCTOR_BUFFER_CAPACITY") {
        if let Ok(n) = capacity.parse::<usize>() {
            config.streaming.buffer_capacity = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(timeout) = std::env::var("CONDUCTOR_BACKPRESSURE_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.streaming.backpressure_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Bind host override
    pub host: Option<String>,

    /// Bind port override
    pub port: Option<u16>,

    /// Model override
    pub model: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bind host override
    #[must_use]
    pub fn with_host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    /// Set bind port override
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ConductorConfig) {
        if self.host.is_some() || self.port.is_some() || self.model.is_some() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref host) = self.host {
            config.server.host.clone_from(host);
        }

        if let Some(port) = self.port {
            config.server.port = port;
        }

        if let Some(ref model) = self.model {
            config.backend.model.clone_from(model);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
