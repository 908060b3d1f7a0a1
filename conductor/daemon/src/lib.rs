//! Stream Conductor Daemon
//!
//! HTTP front end for the streaming session manager. The binary in
//! `main.rs` wires configuration, logging and signals around the router
//! exported here; tests drive the router directly.

pub mod server;

use std::sync::Arc;

use stream_conductor_core::{
    BackendError, ConductorConfig, DispatcherConfig, GenerationBackend, OllamaBackend,
    RegistryConfig, ScriptedBackend, SessionRegistry, StreamDispatcher,
};

pub use server::{build_router, AppState, SESSION_HEADER};

/// Which generation backend to serve answers from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Ollama over HTTP
    #[default]
    Ollama,
    /// In-process echo backend (no model needed)
    Scripted,
}

/// Create the configured backend
///
/// For Ollama the configured model is pulled first when `pull_on_start` is
/// set. A failed pull is logged and the daemon starts anyway; requests will
/// report the backend as unavailable until the model is there.
///
/// # Errors
///
/// Returns an error if the HTTP client for Ollama cannot be built.
pub async fn build_backend(
    kind: BackendKind,
    config: &ConductorConfig,
) -> Result<Arc<dyn GenerationBackend>, BackendError> {
    match kind {
        BackendKind::Ollama => {
            let backend = OllamaBackend::from_settings(&config.backend)?;
            if config.backend.pull_on_start {
                let model = &config.backend.model;
                if let Err(e) = backend.pull_model(model).await {
                    tracing::warn!(model = %model, error = %e, "Model pull failed");
                }
            }
            Ok(Arc::new(backend))
        }
        BackendKind::Scripted => Ok(Arc::new(ScriptedBackend::with_channel_capacity(
            config.backend.channel_capacity,
        ))),
    }
}

/// Assemble registry, dispatcher and router state from `config`
pub fn build_state(config: ConductorConfig, backend: Arc<dyn GenerationBackend>) -> Arc<AppState> {
    let registry = Arc::new(SessionRegistry::new(RegistryConfig::from_config(&config)));
    let dispatcher =
        StreamDispatcher::new(registry, backend, DispatcherConfig::from_config(&config));
    Arc::new(AppState::new(dispatcher, config))
}
