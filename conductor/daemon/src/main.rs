//! Stream Conductor - Streaming Answer Server
//!
//! Serves generated answers to chat clients as server-sent events. Each
//! client conversation is a session; a new question on a session cancels
//! whatever answer it was still streaming.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (Ollama on localhost:11434, listen on 127.0.0.1:8000)
//! stream-conductor
//!
//! # Custom bind address and model
//! stream-conductor --host 0.0.0.0 --port 9000 --model llama3
//!
//! # With config file
//! stream-conductor --config /etc/stream-conductor/conductor.toml
//!
//! # Offline demo: answers echo the question
//! stream-conductor --backend scripted
//!
//! # Verbose logging
//! RUST_LOG=debug stream-conductor
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (open streams are cancelled)

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stream_conductor_core::{load_config_from_path, ConfigOverrides};
use stream_conductor_daemon::{build_backend, build_router, build_state, BackendKind};

/// Stream Conductor - streaming answer server
#[derive(Parser, Debug)]
#[command(name = "stream-conductor")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "CONDUCTOR_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Model to generate answers with
    #[arg(short = 'm', long, value_name = "NAME")]
    model: Option<String>,

    /// Generation backend
    #[arg(short = 'b', long, value_enum, default_value_t = BackendKind::Ollama)]
    backend: BackendKind,

    /// PID file path
    #[arg(long, env = "CONDUCTOR_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CONDUCTOR_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Get the default PID file path
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise /tmp/stream-conductor-$UID/
fn default_pid_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("stream-conductor")
            .join("conductor.pid")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/stream-conductor-{uid}/conductor.pid"))
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start if the PID file names a live process
fn check_existing_instance(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // Signal 0 only checks that the process exists
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another stream-conductor is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "stream_conductor_daemon={level},stream_conductor_core={level},stream_conductor={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Fire `shutdown` on the first SIGTERM or SIGINT
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown.cancel();
    });
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let mut config = load_config_from_path(args.config.clone())
        .context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(host) = args.host {
        overrides = overrides.with_host(host);
    }
    if let Some(port) = args.port {
        overrides = overrides.with_port(port);
    }
    if let Some(model) = args.model {
        overrides = overrides.with_model(model);
    }
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        bind = %config.server.bind_addr(),
        model = %config.backend.model,
        backend = ?args.backend,
        "Configuration loaded"
    );

    let backend = build_backend(args.backend, &config)
        .await
        .context("Failed to create generation backend")?;
    if !backend.health_check().await {
        warn!(backend = backend.name(), "Generation backend not reachable yet");
    }

    let bind_addr = config.server.bind_addr();
    let sweep_interval = config.sessions.sweep_interval;
    let idle_timeout = config.sessions.idle_timeout;
    let state = build_state(config, backend);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;
    let sweeper = state.dispatcher.registry().spawn_sweeper(
        sweep_interval,
        idle_timeout,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!(addr = %bind_addr, "Listening for connections");

    let router = build_router(state.clone());
    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
        .context("Server error")?;

    // Cancel whatever is still streaming before the process goes away
    shutdown.cancel();
    state.dispatcher.registry().close_all().await;
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Idle sweeper task failed");
    }

    let stats = state.dispatcher.stats();
    info!(
        opened = stats.channels_opened,
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        "Server stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Stream conductor starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);
    info!(pid_path = ?pid_path, "PID file path");

    check_existing_instance(&pid_path)?;
    write_pid_file(&pid_path)?;

    let result = run(args).await;

    info!("Shutting down...");
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Stream conductor stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Stream conductor stopped with error");
            Err(e)
        }
    }
}
