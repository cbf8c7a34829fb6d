//! Chatstream Daemon - Resumable Streaming Chat over a Unix Socket
//!
//! Hosts the chatstream core behind a local Unix socket. Clients send one
//! JSON request line per connection and receive either `data:` frames
//! (streaming) or a single JSON line.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/chatstream/chatstream.toml if present)
//! chatstream-daemon
//!
//! # Custom socket path
//! chatstream-daemon --socket-path /tmp/chatstream.sock
//!
//! # With config file and JSON logs
//! chatstream-daemon --config /etc/chatstream.toml --log-format json
//!
//! # Verbose logging
//! RUST_LOG=debug chatstream-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use chatstream_core::config::{default_config_path, load_config_from_path};
use chatstream_core::{
    ConfigOverrides, InMemoryConversationStore, LogFormat, OpenAiCompatBackend, SessionRegistry,
    StreamOrchestrator,
};

use server::{DaemonServer, ServerConfig};

/// Chatstream Daemon - resumable streaming chat sessions over a Unix socket
#[derive(Parser, Debug)]
#[command(name = "chatstream-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "CHATSTREAM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// PID file path (defaults to the socket directory)
    #[arg(long, env = "CHATSTREAM_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CHATSTREAM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text, json)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    /// Model name passed to the backend
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Base URL of the OpenAI-compatible backend
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Seconds before an unfinished streaming session is reaped
    #[arg(long, value_name = "SECS")]
    session_timeout: Option<u64>,
}

impl Args {
    fn overrides(&self) -> Result<ConfigOverrides> {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref path) = self.socket_path {
            overrides = overrides.with_socket_path(path.clone());
        }
        if let Some(ref model) = self.model {
            overrides = overrides.with_model(model.clone());
        }
        if let Some(ref url) = self.base_url {
            overrides = overrides.with_base_url(url.clone());
        }
        if let Some(ref format) = self.log_format {
            overrides = overrides.with_log_format(format.parse::<LogFormat>()?);
        }
        if let Some(secs) = self.session_timeout {
            overrides = overrides.with_session_timeout_secs(secs);
        }
        Ok(overrides)
    }
}

/// PID file next to the socket
fn default_pid_path(socket_path: &Path) -> PathBuf {
    socket_path.with_file_name("chatstream.pid")
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

/// Refuse to start when the PID file names a live process
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
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
            "Another chatstream-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level and format
fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "chatstream_daemon={level},chatstream_core={level}"
        ))
    });

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides()?.apply(&mut config);
    config.validate()?;

    init_logging(&args.log_level, config.daemon.log_format);

    info!("Chatstream daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());
    info!(
        source = %config.source(),
        config_file = ?config.config_file_path,
        model = %config.backend.model,
        base_url = %config.backend.base_url,
        "Configuration loaded"
    );

    let socket_path = config.daemon.socket_path.clone();
    let pid_path = args
        .pid_file
        .clone()
        .unwrap_or_else(|| default_pid_path(&socket_path));

    info!(socket_path = ?socket_path, pid_path = ?pid_path, "Paths resolved");

    check_existing_daemon(&pid_path)?;
    write_pid_file(&pid_path)?;

    let backend = OpenAiCompatBackend::new(config.backend.clone())
        .context("Failed to create model backend")?;
    let orchestrator = Arc::new(
        StreamOrchestrator::new(
            Arc::new(backend),
            Arc::new(InMemoryConversationStore::new(
                config.limits.max_history_messages,
            )),
            SessionRegistry::new(),
        )
        .with_limits(config.limits.clone())
        .with_session_timeout(config.streaming.session_timeout),
    );
    let reaper = orchestrator.spawn_reaper(config.streaming.reap_interval);

    let shutdown = Arc::new(Notify::new());
    let shutdown_for_signals = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_for_signals.notify_one();
    });

    let server = DaemonServer::new(
        socket_path.clone(),
        ServerConfig {
            max_connections: config.daemon.max_connections,
        },
        Arc::clone(&orchestrator),
    );

    let result = server.run(shutdown).await;

    info!("Shutting down...");
    reaper.shutdown().await;
    remove_pid_file(&pid_path);

    if socket_path.exists() {
        if let Err(e) = fs::remove_file(&socket_path) {
            warn!(error = %e, "Failed to remove socket file");
        }
    }

    match result {
        Ok(()) => {
            info!("Chatstream daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
