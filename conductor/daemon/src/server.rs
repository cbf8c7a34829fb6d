//! Daemon Server Implementation
//!
//! This module provides the server loop for the chatstream daemon:
//! - Accepts connections on a Unix socket (owner-only permissions)
//! - Serves one JSON request line per connection
//! - Streams envelopes back as `data: {...}\n\n` frames
//! - Tracks active connections and enforces a connection limit
//! - Supports graceful shutdown
//!
//! # Protocol
//!
//! ```text
//! client → {"kind":"stream","message":"hi","conversation_id":"c1","resume_offset":0}\n
//! server → data: {...,"event_type":"token"}\n\n  (repeated)
//!          data: {...,"event_type":"end"}\n\n    (or one "error" frame)
//!
//! client → {"kind":"wait","message":"hi","conversation_id":"c1"}\n
//! server → {"message":"...","context_id":"c1",...}\n
//!
//! client → {"kind":"status","conversation_id":"c1"}\n
//! client → {"kind":"health"}\n
//! ```
//!
//! A streaming client must keep its side of the socket open until the
//! terminal frame arrives: end-of-file on the request side is treated as a
//! disconnect and drops the stream, which releases its session.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn, Instrument};

use chatstream_core::{encode_frame, ChatError, ErrorPayload, SessionSnapshot, StreamOrchestrator};

/// Error code sent when a request line is not valid JSON
const INVALID_REQUEST: &str = "INVALID_REQUEST";

/// Error code sent when the connection limit is reached
const SERVER_BUSY: &str = "SERVER_BUSY";

// ============================================================================
// Requests and Responses
// ============================================================================

/// One client request, sent as a single JSON line
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Request {
    /// Stream a reply as envelope frames
    Stream {
        /// User message
        message: String,
        /// Conversation to continue
        #[serde(default)]
        conversation_id: Option<String>,
        /// Client-claimed position to continue numbering from
        #[serde(default)]
        resume_offset: u64,
    },
    /// Wait for the whole reply
    Wait {
        /// User message
        message: String,
        /// Conversation to continue
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// Most recent streaming session for a conversation
    Status {
        /// Conversation to look up
        conversation_id: String,
    },
    /// Service health
    Health,
}

/// Reply to a `status` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Conversation that was looked up
    pub conversation_id: String,
    /// Its most recent session, if one is registered
    pub session: Option<SessionSnapshot>,
}

// ============================================================================
// Server
// ============================================================================

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: std::time::Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Server configuration
    server_config: ServerConfig,
    /// Shared chat entry points
    orchestrator: Arc<StreamOrchestrator>,
    /// Active connection state (task handles, peer info)
    connection_states: Arc<DashMap<u64, ConnectionState>>,
    /// Daemon-local connection counter
    next_client_id: AtomicU64,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(
        socket_path: PathBuf,
        server_config: ServerConfig,
        orchestrator: Arc<StreamOrchestrator>,
    ) -> Self {
        Self {
            socket_path,
            server_config,
            orchestrator,
            connection_states: Arc::new(DashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Get peer credentials from Unix socket
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = libc::socklen_t::try_from(std::mem::size_of::<libc::ucred>()).ok()?;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Run the accept loop until `shutdown` is notified
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)?;
        }

        info!(
            path = ?self.socket_path,
            max_connections = self.server_config.max_connections,
            "Listening for connections"
        );

        let our_uid = unsafe { libc::getuid() };

        loop {
            let stream = tokio::select! {
                () = shutdown.notified() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let peer_uid = Self::get_peer_uid(&stream);
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    continue;
                }
            }

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!(
                    active_connections = self.connection_states.len(),
                    "Connection limit reached, rejecting new connection"
                );
                tokio::spawn(reject_busy(stream));
                continue;
            }

            let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            info!(
                client_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let orchestrator = Arc::clone(&self.orchestrator);
            let connection_states = Arc::clone(&self.connection_states);
            let (tracked_tx, tracked_rx) = oneshot::channel::<()>();
            let task_handle = tokio::spawn(
                async move {
                    // Wait until tracked so the removal below cannot precede the insert
                    let _ = tracked_rx.await;
                    if let Err(e) = handle_connection(&orchestrator, stream).await {
                        warn!(error = %e, "Connection handler failed");
                    }
                    connection_states.remove(&client_id);
                    debug!(
                        active_connections = connection_states.len(),
                        "Connection handler finished"
                    );
                }
                .instrument(tracing::info_span!("client", client_id)),
            );

            self.connection_states.insert(
                client_id,
                ConnectionState {
                    connected_at: std::time::Instant::now(),
                    peer_uid,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            let _ = tracked_tx.send(());
        }

        self.shutdown()
    }

    /// Abort open connections and remove the socket file
    fn shutdown(&self) -> Result<()> {
        info!(
            active_connections = self.connection_states.len(),
            "Initiating graceful shutdown"
        );

        let client_ids: Vec<u64> = self.connection_states.iter().map(|r| *r.key()).collect();
        for client_id in client_ids {
            if let Some((_, state)) = self.connection_states.remove(&client_id) {
                info!(
                    client_id,
                    peer_uid = ?state.peer_uid,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                state.abort_handle.abort();
            }
        }

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}

// ============================================================================
// Connection Handling
// ============================================================================

async fn reject_busy(stream: UnixStream) {
    let (_, mut write_half) = stream.into_split();
    let payload = ErrorPayload {
        error_code: SERVER_BUSY.to_string(),
        message: "Too many connections".to_string(),
    };
    if let Err(e) = write_json_line(&mut write_half, &payload).await {
        debug!(error = %e, "Failed to notify rejected client");
    }
}

/// Serve one request on one connection
async fn handle_connection(orchestrator: &StreamOrchestrator, stream: UnixStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        debug!("Client closed before sending a request");
        return Ok(());
    }

    let request: Request = match serde_json::from_str(line.trim_end()) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed request line");
            let payload = ErrorPayload {
                error_code: INVALID_REQUEST.to_string(),
                message: "Request must be one JSON object with a known kind".to_string(),
            };
            write_json_line(&mut write_half, &payload).await?;
            return Ok(write_half.shutdown().await?);
        }
    };

    match request {
        Request::Stream {
            message,
            conversation_id,
            resume_offset,
        } => {
            match orchestrator.stream_chat(&message, conversation_id.as_deref(), resume_offset) {
                Ok(stream) => {
                    forward_stream(stream, reader, &mut write_half).await?;
                }
                Err(e) => {
                    let err = ChatError::from(e);
                    info!(error_code = err.error_code(), "Stream request rejected");
                    write_json_line(&mut write_half, &err.payload()).await?;
                }
            }
        }
        Request::Wait {
            message,
            conversation_id,
        } => match orchestrator.complete(&message, conversation_id.as_deref()).await {
            Ok(reply) => write_json_line(&mut write_half, &reply).await?,
            Err(e) => write_json_line(&mut write_half, &e.payload()).await?,
        },
        Request::Status { conversation_id } => {
            let session = orchestrator.connection_status(&conversation_id);
            let response = StatusResponse {
                conversation_id,
                session,
            };
            write_json_line(&mut write_half, &response).await?;
        }
        Request::Health => {
            let report = orchestrator.health().await;
            write_json_line(&mut write_half, &report).await?;
        }
    }

    // The client may already be gone; nothing left to tell it.
    if let Err(e) = write_half.shutdown().await {
        debug!(error = %e, "Shutdown of write half failed");
    }
    Ok(())
}

/// Write envelopes as frames until the stream ends or the client leaves
///
/// Returning drops the stream, which releases its registry entry.
async fn forward_stream(
    mut stream: chatstream_core::EnvelopeStream,
    mut reader: BufReader<OwnedReadHalf>,
    write_half: &mut OwnedWriteHalf,
) -> Result<()> {
    let connection_id = stream.connection_id();
    let mut scratch = [0u8; 512];

    loop {
        tokio::select! {
            next = stream.next() => {
                let Some(envelope) = next else {
                    debug!(%connection_id, "Stream finished");
                    return Ok(());
                };
                let frame = encode_frame(&envelope)?;
                if let Err(e) = write_half.write_all(frame.as_bytes()).await {
                    info!(%connection_id, error = %e, "Client went away mid-stream");
                    return Ok(());
                }
            }
            read = reader.read(&mut scratch) => {
                match read {
                    Ok(0) | Err(_) => {
                        info!(%connection_id, "Client disconnected mid-stream");
                        return Ok(());
                    }
                    Ok(_) => {
                        debug!(%connection_id, "Ignoring extra input during stream");
                    }
                }
            }
        }
    }
}

async fn write_json_line<T: Serialize>(write_half: &mut OwnedWriteHalf, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    write_half.write_all(&line).await?;
    Ok(())
}
