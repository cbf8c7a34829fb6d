//! Session Registry - Streaming Session Tracking
//!
//! In-memory table of active and recently-active streaming sessions, keyed by
//! connection identifier. Every streaming attempt gets its own entry; the
//! entry records the last delivered token index so a client that drops can be
//! told where to resume.
//!
//! # Architecture
//!
//! ```text
//!                       SessionRegistry
//!                  ┌──────────────────────────────────────┐
//!                  │ HashMap<ConnectionId, StreamSession> │
//!                  │   - wrapped in Arc<RwLock<>>         │
//!                  └───────┬──────────────┬───────────────┘
//!                          │              │
//!          ┌───────────────┼──────┐       │ reap_expired()
//!          │               │      │       │
//!   ┌──────▼──────┐ ┌──────▼────┐ │  ┌────▼──────────┐
//!   │ Orchestrator│ │  Resolver │ │  │ SessionReaper │
//!   │ (writes)    │ │  (reads)  │ │  │ (interval)    │
//!   └─────────────┘ └───────────┘ │  └───────────────┘
//!                          status lookups
//! ```
//!
//! # Thread Safety
//!
//! The registry uses `Arc<RwLock<>>` and is shared by cloning. Each write is
//! a single locked critical section; status lookups never block a stream for
//! longer than one map operation.

mod reaper;

pub use reaper::SessionReaper;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Default age after which an active session is considered abandoned
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Unique identifier for one streaming attempt
///
/// Assigned per attempt, not per conversation: a reconnect gets a new ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a connection ID from a raw value (for testing or deserialization)
    #[must_use]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, no token delivered yet
    Connecting,
    /// At least one token delivered
    Streaming,
    /// Ended with an `End` event
    Completed,
    /// Ended with an `Error` event
    Error,
}

impl SessionState {
    /// Whether the session is still running
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }

    /// Externally reported status
    #[must_use]
    pub fn status(self) -> SessionStatus {
        match self {
            Self::Connecting | Self::Streaming => SessionStatus::Active,
            Self::Completed => SessionStatus::Completed,
            Self::Error => SessionStatus::Error,
        }
    }
}

/// Status label reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Still streaming
    Active,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Error,
}

impl SessionStatus {
    /// Wire label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// The registry's record of one streaming attempt
#[derive(Debug, Clone)]
pub struct StreamSession {
    /// Connection identifier
    pub id: ConnectionId,
    /// Conversation the stream belongs to (`None` = stateless)
    pub conversation_id: Option<String>,
    /// Index of the last delivered token (the resume offset before any token)
    pub last_token_index: u64,
    /// Tokens delivered in this attempt
    pub tokens_delivered: u64,
    /// Lifecycle state
    pub state: SessionState,
    /// Creation instant, used for reaping
    pub created_at: Instant,
    /// Wall-clock creation time, used for reporting
    pub started_at: DateTime<Utc>,
}

impl StreamSession {
    /// Create a session in the `Connecting` state
    #[must_use]
    pub fn new(id: ConnectionId, conversation_id: Option<String>, resume_offset: u64) -> Self {
        Self {
            id,
            conversation_id,
            last_token_index: resume_offset,
            tokens_delivered: 0,
            state: SessionState::Connecting,
            created_at: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Whether the session has outlived `timeout` at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: Instant, timeout: Duration) -> bool {
        self.state.is_active() && now.saturating_duration_since(self.created_at) > timeout
    }

    /// Serializable view of the session
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.id.to_string(),
            conversation_id: self.conversation_id.clone(),
            status: self.state.status(),
            last_token_index: self.last_token_index,
            tokens_delivered: self.tokens_delivered,
            started_at: self.started_at,
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Point-in-time view of a session, as returned by status lookups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Connection identifier (`conn-<n>`)
    pub connection_id: String,
    /// Conversation identifier
    pub conversation_id: Option<String>,
    /// `active`, `completed` or `error`
    pub status: SessionStatus,
    /// Last delivered token index
    pub last_token_index: u64,
    /// Tokens delivered so far
    pub tokens_delivered: u64,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// Seconds since the attempt started
    pub age_secs: u64,
}

/// Registry of streaming sessions
///
/// Cheap to clone; all clones share the same table.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, StreamSession>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new streaming attempt
    ///
    /// Returns the assigned `ConnectionId`.
    pub fn register(&self, conversation_id: Option<&str>, resume_offset: u64) -> ConnectionId {
        let id = ConnectionId::new();
        let session = StreamSession::new(id, conversation_id.map(str::to_string), resume_offset);
        self.inner.write().insert(id, session);
        tracing::info!(
            connection_id = %id,
            conversation_id = conversation_id.unwrap_or("-"),
            resume_offset,
            "Session registered"
        );
        id
    }

    /// Record a delivered token
    ///
    /// Moves a `Connecting` session to `Streaming`. Returns `false` if the
    /// session is no longer registered (it was reaped).
    pub fn record_token(&self, id: &ConnectionId, token_index: u64) -> bool {
        let mut inner = self.inner.write();
        let Some(session) = inner.get_mut(id) else {
            return false;
        };
        session.last_token_index = session.last_token_index.max(token_index);
        session.tokens_delivered += 1;
        if session.state == SessionState::Connecting {
            session.state = SessionState::Streaming;
        }
        true
    }

    /// Set the lifecycle state
    ///
    /// Returns `false` if the session is not registered.
    pub fn set_state(&self, id: &ConnectionId, state: SessionState) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(id) {
            Some(session) => {
                tracing::debug!(
                    connection_id = %id,
                    from = ?session.state,
                    to = ?state,
                    "Session state changed"
                );
                session.state = state;
                true
            }
            None => false,
        }
    }

    /// Remove a session
    ///
    /// Returns the session if it was registered. Removing twice is harmless.
    pub fn remove(&self, id: &ConnectionId) -> Option<StreamSession> {
        let session = self.inner.write().remove(id);
        if let Some(ref session) = session {
            tracing::info!(
                connection_id = %id,
                status = session.state.status().as_str(),
                tokens = session.tokens_delivered,
                "Session removed"
            );
        }
        session
    }

    /// Snapshot of one session
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<SessionSnapshot> {
        self.inner.read().get(id).map(StreamSession::snapshot)
    }

    /// Check if a connection is registered
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Most recent session for a conversation, whatever its status
    #[must_use]
    pub fn find_by_conversation(&self, conversation_id: &str) -> Option<SessionSnapshot> {
        self.newest_matching(conversation_id, |_| true)
    }

    /// Most recent still-running session for a conversation
    #[must_use]
    pub fn find_active(&self, conversation_id: &str) -> Option<SessionSnapshot> {
        self.newest_matching(conversation_id, |s| s.state.is_active())
    }

    fn newest_matching<F>(&self, conversation_id: &str, predicate: F) -> Option<SessionSnapshot>
    where
        F: Fn(&StreamSession) -> bool,
    {
        self.inner
            .read()
            .values()
            .filter(|s| s.conversation_id.as_deref() == Some(conversation_id) && predicate(s))
            .max_by_key(|s| s.id.as_u64())
            .map(StreamSession::snapshot)
    }

    /// Get the number of registered sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Get the number of still-running sessions
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|s| s.state.is_active())
            .count()
    }

    /// Get a summary of all registered sessions
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read();
        let mut summary = RegistrySummary {
            total_sessions: inner.len(),
            ..RegistrySummary::default()
        };
        for session in inner.values() {
            match session.state.status() {
                SessionStatus::Active => summary.active += 1,
                SessionStatus::Completed => summary.completed += 1,
                SessionStatus::Error => summary.errored += 1,
            }
        }
        summary
    }

    /// Remove abandoned sessions
    ///
    /// Returns the number of sessions removed.
    pub fn reap_expired(&self, timeout: Duration) -> usize {
        self.reap_expired_at(Instant::now(), timeout)
    }

    /// Remove sessions that are still active and older than `timeout` at `now`
    ///
    /// Age must strictly exceed the timeout. Terminal sessions are left for
    /// their stream to remove. Returns the number of sessions removed.
    pub fn reap_expired_at(&self, now: Instant, timeout: Duration) -> usize {
        let mut inner = self.inner.write();
        let before = inner.len();

        inner.retain(|id, session| {
            let expired = session.is_expired_at(now, timeout);
            if expired {
                tracing::info!(
                    connection_id = %id,
                    age_secs = now.saturating_duration_since(session.created_at).as_secs(),
                    last_token_index = session.last_token_index,
                    "Removing abandoned session"
                );
            }
            !expired
        });

        let removed = before - inner.len();
        if removed > 0 {
            tracing::info!(
                removed = removed,
                remaining = inner.len(),
                "Reaped abandoned sessions"
            );
        }
        removed
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SessionRegistry")
            .field("session_count", &inner.len())
            .field("sessions", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Summary of registered sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    /// Total number of registered sessions
    pub total_sessions: usize,
    /// Sessions still streaming
    pub active: usize,
    /// Sessions that completed but are not yet removed
    pub completed: usize,
    /// Sessions that failed but are not yet removed
    pub errored: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::from_raw(42);
        assert_eq!(format!("{id}"), "conn-42");
    }

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_register_and_remove() {
        let registry = SessionRegistry::new();
        let id = registry.register(Some("c1"), 0);
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&id));

        let snapshot = registry.get(&id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Active);
        assert_eq!(snapshot.conversation_id.as_deref(), Some("c1"));

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_record_token_tracks_last_index() {
        let registry = SessionRegistry::new();
        let id = registry.register(None, 5);
        assert_eq!(registry.get(&id).unwrap().last_token_index, 5);

        assert!(registry.record_token(&id, 5));
        assert!(registry.record_token(&id, 6));
        let snapshot = registry.get(&id).unwrap();
        assert_eq!(snapshot.last_token_index, 6);
        assert_eq!(snapshot.tokens_delivered, 2);

        // Never decreases
        registry.record_token(&id, 1);
        assert_eq!(registry.get(&id).unwrap().last_token_index, 6);
    }

    #[test]
    fn test_record_token_on_missing_session() {
        let registry = SessionRegistry::new();
        assert!(!registry.record_token(&ConnectionId::from_raw(u64::MAX), 0));
    }

    #[test]
    fn test_state_transitions() {
        let registry = SessionRegistry::new();
        let id = registry.register(None, 0);
        registry.record_token(&id, 0);
        assert!(registry.set_state(&id, SessionState::Completed));
        assert_eq!(registry.get(&id).unwrap().status, SessionStatus::Completed);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_find_by_conversation_prefers_newest() {
        let registry = SessionRegistry::new();
        let first = registry.register(Some("c1"), 0);
        let second = registry.register(Some("c1"), 10);
        registry.register(Some("other"), 0);

        let found = registry.find_by_conversation("c1").unwrap();
        assert_eq!(found.connection_id, second.to_string());

        registry.set_state(&second, SessionState::Error);
        let active = registry.find_active("c1").unwrap();
        assert_eq!(active.connection_id, first.to_string());
        assert!(registry.find_by_conversation("missing").is_none());
    }

    #[test]
    fn test_summary_counts_statuses() {
        let registry = SessionRegistry::new();
        registry.register(None, 0);
        let done = registry.register(None, 0);
        let failed = registry.register(None, 0);
        registry.set_state(&done, SessionState::Completed);
        registry.set_state(&failed, SessionState::Error);

        assert_eq!(
            registry.summary(),
            RegistrySummary {
                total_sessions: 3,
                active: 1,
                completed: 1,
                errored: 1,
            }
        );
    }

    #[test]
    fn test_reap_is_strict_and_idempotent() {
        let registry = SessionRegistry::new();
        let id = registry.register(Some("c1"), 0);
        let created = registry.inner.read()[&id].created_at;
        let timeout = Duration::from_secs(300);

        // Exactly at the timeout: kept
        assert_eq!(registry.reap_expired_at(created + timeout, timeout), 0);
        assert!(registry.contains(&id));

        let later = created + timeout + Duration::from_secs(1);
        assert_eq!(registry.reap_expired_at(later, timeout), 1);
        assert_eq!(registry.reap_expired_at(later, timeout), 0);
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_reap_skips_terminal_sessions() {
        let registry = SessionRegistry::new();
        let id = registry.register(None, 0);
        registry.set_state(&id, SessionState::Completed);
        let created = registry.inner.read()[&id].created_at;

        let later = created + Duration::from_secs(3600);
        assert_eq!(registry.reap_expired_at(later, DEFAULT_SESSION_TIMEOUT), 0);
        assert!(registry.contains(&id));
    }

    #[test]
    fn test_snapshot_serializes_lowercase_status() {
        let registry = SessionRegistry::new();
        let id = registry.register(Some("c1"), 3);
        let json = serde_json::to_value(registry.get(&id).unwrap()).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["last_token_index"], 3);
        assert_eq!(json["connection_id"], id.to_string());
    }
}
