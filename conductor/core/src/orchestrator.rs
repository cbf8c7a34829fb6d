//! Stream Orchestrator
//!
//! Drives one streaming session end to end: validates the request, resolves
//! the resume offset, registers the session, pulls deltas from the model
//! runner and turns them into ordered [`Envelope`]s.
//!
//! # Session Lifecycle
//!
//! ```text
//!   stream_chat()                first token          End / Error
//!  ──────────────► CONNECTING ──────────────► STREAMING ──────────► COMPLETED | ERROR
//!        │                                                                │
//!        └──────────── EnvelopeStream dropped or finished ────────────────┴──► removed
//! ```
//!
//! The registry entry is created before [`stream_chat`] returns and removed
//! when the returned [`EnvelopeStream`] finishes or is dropped, whether or
//! not it was ever polled.
//!
//! [`stream_chat`]: StreamOrchestrator::stream_chat

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::backend::{ModelRunner, RunnerEvent};
use crate::conversation::ConversationStore;
use crate::envelope::{Envelope, DEFAULT_CONTEXT_ID};
use crate::error::{ChatError, InStreamError};
use crate::registry::{
    ConnectionId, SessionReaper, SessionRegistry, SessionSnapshot, SessionState,
    DEFAULT_SESSION_TIMEOUT,
};
use crate::resolver::{self, ResumeDecision};
use crate::security::{ChatLimits, InputValidator, ValidationError};

// ============================================================================
// Results
// ============================================================================

/// Reply to a synchronous chat request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    /// Generated text
    pub message: String,
    /// Conversation the request belonged to, `"default"` when stateless
    pub context_id: String,
    /// Rough token count of `message`
    pub token_count: u32,
    /// Wall time spent in the runner
    pub processing_time_ms: u64,
}

/// Service health snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `healthy` when the runner is reachable, `degraded` otherwise
    pub status: String,
    /// Runner name
    pub runner: String,
    /// Whether the runner answered its health check
    pub runner_reachable: bool,
    /// Registered streaming sessions
    pub active_connections: usize,
    /// Conversations held by the store
    pub conversations: usize,
}

// ============================================================================
// Envelope Stream
// ============================================================================

/// Removes a session from the registry exactly once
struct SessionGuard {
    registry: SessionRegistry,
    id: ConnectionId,
    released: bool,
}

impl SessionGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.registry.remove(&self.id).is_none() {
            tracing::debug!(connection_id = %self.id, "Session already removed");
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Lazy, single-pass sequence of envelopes for one streaming attempt
///
/// Ends after exactly one terminal envelope. Dropping it at any point
/// releases the session.
pub struct EnvelopeStream {
    connection_id: ConnectionId,
    decision: ResumeDecision,
    inner: Pin<Box<dyn Stream<Item = Envelope> + Send>>,
    guard: SessionGuard,
}

impl EnvelopeStream {
    /// Connection identifier of this attempt
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// How the resume offset was interpreted
    #[must_use]
    pub fn decision(&self) -> &ResumeDecision {
        &self.decision
    }
}

impl Stream for EnvelopeStream {
    type Item = Envelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.guard.release();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl fmt::Debug for EnvelopeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeStream")
            .field("connection_id", &self.connection_id)
            .field("decision", &self.decision)
            .field("released", &self.guard.released)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Entry point for streaming and synchronous chat requests
#[derive(Clone)]
pub struct StreamOrchestrator {
    runner: Arc<dyn ModelRunner>,
    store: Arc<dyn ConversationStore>,
    registry: SessionRegistry,
    validator: InputValidator,
    session_timeout: Duration,
}

impl StreamOrchestrator {
    /// Create an orchestrator with default limits
    pub fn new(
        runner: Arc<dyn ModelRunner>,
        store: Arc<dyn ConversationStore>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            runner,
            store,
            registry,
            validator: InputValidator::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    /// Use custom request limits
    #[must_use]
    pub fn with_limits(mut self, limits: ChatLimits) -> Self {
        self.validator = InputValidator::new(limits);
        self
    }

    /// Age after which running sessions are reaped
    #[must_use]
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// The shared session registry
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Configured session timeout
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Start a streaming attempt
    ///
    /// Validation happens here, synchronously; a rejected request registers
    /// nothing. Every later failure is reported in-band as one `Error`
    /// envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for empty, oversized or malformed input,
    /// including a resume offset beyond
    /// [`MAX_RESUME_OFFSET`](crate::security::MAX_RESUME_OFFSET).
    pub fn stream_chat(
        &self,
        message: &str,
        conversation_id: Option<&str>,
        resume_offset: u64,
    ) -> Result<EnvelopeStream, ValidationError> {
        let message = self.validator.validate_message(message)?.to_string();
        let conversation_id = self
            .validator
            .validate_conversation_id(conversation_id)?
            .map(str::to_string);
        let resume_offset = self.validator.validate_resume_offset(resume_offset)?;

        let decision = resolver::resolve(&self.registry, conversation_id.as_deref(), resume_offset);
        let start_index = decision.start_index();
        let connection_id = self.registry.register(conversation_id.as_deref(), start_index);

        let guard = SessionGuard {
            registry: self.registry.clone(),
            id: connection_id,
            released: false,
        };

        let inner = SessionDriver {
            runner: Arc::clone(&self.runner),
            store: Arc::clone(&self.store),
            registry: self.registry.clone(),
            id: connection_id,
            message,
            conversation_id,
            start_index,
        }
        .into_stream();

        Ok(EnvelopeStream {
            connection_id,
            decision,
            inner: Box::pin(inner),
            guard,
        })
    }

    /// Run a request to completion and return the whole reply
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Validation` for bad input, `ChatError::Store` or
    /// `ChatError::Runner` when the reply could not be produced.
    pub async fn complete(
        &self,
        message: &str,
        conversation_id: Option<&str>,
    ) -> Result<ChatReply, ChatError> {
        let message = self.validator.validate_message(message)?;
        let conversation_id = self.validator.validate_conversation_id(conversation_id)?;

        let handle = self
            .store
            .get_or_create_handle(conversation_id)
            .await
            .map_err(|e| {
                tracing::error!(conversation_id = conversation_id.unwrap_or("-"), error = %e, "Conversation lookup failed");
                e
            })?;

        let start = Instant::now();
        let output = self.runner.run_sync(message, handle).await.map_err(|e| {
            tracing::error!(
                conversation_id = conversation_id.unwrap_or("-"),
                runner = self.runner.name(),
                error = %e,
                "Synchronous run failed"
            );
            e
        })?;
        let processing_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        tracing::info!(
            conversation_id = conversation_id.unwrap_or("-"),
            token_count = output.token_count_estimate,
            processing_time_ms,
            "Synchronous chat completed"
        );

        Ok(ChatReply {
            message: output.text,
            context_id: conversation_id.unwrap_or(DEFAULT_CONTEXT_ID).to_string(),
            token_count: output.token_count_estimate,
            processing_time_ms,
        })
    }

    /// Remove running sessions older than `timeout`
    pub fn reap_expired(&self, timeout: Duration) -> usize {
        self.registry.reap_expired(timeout)
    }

    /// Start a background reaper using the configured session timeout
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn_reaper(&self, interval: Duration) -> SessionReaper {
        SessionReaper::spawn(self.registry.clone(), interval, self.session_timeout)
    }

    /// Most recent session for a conversation
    #[must_use]
    pub fn connection_status(&self, conversation_id: &str) -> Option<SessionSnapshot> {
        self.registry.find_by_conversation(conversation_id)
    }

    /// Health snapshot, including a runner reachability check
    pub async fn health(&self) -> HealthReport {
        let runner_reachable = self.runner.health_check().await;
        HealthReport {
            status: if runner_reachable { "healthy" } else { "degraded" }.to_string(),
            runner: self.runner.name().to_string(),
            runner_reachable,
            active_connections: self.registry.count(),
            conversations: self.store.len(),
        }
    }
}

impl fmt::Debug for StreamOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOrchestrator")
            .field("runner", &self.runner.name())
            .field("registry", &self.registry)
            .field("session_timeout", &self.session_timeout)
            .finish_non_exhaustive()
    }
}

/// Terminal error envelope, marking the session failed
fn fail_session(
    registry: &SessionRegistry,
    id: &ConnectionId,
    context_id: Option<&str>,
    kind: InStreamError,
) -> Envelope {
    registry.set_state(id, SessionState::Error);
    Envelope::error(
        context_id.map(str::to_string),
        kind.error_code(),
        kind.client_message(),
    )
}

/// Everything one streaming attempt needs, moved into its generator
struct SessionDriver {
    runner: Arc<dyn ModelRunner>,
    store: Arc<dyn ConversationStore>,
    registry: SessionRegistry,
    id: ConnectionId,
    message: String,
    conversation_id: Option<String>,
    start_index: u64,
}

impl SessionDriver {
    fn into_stream(self) -> impl Stream<Item = Envelope> + Send {
        let Self {
            runner,
            store,
            registry,
            id,
            message,
            conversation_id,
            start_index,
        } = self;

        async_stream::stream! {
            let context_id = conversation_id
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTEXT_ID.to_string());
            let error_context = conversation_id.as_deref();

            let handle = match store.get_or_create_handle(conversation_id.as_deref()).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!(connection_id = %id, error = %e, "Conversation lookup failed");
                    yield fail_session(&registry, &id, error_context, InStreamError::ConversationUnavailable);
                    return;
                }
            };

            let rx = match runner.run_streaming(&message, handle).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!(
                        connection_id = %id,
                        runner = runner.name(),
                        error = %e,
                        "Model runner failed to start"
                    );
                    yield fail_session(&registry, &id, error_context, InStreamError::Streaming);
                    return;
                }
            };

            let mut events = ReceiverStream::new(rx);
            // None once the index space is used up
            let mut next_index = Some(start_index);
            let mut delivered: u64 = 0;
            let mut accumulated = String::new();

            loop {
                match events.next().await {
                    Some(RunnerEvent::Delta(delta)) => {
                        accumulated.push_str(&delta);
                        let Some(index) = next_index else {
                            if delta.trim().is_empty() {
                                continue;
                            }
                            tracing::error!(connection_id = %id, "Token index space exhausted");
                            yield fail_session(&registry, &id, error_context, InStreamError::Streaming);
                            return;
                        };
                        let Some(envelope) = Envelope::from_delta(&delta, index, &context_id) else {
                            continue;
                        };
                        if !registry.record_token(&id, index) {
                            tracing::warn!(
                                connection_id = %id,
                                token_index = index,
                                "Session reaped while streaming"
                            );
                            yield fail_session(&registry, &id, error_context, InStreamError::SessionTimeout);
                            return;
                        }
                        next_index = index.checked_add(1);
                        delivered += 1;
                        yield envelope;
                    }
                    Some(RunnerEvent::Completed { final_output }) => {
                        let final_output = if final_output.is_empty() {
                            std::mem::take(&mut accumulated)
                        } else {
                            final_output
                        };
                        registry.set_state(&id, SessionState::Completed);
                        tracing::info!(
                            connection_id = %id,
                            tokens = delivered,
                            "Stream completed"
                        );
                        yield Envelope::end(context_id.as_str(), final_output);
                        return;
                    }
                    Some(RunnerEvent::Failed(detail)) => {
                        tracing::error!(
                            connection_id = %id,
                            token_index = ?next_index,
                            error = %detail,
                            "Model runner failed mid-stream"
                        );
                        yield fail_session(&registry, &id, error_context, InStreamError::Streaming);
                        return;
                    }
                    None => {
                        tracing::warn!(
                            connection_id = %id,
                            token_index = ?next_index,
                            "Runner channel closed without completion"
                        );
                        yield fail_session(&registry, &id, error_context, InStreamError::Interrupted);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Script, ScriptedRunner};
    use crate::conversation::InMemoryConversationStore;
    use crate::registry::SessionStatus;

    fn orchestrator(runner: ScriptedRunner) -> StreamOrchestrator {
        StreamOrchestrator::new(
            Arc::new(runner),
            Arc::new(InMemoryConversationStore::default()),
            SessionRegistry::new(),
        )
    }

    #[tokio::test]
    async fn test_validation_registers_nothing() {
        let orch = orchestrator(ScriptedRunner::new());
        let err = orch.stream_chat("   ", Some("c1"), 0).unwrap_err();
        assert_eq!(err, ValidationError::EmptyMessage);
        assert_eq!(orch.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_session_registered_before_first_poll() {
        let orch = orchestrator(ScriptedRunner::new());
        let stream = orch.stream_chat("hi", Some("c1"), 0).unwrap();
        let status = orch.connection_status("c1").unwrap();
        assert_eq!(status.connection_id, stream.connection_id().to_string());
        assert_eq!(status.tokens_delivered, 0);

        drop(stream);
        assert_eq!(orch.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_finished_stream_releases_session() {
        let orch = orchestrator(
            ScriptedRunner::new().with_script(Script::completes(["a", "b"], "ab")),
        );
        let stream = orch.stream_chat("hi", None, 0).unwrap();
        let envelopes: Vec<Envelope> = stream.collect().await;
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[2], Envelope::end(DEFAULT_CONTEXT_ID, "ab"));
        assert_eq!(orch.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_complete_returns_reply() {
        let orch = orchestrator(
            ScriptedRunner::new().with_script(Script::completes(["x"], "four words right here")),
        );
        let reply = orch.complete(" hello ", Some("c1")).await.unwrap();
        assert_eq!(reply.message, "four words right here");
        assert_eq!(reply.context_id, "c1");
        assert_eq!(reply.token_count, 4);
    }

    #[tokio::test]
    async fn test_stateless_complete_uses_default_context() {
        let orch = orchestrator(ScriptedRunner::new());
        let reply = orch.complete("no conversation", None).await.unwrap();
        assert_eq!(reply.context_id, DEFAULT_CONTEXT_ID);
    }

    #[tokio::test]
    async fn test_oversized_resume_offset_rejected() {
        let orch = orchestrator(
            ScriptedRunner::new().with_script(Script::completes(["a", "b"], "ab")),
        );
        let err = orch.stream_chat("hi", Some("c1"), u64::MAX).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_RESUME_OFFSET");
        assert_eq!(orch.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_largest_resume_offset_streams() {
        let orch = orchestrator(
            ScriptedRunner::new().with_script(Script::completes(["a", "b"], "ab")),
        );
        let start = crate::security::MAX_RESUME_OFFSET;
        let stream = orch.stream_chat("hi", Some("c1"), start).unwrap();
        let envelopes: Vec<Envelope> = stream.collect().await;
        assert_eq!(
            envelopes,
            vec![
                Envelope::token("a", start, "c1"),
                Envelope::token("b", start + 1, "c1"),
                Envelope::end("c1", "ab"),
            ]
        );
    }

    #[tokio::test]
    async fn test_index_exhaustion_ends_with_error() {
        let registry = SessionRegistry::new();
        let id = registry.register(Some("c1"), u64::MAX);
        let driver = SessionDriver {
            runner: Arc::new(
                ScriptedRunner::new().with_script(Script::completes(["a", " ", "b"], "a b")),
            ),
            store: Arc::new(InMemoryConversationStore::default()),
            registry: registry.clone(),
            id,
            message: "hi".to_string(),
            conversation_id: Some("c1".to_string()),
            start_index: u64::MAX,
        };

        let envelopes: Vec<Envelope> = driver.into_stream().collect().await;
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0], Envelope::token("a", u64::MAX, "c1"));
        assert!(matches!(
            &envelopes[1],
            Envelope::Error { error_code, .. } if error_code == "STREAMING_ERROR"
        ));
        assert_eq!(registry.get(&id).unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_complete_maps_runner_failure() {
        let orch = orchestrator(
            ScriptedRunner::new().with_script(Script::Refuse("down".to_string())),
        );
        let err = orch.complete("hello", None).await.unwrap_err();
        assert_eq!(err.error_code(), "CHAT_WAIT_ERROR");
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let orch = orchestrator(ScriptedRunner::new());
        let _stream = orch.stream_chat("hi", Some("c1"), 0).unwrap();
        let health = orch.health().await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.runner, "Scripted");
        assert_eq!(health.active_connections, 1);
    }
}
