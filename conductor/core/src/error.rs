//! Error Taxonomy
//!
//! Errors split by where they surface:
//!
//! - **Validation** errors are returned synchronously, before any session
//!   exists, and carry a client-facing [`ErrorPayload`].
//! - **In-stream** failures never escape as `Err`; the orchestrator turns
//!   them into exactly one `Error` envelope carrying an [`InStreamError`] code.
//! - **Transport** failures (client gone) only trigger cleanup.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::RunnerError;
use crate::conversation::StoreError;
use crate::security::ValidationError;

/// Failures that end a running stream, reported in-band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InStreamError {
    /// The conversation store could not produce a handle
    ConversationUnavailable,
    /// The model runner failed to start or failed mid-generation
    Streaming,
    /// The runner's delta channel closed without a completion marker
    Interrupted,
    /// The session was evicted by the reaper while still running
    SessionTimeout,
}

impl InStreamError {
    /// Stable error code placed in the `Error` envelope
    #[must_use]
    pub fn error_code(self) -> &'static str {
        match self {
            Self::ConversationUnavailable => "CONVERSATION_UNAVAILABLE",
            Self::Streaming => "STREAMING_ERROR",
            Self::Interrupted => "STREAM_INTERRUPTED",
            Self::SessionTimeout => "SESSION_TIMEOUT",
        }
    }

    /// Generic, client-safe message; raw details go to the log only
    #[must_use]
    pub fn client_message(self) -> &'static str {
        match self {
            Self::ConversationUnavailable => "Conversation is temporarily unavailable",
            Self::Streaming => "An error occurred while generating the response",
            Self::Interrupted => "The response stream ended unexpectedly",
            Self::SessionTimeout => "The streaming session timed out",
        }
    }
}

/// Errors returned by the chat entry points
#[derive(Debug, Error)]
pub enum ChatError {
    /// Request rejected before processing
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Model runner failure
    #[error("model runner failed: {0}")]
    Runner(#[from] RunnerError),

    /// Conversation store failure
    #[error("conversation store failed: {0}")]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Stable error code for structured error payloads
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.error_code(),
            Self::Runner(_) | Self::Store(_) => "CHAT_WAIT_ERROR",
        }
    }

    /// Whether the caller sent a bad request (as opposed to a server failure)
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Client-facing payload
    ///
    /// Validation errors keep their message; everything else gets a generic
    /// one so internal details never reach the client.
    #[must_use]
    pub fn payload(&self) -> ErrorPayload {
        let message = match self {
            Self::Validation(e) => e.to_string(),
            Self::Runner(_) | Self::Store(_) => "Failed to process message".to_string(),
        };
        ErrorPayload {
            error_code: self.error_code().to_string(),
            message,
        }
    }
}

/// Structured error body returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable machine-readable code
    pub error_code: String,
    /// Human-readable message
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_stream_codes() {
        assert_eq!(InStreamError::Streaming.error_code(), "STREAMING_ERROR");
        assert_eq!(InStreamError::Interrupted.error_code(), "STREAM_INTERRUPTED");
        assert_eq!(InStreamError::SessionTimeout.error_code(), "SESSION_TIMEOUT");
        assert_eq!(
            InStreamError::ConversationUnavailable.error_code(),
            "CONVERSATION_UNAVAILABLE"
        );
    }

    #[test]
    fn test_validation_payload_keeps_message() {
        let err = ChatError::from(ValidationError::EmptyMessage);
        assert!(err.is_client_error());
        assert_eq!(
            err.payload(),
            ErrorPayload {
                error_code: "EMPTY_MESSAGE".to_string(),
                message: "Message cannot be empty".to_string(),
            }
        );
    }

    #[test]
    fn test_runner_payload_hides_detail() {
        let err = ChatError::from(RunnerError::Unreachable("10.0.0.7:443 refused".to_string()));
        let payload = err.payload();
        assert_eq!(payload.error_code, "CHAT_WAIT_ERROR");
        assert!(!payload.message.contains("10.0.0.7"));
        assert!(!err.is_client_error());
    }
}
