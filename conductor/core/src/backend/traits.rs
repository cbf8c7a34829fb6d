//! Model Runner Traits
//!
//! Trait definitions for model runners. This abstraction lets the
//! orchestrator drive any provider (OpenAI-compatible endpoints, scripted
//! runners in tests, ...) without changing core logic.
//!
//! # Design Philosophy
//!
//! A runner offers two entry points:
//! - `run_sync` returns the complete reply
//! - `run_streaming` returns a channel of [`RunnerEvent`]s that ends with
//!   exactly one `Completed` or `Failed` event (or simply closes)
//!
//! Runners own conversation history: they read prior turns from the
//! [`ConversationHandle`] and record the new exchange on success.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::conversation::ConversationHandle;

/// Events produced by a streaming model run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunnerEvent {
    /// An incremental fragment of generated text
    Delta(String),
    /// Generation finished successfully
    Completed {
        /// The complete output (may differ from concatenated deltas)
        final_output: String,
    },
    /// Generation failed after it started
    Failed(String),
}

/// Result of a synchronous model run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutput {
    /// The generated text
    pub text: String,
    /// Rough token count of `text`
    pub token_count_estimate: u32,
}

impl RunOutput {
    /// Build an output, estimating tokens by whitespace-separated words
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let token_count_estimate = estimate_tokens(&text);
        Self {
            text,
            token_count_estimate,
        }
    }
}

/// Whitespace word count, never less than 1
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count())
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Errors raised by model runners
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The backend could not be reached
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered with a non-success status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated by the caller if needed)
        body: String,
    },

    /// The backend answered with something we could not interpret
    #[error("invalid backend response: {0}")]
    Protocol(String),

    /// Generation failed
    #[error("generation failed: {0}")]
    Generation(String),
}

impl From<reqwest::Error> for RunnerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

/// Model runner trait
///
/// Implement this trait to add support for different model providers.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    /// Get the runner name (e.g., "OpenAI-compatible")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Run the model and wait for the complete reply
    async fn run_sync(
        &self,
        message: &str,
        conversation: Option<ConversationHandle>,
    ) -> Result<RunOutput, RunnerError>;

    /// Run the model and stream deltas as they are produced
    ///
    /// Errors returned here mean generation never started. Failures after
    /// the first delta arrive in-band as [`RunnerEvent::Failed`]. The
    /// producer must stop when the receiver is dropped.
    async fn run_streaming(
        &self,
        message: &str,
        conversation: Option<ConversationHandle>,
    ) -> Result<mpsc::Receiver<RunnerEvent>, RunnerError>;
}

/// Connection settings for an OpenAI-compatible chat completions endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://api.openai.com/v1/`
    pub base_url: String,
    /// Model identifier
    pub model: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    /// API key (resolved from `api_key_env` when not set explicitly)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// System prompt prepended to every conversation
    pub system_prompt: Option<String>,
    /// Sampling temperature (0.0-2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens per response (0 = provider default)
    pub max_tokens: u32,
    /// Whole-request timeout in seconds for synchronous runs
    pub request_timeout_secs: u64,
    /// Capacity of the delta channel handed to the orchestrator
    pub channel_capacity: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai/".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "CHATSTREAM_API_KEY".to_string(),
            api_key: None,
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: None,
            max_tokens: 4096,
            request_timeout_secs: 30,
            channel_capacity: 100,
        }
    }
}

impl BackendConfig {
    /// Request timeout as a `Duration`
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolve the API key, preferring an explicit value over the environment
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Default assistant instructions
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful and conversational assistant. \
Give accurate, clear and well-structured answers, acknowledge earlier turns of the \
conversation when relevant, and say so when you are unsure instead of guessing.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("Hi there"), 2);
        assert_eq!(estimate_tokens("  spaced   out  words "), 3);
        // Never zero
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(RunOutput::new("one two three").token_count_estimate, 3);
    }

    #[test]
    fn test_backend_config_default() {
        let config = BackendConfig::default();
        assert_eq!(config.model, "gemini-2.5-flash");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.channel_capacity, 100);
        assert!(config.system_prompt.is_some());
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let config = BackendConfig {
            api_key: Some("sk-explicit".to_string()),
            api_key_env: "CHATSTREAM_TEST_UNSET_KEY_VAR".to_string(),
            ..Default::default()
        };
        assert_eq!(config.resolve_api_key().as_deref(), Some("sk-explicit"));

        let blank = BackendConfig {
            api_key: Some("   ".to_string()),
            api_key_env: "CHATSTREAM_TEST_UNSET_KEY_VAR".to_string(),
            ..Default::default()
        };
        assert_eq!(blank.resolve_api_key(), None);
    }

    #[test]
    fn test_runner_error_display() {
        let err = RunnerError::Status {
            status: 503,
            body: "overloaded".to_string(),
        };
        assert_eq!(err.to_string(), "backend returned 503: overloaded");
    }
}
