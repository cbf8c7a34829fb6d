//! OpenAI-Compatible Backend
//!
//! Model runner for any endpoint speaking the OpenAI chat completions API
//! (OpenAI, Gemini's OpenAI-compatible surface, vLLM, llama.cpp server, ...).
//!
//! # API
//!
//! - `POST {base_url}/chat/completions` with `stream: false` for sync runs
//! - `POST {base_url}/chat/completions` with `stream: true` for streaming,
//!   answered with `data: {...}` lines and a final `data: [DONE]`
//! - `GET {base_url}/models` for health checks

use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::traits::{BackendConfig, ModelRunner, RunOutput, RunnerError, RunnerEvent};
use crate::conversation::{ConversationHandle, MessageRole};

/// Longest response body kept in error messages
const MAX_ERROR_BODY: usize = 512;

/// OpenAI-compatible chat completions client
#[derive(Clone)]
pub struct OpenAiCompatBackend {
    config: BackendConfig,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Create a backend from configuration
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::Unreachable` if the HTTP client cannot be built.
    pub fn new(config: BackendConfig) -> Result<Self, RunnerError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| RunnerError::Unreachable(format!("failed to create HTTP client: {e}")))?;

        let api_key = config.resolve_api_key();
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "No API key configured, requests will be sent unauthenticated"
            );
        }

        Ok(Self {
            config,
            api_key,
            http_client,
        })
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Build the chat messages array: system prompt, history, new message
    fn build_messages(&self, message: &str, conversation: Option<&ConversationHandle>) -> Vec<Value> {
        let mut messages = Vec::new();

        if let Some(ref system) = self.config.system_prompt {
            messages.push(json!({ "role": MessageRole::System.as_str(), "content": system }));
        }

        if let Some(handle) = conversation {
            for prior in handle.messages() {
                messages.push(json!({ "role": prior.role.as_str(), "content": prior.content }));
            }
        }

        messages.push(json!({ "role": MessageRole::User.as_str(), "content": message }));
        messages
    }

    fn build_body(&self, message: &str, conversation: Option<&ConversationHandle>, stream: bool) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": self.build_messages(message, conversation),
            "stream": stream,
        });

        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        if self.config.max_tokens > 0 {
            body["max_tokens"] = json!(self.config.max_tokens);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, RunnerError> {
        let mut request = self.http_client.post(self.endpoint("chat/completions")).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
            return Err(RunnerError::Status { status, body });
        }

        Ok(response)
    }
}

/// One parsed line of a streaming completion
#[derive(Debug, PartialEq, Eq)]
enum StreamLine {
    /// Content fragment
    Delta(String),
    /// `[DONE]` sentinel
    Done,
    /// Provider-reported error object
    Error(String),
    /// Anything without content (role headers, comments, keep-alives)
    Skip,
}

fn parse_stream_line(line: &str) -> Result<StreamLine, RunnerError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }
    if data.is_empty() {
        return Ok(StreamLine::Skip);
    }

    let value: Value =
        serde_json::from_str(data).map_err(|e| RunnerError::Protocol(e.to_string()))?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown provider error");
        return Ok(StreamLine::Error(message.to_string()));
    }

    let delta = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if delta.is_empty() {
        Ok(StreamLine::Skip)
    } else {
        Ok(StreamLine::Delta(delta.to_string()))
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

#[async_trait]
impl ModelRunner for OpenAiCompatBackend {
    fn name(&self) -> &'static str {
        "OpenAI-compatible"
    }

    async fn health_check(&self) -> bool {
        let mut request = self
            .http_client
            .get(self.endpoint("models"))
            .timeout(std::time::Duration::from_secs(5));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        request
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn run_sync(
        &self,
        message: &str,
        conversation: Option<ConversationHandle>,
    ) -> Result<RunOutput, RunnerError> {
        let start = Instant::now();
        let body = self.build_body(message, conversation.as_ref(), false);

        let response = tokio::time::timeout(self.config.request_timeout(), async {
            let response = self.post(&body).await?;
            response.json::<Value>().await.map_err(RunnerError::from)
        })
        .await
        .map_err(|_| {
            RunnerError::Unreachable(format!(
                "request timed out after {}s",
                self.config.request_timeout_secs
            ))
        })??;

        let output = sync_output(&response)?;

        if let Some(ref handle) = conversation {
            handle.record_exchange(message, &output.text);
        }

        tracing::debug!(
            model = %self.config.model,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            token_count = output.token_count_estimate,
            "Synchronous run completed"
        );
        Ok(output)
    }

    async fn run_streaming(
        &self,
        message: &str,
        conversation: Option<ConversationHandle>,
    ) -> Result<mpsc::Receiver<RunnerEvent>, RunnerError> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        let body = self.build_body(message, conversation.as_ref(), true);
        let response = self.post(&body).await?;
        let mut stream = response.bytes_stream();
        let message = message.to_string();

        // Spawn task to process stream
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            let mut full_response = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(RunnerEvent::Failed(e.to_string())).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                // Parse newline-delimited event lines
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match parse_stream_line(line) {
                        Ok(StreamLine::Delta(delta)) => {
                            full_response.push_str(&delta);
                            if tx.send(RunnerEvent::Delta(delta)).await.is_err() {
                                // Receiver dropped, stop streaming
                                return;
                            }
                        }
                        Ok(StreamLine::Done) => {
                            if let Some(ref handle) = conversation {
                                handle.record_exchange(&message, &full_response);
                            }
                            let _ = tx
                                .send(RunnerEvent::Completed {
                                    final_output: full_response,
                                })
                                .await;
                            return;
                        }
                        Ok(StreamLine::Error(e)) => {
                            let _ = tx.send(RunnerEvent::Failed(e)).await;
                            return;
                        }
                        Ok(StreamLine::Skip) => {}
                        Err(e) => {
                            let _ = tx.send(RunnerEvent::Failed(e.to_string())).await;
                            return;
                        }
                    }
                }
            }

            // Stream ended without [DONE]; dropping tx lets the consumer see
            // the interruption.
            tracing::warn!(
                received_bytes = full_response.len(),
                "Completion stream ended without a done marker"
            );
        });

        Ok(rx)
    }
}

/// Reply text of a non-streaming completion
///
/// The token count is always the word-count estimate; provider `usage`
/// figures are not comparable across backends and are ignored.
fn sync_output(response: &Value) -> Result<RunOutput, RunnerError> {
    let text = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| RunnerError::Protocol("response has no message content".to_string()))?;
    Ok(RunOutput::new(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> OpenAiCompatBackend {
        OpenAiCompatBackend::new(BackendConfig {
            base_url: "http://localhost:9999/v1/".to_string(),
            model: "test-model".to_string(),
            api_key: Some("sk-test".to_string()),
            system_prompt: Some("Be helpful".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let backend = backend();
        assert_eq!(
            backend.endpoint("chat/completions"),
            "http://localhost:9999/v1/chat/completions"
        );
    }

    #[test]
    fn test_build_messages_includes_history() {
        let backend = backend();
        let handle = ConversationHandle::new("c1", 10);
        handle.record_exchange("Hi", "Hello!");

        let messages = backend.build_messages("How are you?", Some(&handle));
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "Hi");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "How are you?");

        // Stateless
        let messages = backend.build_messages("Hello", None);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_build_body_options() {
        let backend = backend();
        let body = backend.build_body("Hello", None, true);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 4096);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_parse_stream_lines() {
        assert_eq!(
            parse_stream_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap(),
            StreamLine::Delta("Hi".to_string())
        );
        assert_eq!(
            parse_stream_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            StreamLine::Skip
        );
        assert_eq!(parse_stream_line("data: [DONE]").unwrap(), StreamLine::Done);
        assert_eq!(parse_stream_line(": keep-alive").unwrap(), StreamLine::Skip);
        assert_eq!(
            parse_stream_line(r#"data: {"error":{"message":"quota exceeded"}}"#).unwrap(),
            StreamLine::Error("quota exceeded".to_string())
        );
        assert!(matches!(
            parse_stream_line("data: {broken"),
            Err(RunnerError::Protocol(_))
        ));
    }

    #[test]
    fn test_sync_output_uses_word_estimate() {
        let response = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "three words here"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 99}
        });
        let output = sync_output(&response).unwrap();
        assert_eq!(output.text, "three words here");
        assert_eq!(output.token_count_estimate, 3);

        let empty = serde_json::json!({"choices": []});
        assert!(matches!(sync_output(&empty), Err(RunnerError::Protocol(_))));
    }

    #[test]
    fn test_floor_char_boundary() {
        assert_eq!(floor_char_boundary("abc", 10), 3);
        assert_eq!(floor_char_boundary("héllo", 2), 1);
    }
}
