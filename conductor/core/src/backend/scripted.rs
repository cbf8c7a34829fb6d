//! Scripted model runner
//!
//! Deterministic [`ModelRunner`] for tests and offline demos. Each call
//! consumes the next queued [`Script`] (falling back to a default script)
//! and replays its deltas, then ends the way the script says.
//!
//! ```ignore
//! let runner = ScriptedRunner::new()
//!     .with_script(Script::completes(["Hi", " there"], "Hi there"))
//!     .with_script(Script::fails_after(["partial"], "upstream reset"));
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{ModelRunner, RunOutput, RunnerError, RunnerEvent};
use crate::conversation::ConversationHandle;

/// How a scripted run ends after its deltas
#[derive(Clone, Debug)]
pub enum ScriptEnding {
    /// Send `Completed` with this final output (`None` = concatenated deltas)
    Complete(Option<String>),
    /// Send `Failed` with this detail
    Fail(String),
    /// Close the channel without a terminal event
    Disconnect,
    /// Never finish; the channel stays open until the receiver is dropped
    Hang,
}

/// One scripted run
#[derive(Clone, Debug)]
pub enum Script {
    /// Stream these deltas, then end as described
    Stream {
        /// Deltas in order
        deltas: Vec<String>,
        /// Ending after the deltas
        ending: ScriptEnding,
    },
    /// Refuse to start generation at all
    Refuse(String),
}

impl Script {
    /// Deltas followed by a successful completion
    pub fn completes<I, S>(deltas: I, final_output: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stream {
            deltas: deltas.into_iter().map(Into::into).collect(),
            ending: ScriptEnding::Complete(Some(final_output.into())),
        }
    }

    /// Deltas followed by a mid-stream failure
    pub fn fails_after<I, S>(deltas: I, detail: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stream {
            deltas: deltas.into_iter().map(Into::into).collect(),
            ending: ScriptEnding::Fail(detail.into()),
        }
    }

    /// Deltas with a custom ending
    pub fn stream<I, S>(deltas: I, ending: ScriptEnding) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stream {
            deltas: deltas.into_iter().map(Into::into).collect(),
            ending,
        }
    }
}

/// A call observed by the runner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCall {
    /// The prompt
    pub message: String,
    /// Conversation the call was bound to
    pub conversation_id: Option<String>,
    /// Whether the call was a streaming run
    pub streaming: bool,
}

/// Deterministic runner driven by queued scripts
#[derive(Clone, Debug)]
pub struct ScriptedRunner {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    delay: Duration,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    /// Create a runner that echoes the prompt back when no script is queued
    #[must_use]
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a script for the next unscripted call
    #[must_use]
    pub fn with_script(self, script: Script) -> Self {
        self.scripts.lock().push_back(script);
        self
    }

    /// Pause between deltas
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Calls observed so far
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn next_script(&self, message: &str, conversation: Option<&ConversationHandle>, streaming: bool) -> Script {
        self.calls.lock().push(RecordedCall {
            message: message.to_string(),
            conversation_id: conversation.map(|h| h.id().to_string()),
            streaming,
        });

        match self.scripts.lock().pop_front() {
            Some(script) => script,
            // Empty queue echoes the prompt word by word
            None => Script::Stream {
                deltas: echo_deltas(message),
                ending: ScriptEnding::Complete(None),
            },
        }
    }
}

fn echo_deltas(message: &str) -> Vec<String> {
    message
        .split_inclusive(' ')
        .map(ToString::to_string)
        .collect()
}

#[async_trait]
impl ModelRunner for ScriptedRunner {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn run_sync(
        &self,
        message: &str,
        conversation: Option<ConversationHandle>,
    ) -> Result<RunOutput, RunnerError> {
        match self.next_script(message, conversation.as_ref(), false) {
            Script::Refuse(detail) => Err(RunnerError::Unreachable(detail)),
            Script::Stream { deltas, ending } => match ending {
                ScriptEnding::Complete(final_output) => {
                    let text = final_output.unwrap_or_else(|| deltas.concat());
                    if let Some(ref handle) = conversation {
                        handle.record_exchange(message, &text);
                    }
                    Ok(RunOutput::new(text))
                }
                ScriptEnding::Fail(detail) => Err(RunnerError::Generation(detail)),
                ScriptEnding::Disconnect | ScriptEnding::Hang => Err(RunnerError::Generation(
                    "run ended without output".to_string(),
                )),
            },
        }
    }

    async fn run_streaming(
        &self,
        message: &str,
        conversation: Option<ConversationHandle>,
    ) -> Result<mpsc::Receiver<RunnerEvent>, RunnerError> {
        let (deltas, ending) = match self.next_script(message, conversation.as_ref(), true) {
            Script::Refuse(detail) => return Err(RunnerError::Unreachable(detail)),
            Script::Stream { deltas, ending } => (deltas, ending),
        };

        let (tx, rx) = mpsc::channel(16);
        let delay = self.delay;
        let message = message.to_string();

        tokio::spawn(async move {
            let mut full = String::new();
            for delta in deltas {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                full.push_str(&delta);
                if tx.send(RunnerEvent::Delta(delta)).await.is_err() {
                    return;
                }
            }

            match ending {
                ScriptEnding::Complete(final_output) => {
                    let final_output = final_output.unwrap_or(full);
                    if let Some(ref handle) = conversation {
                        handle.record_exchange(&message, &final_output);
                    }
                    let _ = tx.send(RunnerEvent::Completed { final_output }).await;
                }
                ScriptEnding::Fail(detail) => {
                    let _ = tx.send(RunnerEvent::Failed(detail)).await;
                }
                ScriptEnding::Disconnect => {}
                ScriptEnding::Hang => tx.closed().await,
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<RunnerEvent>) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_scripts_consumed_in_order() {
        let runner = ScriptedRunner::new()
            .with_script(Script::completes(["a", "b"], "ab"))
            .with_script(Script::fails_after(["x"], "boom"));

        let first = drain(runner.run_streaming("q", None).await.unwrap()).await;
        assert_eq!(
            first,
            vec![
                RunnerEvent::Delta("a".to_string()),
                RunnerEvent::Delta("b".to_string()),
                RunnerEvent::Completed {
                    final_output: "ab".to_string()
                },
            ]
        );

        let second = drain(runner.run_streaming("q", None).await.unwrap()).await;
        assert_eq!(second.last(), Some(&RunnerEvent::Failed("boom".to_string())));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_echoes_prompt() {
        let runner = ScriptedRunner::new();
        let events = drain(runner.run_streaming("hello big world", None).await.unwrap()).await;
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[3],
            RunnerEvent::Completed {
                final_output: "hello big world".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_refuse_fails_to_start() {
        let runner = ScriptedRunner::new().with_script(Script::Refuse("offline".to_string()));
        assert!(matches!(
            runner.run_streaming("q", None).await,
            Err(RunnerError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_records_history() {
        let runner = ScriptedRunner::new().with_script(Script::completes(["Hi"], "Hi!"));
        let handle = ConversationHandle::new("c1", 10);

        let output = runner.run_sync("hello", Some(handle.clone())).await.unwrap();
        assert_eq!(output.text, "Hi!");
        assert_eq!(handle.len(), 2);
        assert_eq!(runner.calls()[0].conversation_id.as_deref(), Some("c1"));
        assert!(!runner.calls()[0].streaming);
    }
}
