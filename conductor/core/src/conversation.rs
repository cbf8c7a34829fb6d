//! Conversation Store
//!
//! Maps conversation identifiers to history handles. A handle is what a
//! model runner uses to remember earlier turns; the streaming core only
//! looks handles up and passes them along.
//!
//! Requests without a conversation identifier run stateless and get no
//! handle at all.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted conversation identifier
pub const MAX_CONVERSATION_ID_LEN: usize = 256;

/// Who produced a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions
    System,
    /// User input
    User,
    /// Model output
    Assistant,
}

impl MessageRole {
    /// Wire name used by chat completion APIs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A message in the conversation history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was recorded (Unix timestamp ms)
    pub timestamp: u64,
}

impl ConversationMessage {
    /// Create a new message stamped with the current time
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_ms(),
        }
    }
}

#[derive(Debug)]
struct History {
    messages: Vec<ConversationMessage>,
    max_messages: usize,
}

impl History {
    fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
        if self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(..excess);
        }
    }
}

/// Shared handle to one conversation's history
///
/// Cloning is cheap; all clones see the same history.
#[derive(Clone, Debug)]
pub struct ConversationHandle {
    id: Arc<str>,
    history: Arc<Mutex<History>>,
}

impl ConversationHandle {
    /// Create an empty conversation keeping at most `max_messages` entries
    pub fn new(id: impl Into<String>, max_messages: usize) -> Self {
        Self {
            id: Arc::from(id.into()),
            history: Arc::new(Mutex::new(History {
                messages: Vec::new(),
                max_messages: max_messages.max(2),
            })),
        }
    }

    /// Conversation identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the history, oldest first
    #[must_use]
    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.history.lock().messages.clone()
    }

    /// Number of recorded messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.lock().messages.len()
    }

    /// Whether nothing has been recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record one completed user/assistant exchange
    ///
    /// Both messages are appended under one lock so concurrent streams on the
    /// same conversation never interleave halves of an exchange.
    pub fn record_exchange(&self, user: &str, assistant: &str) {
        let mut history = self.history.lock();
        history.push(ConversationMessage::new(MessageRole::User, user));
        history.push(ConversationMessage::new(MessageRole::Assistant, assistant));
    }

    /// Drop all history
    pub fn clear(&self) {
        self.history.lock().messages.clear();
    }
}

/// Errors from the conversation store
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The identifier is empty or too long
    #[error("invalid conversation id: {0}")]
    InvalidId(String),

    /// The store cannot serve requests
    #[error("conversation store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed store of conversation handles
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Look up or create the handle for `conversation_id`
    ///
    /// Returns `Ok(None)` for stateless requests (`conversation_id` absent).
    async fn get_or_create_handle(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<Option<ConversationHandle>, StoreError>;

    /// Number of conversations currently held
    fn len(&self) -> usize;

    /// Whether the store is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-memory conversation store
#[derive(Debug)]
pub struct InMemoryConversationStore {
    handles: DashMap<String, ConversationHandle>,
    max_history_messages: usize,
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl InMemoryConversationStore {
    /// Create a store whose conversations keep at most `max_history_messages`
    #[must_use]
    pub fn new(max_history_messages: usize) -> Self {
        Self {
            handles: DashMap::new(),
            max_history_messages,
        }
    }

    /// Forget a conversation entirely
    pub fn remove(&self, conversation_id: &str) -> Option<ConversationHandle> {
        self.handles.remove(conversation_id).map(|(_, h)| h)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_or_create_handle(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<Option<ConversationHandle>, StoreError> {
        let Some(id) = conversation_id else {
            tracing::debug!("No conversation id, running stateless");
            return Ok(None);
        };

        let id = id.trim();
        if id.is_empty() {
            return Err(StoreError::InvalidId("empty".to_string()));
        }
        if id.len() > MAX_CONVERSATION_ID_LEN {
            return Err(StoreError::InvalidId(format!(
                "{} bytes (max: {MAX_CONVERSATION_ID_LEN})",
                id.len()
            )));
        }

        let handle = self
            .handles
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::info!(conversation_id = %id, "Created conversation");
                ConversationHandle::new(id, self.max_history_messages)
            })
            .clone();

        Ok(Some(handle))
    }

    fn len(&self) -> usize {
        self.handles.len()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stateless_returns_none() {
        let store = InMemoryConversationStore::default();
        assert!(store.get_or_create_handle(None).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_same_id_shares_history() {
        let store = InMemoryConversationStore::default();
        let first = store.get_or_create_handle(Some("c1")).await.unwrap().unwrap();
        first.record_exchange("hello", "hi");

        let second = store.get_or_create_handle(Some("c1")).await.unwrap().unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second.messages()[0].role, MessageRole::User);
        assert_eq!(second.messages()[1].content, "hi");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let store = InMemoryConversationStore::default();
        assert!(matches!(
            store.get_or_create_handle(Some("   ")).await,
            Err(StoreError::InvalidId(_))
        ));

        let long = "x".repeat(MAX_CONVERSATION_ID_LEN + 1);
        assert!(matches!(
            store.get_or_create_handle(Some(&long)).await,
            Err(StoreError::InvalidId(_))
        ));
    }

    #[test]
    fn test_history_is_bounded() {
        let handle = ConversationHandle::new("c", 4);
        for i in 0..5 {
            handle.record_exchange(&format!("q{i}"), &format!("a{i}"));
        }
        let messages = handle.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "q3");
        assert_eq!(messages[3].content, "a4");
    }

    #[test]
    fn test_remove_and_clear() {
        let store = InMemoryConversationStore::new(10);
        let handle = ConversationHandle::new("c", 10);
        handle.record_exchange("a", "b");
        handle.clear();
        assert!(handle.is_empty());
        assert!(store.remove("missing").is_none());
    }
}
