//! Input Validation
//!
//! Validation is enforced where untrusted input enters the system: the chat
//! message and the conversation identifier. Everything here runs
//! synchronously, before a session is registered or a model is called, so a
//! rejected request never produces a stream.
//!
//! All validation is fail-safe: when in doubt, reject the input.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::MAX_CONVERSATION_ID_LEN;

/// Default maximum message length in characters
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 10_000;

/// Largest resume offset accepted (2^53 - 1, exact in every JSON client)
pub const MAX_RESUME_OFFSET: u64 = (1 << 53) - 1;

/// Limits applied to incoming chat requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatLimits {
    /// Maximum message length in characters, after trimming (default: 10000)
    pub max_message_chars: usize,
    /// Maximum messages kept per conversation history (default: 100)
    pub max_history_messages: usize,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self {
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            max_history_messages: 100,
        }
    }
}

/// Why a request was rejected
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Message is empty or whitespace only
    #[error("Message cannot be empty")]
    EmptyMessage,

    /// Message exceeds the configured length
    #[error("Message too long: {len} characters (max: {max})")]
    MessageTooLong {
        /// Length after trimming
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Message contains control characters other than newline, tab or CR
    #[error("Message contains invalid control characters")]
    InvalidCharacters,

    /// Conversation identifier is blank or too long
    #[error("Invalid conversation id: {0}")]
    InvalidConversationId(String),

    /// Resume offset beyond [`MAX_RESUME_OFFSET`]
    #[error("Resume offset too large: {offset} (max: {max})")]
    InvalidResumeOffset {
        /// Requested offset
        offset: u64,
        /// Largest accepted offset
        max: u64,
    },
}

impl ValidationError {
    /// Stable error code for structured error payloads
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyMessage => "EMPTY_MESSAGE",
            Self::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            Self::InvalidCharacters => "INVALID_CHARACTERS",
            Self::InvalidConversationId(_) => "INVALID_CONVERSATION_ID",
            Self::InvalidResumeOffset { .. } => "INVALID_RESUME_OFFSET",
        }
    }
}

/// Validator for chat requests
#[derive(Clone, Debug, Default)]
pub struct InputValidator {
    limits: ChatLimits,
}

impl InputValidator {
    /// Create a validator with the given limits
    #[must_use]
    pub fn new(limits: ChatLimits) -> Self {
        Self { limits }
    }

    /// Validate a chat message, returning it trimmed
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first violated rule.
    pub fn validate_message<'a>(&self, content: &'a str) -> Result<&'a str, ValidationError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyMessage);
        }

        let len = trimmed.chars().count();
        if len > self.limits.max_message_chars {
            return Err(ValidationError::MessageTooLong {
                len,
                max: self.limits.max_message_chars,
            });
        }

        // Control characters except newline, tab, CR
        if trimmed
            .chars()
            .any(|c| c.is_control() && c != '\n' && c != '\t' && c != '\r')
        {
            return Err(ValidationError::InvalidCharacters);
        }

        Ok(trimmed)
    }

    /// Validate an optional conversation identifier, returning it trimmed
    ///
    /// # Errors
    ///
    /// Returns `InvalidConversationId` for blank or over-long identifiers.
    pub fn validate_conversation_id<'a>(
        &self,
        conversation_id: Option<&'a str>,
    ) -> Result<Option<&'a str>, ValidationError> {
        let Some(id) = conversation_id else {
            return Ok(None);
        };
        let id = id.trim();
        if id.is_empty() {
            return Err(ValidationError::InvalidConversationId("empty".to_string()));
        }
        if id.len() > MAX_CONVERSATION_ID_LEN {
            return Err(ValidationError::InvalidConversationId(format!(
                "{} bytes (max: {MAX_CONVERSATION_ID_LEN})",
                id.len()
            )));
        }
        Ok(Some(id))
    }

    /// Validate a client-claimed resume offset
    ///
    /// # Errors
    ///
    /// Returns `InvalidResumeOffset` above [`MAX_RESUME_OFFSET`].
    pub fn validate_resume_offset(&self, offset: u64) -> Result<u64, ValidationError> {
        if offset > MAX_RESUME_OFFSET {
            return Err(ValidationError::InvalidResumeOffset {
                offset,
                max: MAX_RESUME_OFFSET,
            });
        }
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_message_is_trimmed() {
        let validator = InputValidator::default();
        assert_eq!(validator.validate_message("  hello\n").unwrap(), "hello");
        assert_eq!(
            validator.validate_message("line one\nline two\ttabbed").unwrap(),
            "line one\nline two\ttabbed"
        );
    }

    #[test]
    fn test_empty_message_rejected() {
        let validator = InputValidator::default();
        let err = validator.validate_message(" \n\t ").unwrap_err();
        assert_eq!(err, ValidationError::EmptyMessage);
        assert_eq!(err.error_code(), "EMPTY_MESSAGE");
        assert_eq!(err.to_string(), "Message cannot be empty");
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        let validator = InputValidator::new(ChatLimits {
            max_message_chars: 3,
            ..Default::default()
        });
        // 3 chars, 6 bytes
        assert!(validator.validate_message("ééé").is_ok());
        assert_eq!(
            validator.validate_message("éééé").unwrap_err(),
            ValidationError::MessageTooLong { len: 4, max: 3 }
        );
    }

    #[test]
    fn test_default_limit_is_ten_thousand() {
        let validator = InputValidator::default();
        assert!(validator.validate_message(&"a".repeat(10_000)).is_ok());
        let err = validator.validate_message(&"a".repeat(10_001)).unwrap_err();
        assert_eq!(err.error_code(), "MESSAGE_TOO_LONG");
    }

    #[test]
    fn test_control_characters_rejected() {
        let validator = InputValidator::default();
        let err = validator.validate_message("hi\u{0007}there").unwrap_err();
        assert_eq!(err, ValidationError::InvalidCharacters);
        assert_eq!(err.error_code(), "INVALID_CHARACTERS");
    }

    #[test]
    fn test_conversation_id_validation() {
        let validator = InputValidator::default();
        assert_eq!(validator.validate_conversation_id(None).unwrap(), None);
        assert_eq!(
            validator.validate_conversation_id(Some(" c1 ")).unwrap(),
            Some("c1")
        );
        assert!(validator.validate_conversation_id(Some("  ")).is_err());
        let long = "x".repeat(MAX_CONVERSATION_ID_LEN + 1);
        assert_eq!(
            validator
                .validate_conversation_id(Some(&long))
                .unwrap_err()
                .error_code(),
            "INVALID_CONVERSATION_ID"
        );
    }

    #[test]
    fn test_resume_offset_bounds() {
        let validator = InputValidator::default();
        assert_eq!(validator.validate_resume_offset(0).unwrap(), 0);
        assert_eq!(
            validator.validate_resume_offset(MAX_RESUME_OFFSET).unwrap(),
            MAX_RESUME_OFFSET
        );
        let err = validator.validate_resume_offset(u64::MAX).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidResumeOffset {
                offset: u64::MAX,
                max: MAX_RESUME_OFFSET,
            }
        );
        assert_eq!(err.error_code(), "INVALID_RESUME_OFFSET");
    }
}
