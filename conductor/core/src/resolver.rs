//! Reconnection Resolver
//!
//! Decides how a requested resume offset is interpreted. Resumption is a
//! best-effort counter reset: a reconnecting client gets a fresh generation
//! whose token indices start at the offset it asked for. Nothing generated
//! by the earlier attempt is replayed.
//!
//! A still-running attempt for the same conversation is reported but not
//! stopped; both streams proceed independently.

use crate::registry::{SessionRegistry, SessionSnapshot};

/// How a new streaming attempt should number its tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// No running attempt for this conversation
    Fresh {
        /// Index of the first token to deliver
        start_index: u64,
    },
    /// Another attempt for the same conversation is still running
    Concurrent {
        /// Index of the first token to deliver
        start_index: u64,
        /// The running attempt
        existing: SessionSnapshot,
    },
}

impl ResumeDecision {
    /// Index of the first token to deliver
    #[must_use]
    pub fn start_index(&self) -> u64 {
        match self {
            Self::Fresh { start_index } | Self::Concurrent { start_index, .. } => *start_index,
        }
    }

    /// Whether another attempt is running for the same conversation
    #[must_use]
    pub fn is_concurrent(&self) -> bool {
        matches!(self, Self::Concurrent { .. })
    }
}

/// Resolve a resume request against the registry
///
/// Sessions that already reached a terminal state are ignored. Stateless
/// requests (no conversation id) are always `Fresh`.
#[must_use]
pub fn resolve(
    registry: &SessionRegistry,
    conversation_id: Option<&str>,
    requested_offset: u64,
) -> ResumeDecision {
    let existing = conversation_id.and_then(|id| registry.find_active(id));

    match existing {
        Some(existing) => {
            tracing::warn!(
                conversation_id = conversation_id.unwrap_or_default(),
                existing = %existing.connection_id,
                existing_last_index = existing.last_token_index,
                requested_offset,
                "Concurrent stream for conversation"
            );
            ResumeDecision::Concurrent {
                start_index: requested_offset,
                existing,
            }
        }
        None => {
            if requested_offset > 0 {
                tracing::debug!(
                    conversation_id = conversation_id.unwrap_or("-"),
                    requested_offset,
                    "Resuming with counter reset"
                );
            }
            ResumeDecision::Fresh {
                start_index: requested_offset,
            }
        }
    }
}
