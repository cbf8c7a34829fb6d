//! Event Envelopes and Frame Protocol
//!
//! Wire representation of streaming output. Every unit a client receives is an
//! [`Envelope`]: a token, the end-of-stream marker, or an error. Envelopes are
//! carried as event-stream frames:
//!
//! ```text
//! data: {"token":"Hi","token_index":0,"context_id":"default","event_type":"token"}\n
//! \n
//! ```
//!
//! The JSON payload is always compact. `serde_json` escapes newlines inside
//! string values, so a payload never contains a raw `\n` and one envelope maps
//! to exactly one frame.
//!
//! # Security
//!
//! - Maximum frame size is enforced on both encode and decode
//! - A malformed frame is consumed and reported, it never poisons the buffer

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Context identifier reported for streams not bound to a conversation
pub const DEFAULT_CONTEXT_ID: &str = "default";

/// Prefix of a data line inside a frame
const DATA_PREFIX: &str = "data:";

/// Blank line terminating a frame
const FRAME_TERMINATOR: &[u8] = b"\n\n";

/// Largest frame body the decoder accepts: `data: ` plus a maximal payload
const MAX_FRAME_BODY: usize = MAX_FRAME_SIZE + DATA_PREFIX.len() + 1;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// One discrete unit of streaming output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "lowercase")]
pub enum Envelope {
    /// One generated fragment with its absolute position in the stream
    Token {
        /// The generated text
        token: String,
        /// Absolute sequence position
        token_index: u64,
        /// Conversation the token belongs to
        context_id: String,
    },
    /// Terminal success marker
    End {
        /// Conversation the stream belonged to
        context_id: String,
        /// Complete generated output
        final_output: String,
    },
    /// Terminal failure marker
    Error {
        /// Conversation the stream belonged to, if any
        context_id: Option<String>,
        /// Machine-readable error code
        error_code: String,
        /// Human-readable message (never contains internal detail)
        message: String,
    },
}

impl Envelope {
    /// Create a token envelope
    pub fn token(token: impl Into<String>, token_index: u64, context_id: impl Into<String>) -> Self {
        Self::Token {
            token: token.into(),
            token_index,
            context_id: context_id.into(),
        }
    }

    /// Create an end envelope
    pub fn end(context_id: impl Into<String>, final_output: impl Into<String>) -> Self {
        Self::End {
            context_id: context_id.into(),
            final_output: final_output.into(),
        }
    }

    /// Create an error envelope
    pub fn error(
        context_id: Option<String>,
        error_code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            context_id,
            error_code: error_code.into(),
            message: message.into(),
        }
    }

    /// Turn a raw model-runner delta into a token envelope
    ///
    /// Whitespace-only deltas yield `None` and must not consume an index.
    #[must_use]
    pub fn from_delta(delta: &str, token_index: u64, context_id: &str) -> Option<Self> {
        if delta.trim().is_empty() {
            return None;
        }
        Some(Self::token(delta, token_index, context_id))
    }

    /// Wire name of this envelope's variant
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this envelope closes the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Token { .. } => false,
            Self::End { .. } | Self::Error { .. } => true,
        }
    }

    /// Token index, for token envelopes
    #[must_use]
    pub fn token_index(&self) -> Option<u64> {
        match self {
            Self::Token { token_index, .. } => Some(*token_index),
            Self::End { .. } | Self::Error { .. } => None,
        }
    }

    /// Conversation identifier carried by the envelope
    #[must_use]
    pub fn context_id(&self) -> Option<&str> {
        match self {
            Self::Token { context_id, .. } | Self::End { context_id, .. } => Some(context_id),
            Self::Error { context_id, .. } => context_id.as_deref(),
        }
    }
}

/// Errors from encoding or decoding frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Frame exceeds [`MAX_FRAME_SIZE`]
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Observed size
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Frame is not valid UTF-8 or carries no usable data line
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Encode an envelope to a `data: <json>\n\n` frame
///
/// # Errors
///
/// Returns `EnvelopeError::FrameTooLarge` if the payload exceeds
/// `MAX_FRAME_SIZE`.
pub fn encode_frame(envelope: &Envelope) -> Result<String, EnvelopeError> {
    let json =
        serde_json::to_string(envelope).map_err(|e| EnvelopeError::Serialization(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(EnvelopeError::FrameTooLarge {
            size: json.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(format!("{DATA_PREFIX} {json}\n\n"))
}

/// Encoder for streaming frame output
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    /// Create a new encoder
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encode an envelope to frame bytes
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
        encode_frame(envelope).map(String::into_bytes)
    }
}

/// Decoder for event-stream frames
///
/// Buffers incoming bytes (which may split frames or UTF-8 sequences
/// arbitrarily) and yields complete envelopes.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Bytes after `read_pos` already searched for a terminator
    scan_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next envelope
    ///
    /// Returns:
    /// - `Ok(Some(envelope))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the next frame is invalid (the frame is skipped)
    ///
    /// Each byte is searched for the terminator once, however the frame
    /// was chunked.
    pub fn decode(&mut self) -> Result<Option<Envelope>, EnvelopeError> {
        loop {
            let pending = &self.buffer[self.read_pos..];

            // A terminator may straddle the previous scan boundary
            let from = self.scan_pos.saturating_sub(FRAME_TERMINATOR.len() - 1);
            let Some(found) = find_terminator(&pending[from..]) else {
                if pending.len() > MAX_FRAME_BODY + FRAME_TERMINATOR.len() {
                    let size = pending.len();
                    self.clear();
                    return Err(EnvelopeError::FrameTooLarge {
                        size,
                        max: MAX_FRAME_SIZE,
                    });
                }
                self.scan_pos = pending.len();
                return Ok(None);
            };

            let end = from + found;
            let frame = (end <= MAX_FRAME_BODY).then(|| pending[..end].to_vec());
            self.read_pos += end + FRAME_TERMINATOR.len();
            self.scan_pos = 0;

            let Some(frame) = frame else {
                return Err(EnvelopeError::FrameTooLarge {
                    size: end,
                    max: MAX_FRAME_SIZE,
                });
            };

            match parse_frame(&frame)? {
                Some(envelope) => return Ok(Some(envelope)),
                // Comment-only or keep-alive frame
                None => continue,
            }
        }
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
        self.scan_pos = 0;
    }
}

fn find_terminator(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(FRAME_TERMINATOR.len())
        .position(|w| w == FRAME_TERMINATOR)
}

/// Parse one frame body (without its terminator)
///
/// Multiple `data:` lines are joined with `\n`. Lines that are not data
/// lines (comments, `event:`, `id:`) are ignored.
fn parse_frame(frame: &[u8]) -> Result<Option<Envelope>, EnvelopeError> {
    let text =
        std::str::from_utf8(frame).map_err(|e| EnvelopeError::MalformedFrame(e.to_string()))?;

    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix(DATA_PREFIX))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();

    if data.is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&data.join("\n"))
        .map(Some)
        .map_err(|e| EnvelopeError::Serialization(e.to_string()))
}
