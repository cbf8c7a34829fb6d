//! Chatstream Core - Resumable Streaming Chat Sessions
//!
//! This crate turns one long-running model generation into a resumable,
//! ordered sequence of discrete events delivered over a persistent
//! connection. It tracks per-connection delivery position so a client that
//! drops can reconnect and continue numbering where it left off. It is
//! independent of any transport: the daemon crate serves it over a Unix
//! socket, tests drive it directly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Transport (daemon, tests)                    │
//! │        stream_chat / complete / connection_status / health       │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │  EnvelopeStream ("data: {..}\n\n")
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                         CHATSTREAM CORE                          │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │                    StreamOrchestrator                      │  │
//! │  │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌─────────┐  │  │
//! │  │  │ Validator │  │ Resolver  │  │ Registry  │  │ Reaper  │  │  │
//! │  │  └───────────┘  └───────────┘  └───────────┘  └─────────┘  │  │
//! │  └───────────┬────────────────────────────────────┬───────────┘  │
//! │              │                                    │              │
//! │     ┌────────▼─────────┐                ┌─────────▼──────────┐   │
//! │     │   ModelRunner    │                │ ConversationStore  │   │
//! │     │ (OpenAI-compat,  │                │   (in-memory)      │   │
//! │     │  scripted)       │                │                    │   │
//! │     └──────────────────┘                └────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamOrchestrator`]: Entry point for streaming and synchronous chat
//! - [`EnvelopeStream`]: Lazy envelope sequence for one streaming attempt
//! - [`Envelope`]: One unit of streaming output (token, end, error)
//! - [`SessionRegistry`]: Delivery position and status per connection
//! - [`ResumeDecision`]: How a requested resume offset was interpreted
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use chatstream_core::{
//!     backend::ScriptedRunner, encode_frame, InMemoryConversationStore,
//!     SessionRegistry, StreamOrchestrator,
//! };
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = StreamOrchestrator::new(
//!         Arc::new(ScriptedRunner::new()),
//!         Arc::new(InMemoryConversationStore::default()),
//!         SessionRegistry::new(),
//!     );
//!
//!     let mut stream = orchestrator.stream_chat("Hello there", Some("c1"), 0).unwrap();
//!     while let Some(envelope) = stream.next().await {
//!         print!("{}", encode_frame(&envelope).unwrap());
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`envelope`]: Event envelopes and their `data:` frame encoding
//! - [`registry`]: Session registry and the background reaper
//! - [`resolver`]: Resume offset interpretation
//! - [`orchestrator`]: Streaming and synchronous chat entry points
//! - [`backend`]: Model runner abstraction (OpenAI-compatible, scripted)
//! - [`conversation`]: Conversation history store
//! - [`security`]: Input validation
//! - [`error`]: Error taxonomy and client error payloads
//! - [`config`]: TOML and environment configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod conversation;
pub mod envelope;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod security;

pub use backend::{ModelRunner, OpenAiCompatBackend, RunOutput, RunnerError, RunnerEvent};
pub use config::{load_config, ChatstreamConfig, ConfigError, ConfigOverrides, LogFormat};
pub use conversation::{ConversationHandle, ConversationStore, InMemoryConversationStore};
pub use envelope::{encode_frame, Envelope, EnvelopeError, FrameDecoder, FrameEncoder};
pub use error::{ChatError, ErrorPayload, InStreamError};
pub use orchestrator::{ChatReply, EnvelopeStream, HealthReport, StreamOrchestrator};
pub use registry::{
    ConnectionId, RegistrySummary, SessionReaper, SessionRegistry, SessionSnapshot, SessionState,
    SessionStatus,
};
pub use resolver::{resolve, ResumeDecision};
pub use security::{ChatLimits, InputValidator, ValidationError};
