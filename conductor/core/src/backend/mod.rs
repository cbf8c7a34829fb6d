//! Model Runner Integration
//!
//! This module provides abstracted access to model providers through a
//! common trait interface.
//!
//! # Available Runners
//!
//! - **OpenAI-compatible**: any chat completions endpoint (default)
//! - **Scripted**: deterministic queued scripts for tests and demos
//!
//! # Usage
//!
//! ```ignore
//! use chatstream_core::backend::{BackendConfig, ModelRunner, OpenAiCompatBackend};
//!
//! let runner = OpenAiCompatBackend::new(BackendConfig::default())?;
//! let rx = runner.run_streaming("Hello!", None).await?;
//! ```

mod openai;
mod scripted;
mod traits;

pub use openai::OpenAiCompatBackend;
pub use scripted::{RecordedCall, Script, ScriptEnding, ScriptedRunner};
pub use traits::{
    estimate_tokens, BackendConfig, ModelRunner, RunOutput, RunnerError, RunnerEvent,
    DEFAULT_SYSTEM_PROMPT,
};
