//! Language-completion collaborator: provider configuration and an
//! OpenAI-compatible chat-completions client with tool calling and
//! structured output.
//!
//! LLM calls go to external APIs. No local model required.

pub mod config;
pub mod providers;
pub mod types;

pub use config::{LlmConfig, ResolvedProvider};
pub use providers::{LanguageModel, OpenAiCompatClient};
pub use types::*;
