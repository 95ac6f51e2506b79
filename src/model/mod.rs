//! LLM client and prompts used by the reasoning backbone.
//!
//! - [`api::LlmClient`] -- OpenAI-compatible chat completion client.
//! - [`prompt`] -- next-step prompt construction and step parsing.

pub mod api;
pub mod prompt;

pub use api::{ChatMessage, ChatResponse, Choice, LlmClient, Usage};
