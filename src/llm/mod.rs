//! Language-model collaborator: wire types, the `LlmClient` seam and the
//! OpenAI-compatible HTTP implementation.

mod client;
mod types;

pub use client::{LlmClient, OpenAiChatClient};
pub use types::{ChatMessage, ChatRole};
