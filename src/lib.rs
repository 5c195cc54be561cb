//! Backend for the PharmaAI assistant: a session-aware chat service that
//! grounds model answers in a local document index and streams them over
//! WebSocket.
//!
//! The pipeline behind every message is the same for the HTTP and the
//! streaming surface: resolve the session, replay recent history, retrieve
//! matching documents, build the prompt, generate, persist the exchange.

pub mod auth;
pub mod chat;
pub mod config;
pub mod errors;
pub mod history;
pub mod limiter;
pub mod llm;
pub mod logging;
pub mod prompt;
pub mod registry;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod state;
