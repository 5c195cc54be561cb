//! HTTP and WebSocket surface: route table, request handlers and the
//! streaming chat protocol.

pub mod handlers;
pub mod router;
pub mod ws;
