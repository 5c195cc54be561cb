use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Inbound frame. Either a chat turn (`message` set, `session_id` optional)
/// or the `{"type": "pong"}` heartbeat reply.
#[derive(Debug, Deserialize, Default)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub frame_type: Option<String>,
    pub message: Option<String>,
    pub session_id: Option<String>,
}

impl ClientFrame {
    pub fn is_pong(&self) -> bool {
        self.frame_type.as_deref() == Some("pong")
    }
}

/// Outbound events, discriminated by `type` on the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Ping,
    Status { status: String },
    Start { session_id: String },
    Chunk { content: String },
    End { sources: Vec<Value>, created_at: String },
    RateLimit { retry_after: f64, detail: String },
    Error { error: String, detail: String },
}

/// What a connection's writer task can be asked to deliver. The registry
/// and the protocol handler both enqueue through the same channel, so
/// closes are ordered behind any events already queued.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close { code: u16, reason: String },
}
