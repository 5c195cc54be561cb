use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{
    ClientFrame, Outbound, ServerEvent, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION,
};
use crate::auth::Identity;
use crate::chat::ChatEvent;
use crate::errors::ChatError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

/// Per-connection lifecycle. The reader half of this task processes inbound
/// frames one at a time; a spawned writer task owns the sink and drains the
/// connection's outbound channel, which the registry also feeds.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: String) {
    let (sink, mut inbound) = socket.split();

    let identity = match state.verifier.verify(&token).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!(error = %err, "websocket rejected: authentication failed");
            close_now(sink, CLOSE_POLICY_VIOLATION, "authentication failed").await;
            return;
        }
    };

    let conn_id = Uuid::new_v4();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();

    if !state.registry.connect(conn_id, identity.user_id, out_tx.clone()) {
        close_now(sink, CLOSE_POLICY_VIOLATION, "connection limit reached").await;
        return;
    }
    info!(user_id = identity.user_id, %conn_id, "websocket connected");

    let (done_tx, mut done_rx) = oneshot::channel::<()>();
    tokio::spawn(write_outbound(sink, out_rx, done_tx));

    loop {
        tokio::select! {
            // Writer gone: transport failed or a close frame went out.
            _ = &mut done_rx => break,
            frame = inbound.next() => {
                let Some(Ok(message)) = frame else { break };
                match message {
                    Message::Text(text) => {
                        state.registry.touch(conn_id);
                        if !handle_frame(&state, identity, conn_id, &out_tx, &text).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Transport-level pings and pongs still count as activity.
                    _ => state.registry.touch(conn_id),
                }
            }
        }
    }

    state.registry.disconnect(conn_id);
    info!(user_id = identity.user_id, %conn_id, "websocket disconnected");
}

/// Processes one inbound text frame. Returns false only for errors that
/// must terminate the connection; protocol-level errors are reported
/// in-band and leave the connection usable.
async fn handle_frame(
    state: &Arc<AppState>,
    identity: Identity,
    conn_id: Uuid,
    out: &mpsc::UnboundedSender<Outbound>,
    text: &str,
) -> bool {
    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        send_event(
            out,
            ServerEvent::Error {
                error: "ValidationError".to_string(),
                detail: "malformed frame".to_string(),
            },
        );
        return true;
    };

    if frame.is_pong() {
        debug!(%conn_id, "heartbeat pong");
        return true;
    }

    let message = frame.message.as_deref().unwrap_or("").trim().to_string();
    if message.is_empty() {
        send_event(
            out,
            ServerEvent::Error {
                error: "ValidationError".to_string(),
                detail: "message must not be empty".to_string(),
            },
        );
        return true;
    }

    let decision = state.limiter.check_and_consume(identity.user_id);
    if !decision.allowed {
        send_event(
            out,
            ServerEvent::RateLimit {
                retry_after: decision.retry_after,
                detail: format!(
                    "Rate limit exceeded. Try again in {:.1} seconds.",
                    decision.retry_after
                ),
            },
        );
        return true;
    }

    let mut events = Arc::clone(&state.chat).stream(identity, message, frame.session_id);
    while let Some(item) = events.recv().await {
        match item {
            Ok(event) => {
                state.registry.touch(conn_id);
                if !send_event(out, server_event(event)) {
                    // Writer gone mid-exchange. Dropping `events` makes the
                    // pipeline abandon the exchange.
                    return false;
                }
            }
            Err(err) => {
                let fatal = is_fatal(&err);
                send_event(out, error_event(&err));
                if fatal {
                    warn!(%conn_id, error = %err, "closing connection after unhandled error");
                    let _ = out.send(Outbound::Close {
                        code: CLOSE_INTERNAL_ERROR,
                        reason: "internal error".to_string(),
                    });
                    return false;
                }
                return true;
            }
        }
    }

    true
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    _done: oneshot::Sender<()>,
) {
    while let Some(outbound) = out_rx.recv().await {
        match outbound {
            Outbound::Event(event) => {
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    // Dropping `_done` tells the reader the sink is out of service.
}

async fn close_now(mut sink: SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

fn send_event(out: &mpsc::UnboundedSender<Outbound>, event: ServerEvent) -> bool {
    out.send(Outbound::Event(event)).is_ok()
}

fn server_event(event: ChatEvent) -> ServerEvent {
    match event {
        ChatEvent::Status { status } => ServerEvent::Status { status },
        ChatEvent::Start { session_id } => ServerEvent::Start { session_id },
        ChatEvent::Chunk { content } => ServerEvent::Chunk { content },
        ChatEvent::End {
            sources,
            created_at,
        } => ServerEvent::End {
            sources,
            created_at,
        },
    }
}

fn is_fatal(err: &ChatError) -> bool {
    matches!(
        err,
        ChatError::Internal(_) | ChatError::Config(_) | ChatError::Authentication(_)
    )
}

/// In-band rendering of pipeline errors. Whether a session exists under
/// another account is not revealed, so `Forbidden` reads as `NotFound`.
fn error_event(err: &ChatError) -> ServerEvent {
    match err {
        ChatError::RateLimited { retry_after } => ServerEvent::RateLimit {
            retry_after: *retry_after,
            detail: format!("Rate limit exceeded. Try again in {retry_after:.1} seconds."),
        },
        ChatError::Validation(detail) => ServerEvent::Error {
            error: "ValidationError".to_string(),
            detail: detail.clone(),
        },
        ChatError::NotFound(_) | ChatError::Forbidden(_) => ServerEvent::Error {
            error: "NotFound".to_string(),
            detail: "Session not found".to_string(),
        },
        ChatError::Generation(detail) => ServerEvent::Error {
            error: "GenerationError".to_string(),
            detail: detail.clone(),
        },
        ChatError::Store(detail) => ServerEvent::Error {
            error: "StoreError".to_string(),
            detail: detail.clone(),
        },
        ChatError::Authentication(_) | ChatError::Config(_) | ChatError::Internal(_) => {
            ServerEvent::Error {
                error: "InternalError".to_string(),
                detail: "Internal server error".to_string(),
            }
        }
    }
}
