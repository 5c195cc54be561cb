use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::authenticate;
use crate::errors::ChatError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Single-shot chat exchange. A null `session_id` starts a new session;
/// the answer is returned only after the pair is persisted.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<impl IntoResponse, ChatError> {
    let identity = authenticate(&state, &headers).await?;

    let outcome = state
        .chat
        .process(identity, &payload.message, payload.session_id.as_deref())
        .await?;

    Ok(Json(json!({
        "session_id": outcome.session_id,
        "message": outcome.answer,
        "sources": outcome.sources,
        "created_at": outcome.created_at,
    })))
}
