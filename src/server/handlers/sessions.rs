use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::authenticate;
use crate::errors::ChatError;
use crate::history::DEFAULT_PAGE_LIMIT;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct PageParams {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

/// The caller's sessions, most recently updated first.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ChatError> {
    let identity = authenticate(&state, &headers).await?;
    let sessions = state.store.list_sessions(identity.user_id).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// One page of a session's messages, oldest first. Assistant turns carry
/// their sources; a foreign session reads as missing.
pub async fn session_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<impl IntoResponse, ChatError> {
    let identity = authenticate(&state, &headers).await?;
    let session = state.sessions.resolve(identity, Some(&session_id)).await?;

    let messages = state
        .store
        .messages_page(
            &session.id,
            params.offset.unwrap_or(0),
            params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        )
        .await?;

    Ok(Json(json!({ "messages": messages })))
}

/// Soft delete. The session and its messages stop appearing anywhere but
/// stay in the database.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ChatError> {
    let identity = authenticate(&state, &headers).await?;

    let deleted = state
        .store
        .soft_delete_session(&session_id, identity.user_id)
        .await?;
    if !deleted {
        return Err(ChatError::NotFound("Session not found".to_string()));
    }

    Ok(Json(json!({ "success": true })))
}
