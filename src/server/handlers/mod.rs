pub mod chat;
pub mod health;
pub mod sessions;

use axum::http::HeaderMap;

use crate::auth::{bearer_token, Identity};
use crate::errors::ChatError;
use crate::state::AppState;

/// Resolves the caller from the `Authorization` header. Every chat route
/// starts here.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, ChatError> {
    let token = bearer_token(headers)?;
    state.verifier.verify(token).await
}
