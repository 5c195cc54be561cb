use tracing::debug;

use crate::auth::Identity;
use crate::errors::ChatError;
use crate::history::{ChatSession, HistoryStore, DEFAULT_SESSION_TITLE};

/// Resolves incoming session ids to owned sessions and derives titles from
/// first messages. Every chat entry point goes through [`resolve`] so the
/// ownership check cannot be skipped.
///
/// [`resolve`]: SessionManager::resolve
#[derive(Debug, Clone)]
pub struct SessionManager {
    store: HistoryStore,
    title_max_len: usize,
}

impl SessionManager {
    pub fn new(store: HistoryStore, title_max_len: usize) -> Self {
        Self {
            store,
            title_max_len,
        }
    }

    /// No id creates a fresh session under the caller. An id must name a
    /// live session owned by the caller; a foreign owner yields `Forbidden`,
    /// which the HTTP layer reports as 404.
    pub async fn resolve(
        &self,
        identity: Identity,
        session_id: Option<&str>,
    ) -> Result<ChatSession, ChatError> {
        let Some(session_id) = session_id else {
            let session = self
                .store
                .create_session(identity.user_id, DEFAULT_SESSION_TITLE)
                .await?;
            debug!(session_id = %session.id, user_id = identity.user_id, "created chat session");
            return Ok(session);
        };

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ChatError::NotFound("Session not found".to_string()))?;

        if session.user_id != identity.user_id {
            return Err(ChatError::Forbidden(format!(
                "session {} belongs to another user",
                session.id
            )));
        }

        Ok(session)
    }

    /// Titles the session after its first exchange. The store-side
    /// compare-and-set keeps later or concurrent messages from renaming.
    pub async fn maybe_set_title(
        &self,
        session_id: &str,
        first_message: &str,
    ) -> Result<bool, ChatError> {
        let title = derive_title(first_message, self.title_max_len);
        self.store.set_title_if_default(session_id, &title).await
    }
}

/// Collapses whitespace runs and truncates to `max_len` characters at a word
/// boundary, appending `"..."`. Blank input falls back to the default title.
pub fn derive_title(text: &str, max_len: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_SESSION_TITLE.to_string();
    }

    if collapsed.chars().count() <= max_len {
        return collapsed;
    }

    let head: String = collapsed.chars().take(max_len).collect();
    // rfind returns a byte offset, but a space is always a char boundary.
    let cut = match head.rfind(' ') {
        Some(pos) if pos > 0 => &head[..pos],
        _ => head.as_str(),
    };

    format!("{}...", cut.trim_end())
}
