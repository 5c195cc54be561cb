//! Generation orchestrator. One pipeline serves the HTTP single-shot call
//! and the WebSocket stream: resolve session, load the history window,
//! retrieve, build the prompt, generate, persist the pair, set the title.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auth::Identity;
use crate::config::ChatSettings;
use crate::errors::ChatError;
use crate::history::HistoryStore;
use crate::llm::LlmClient;
use crate::prompt;
use crate::retrieval::RetrievalEngine;
use crate::session::SessionManager;

pub const STATUS_INITIALIZING: &str = "Initializing chat session...";
pub const STATUS_LOADING_HISTORY: &str = "Loading conversation history...";
pub const STATUS_SEARCHING: &str = "Searching for relevant information...";
pub const STATUS_GENERATING: &str = "Generating answer...";

const STREAM_BUFFER: usize = 32;

/// Progress and content events of one streamed exchange, in emission order:
/// `Status` narration, `Start`, `Chunk` per fragment, `End` after the pair
/// has been persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Status { status: String },
    Start { session_id: String },
    Chunk { content: String },
    End { sources: Vec<Value>, created_at: String },
}

/// Result of a single-shot exchange.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub session_id: String,
    pub answer: String,
    pub sources: Vec<Value>,
    pub created_at: String,
}

pub struct ChatService {
    store: HistoryStore,
    sessions: SessionManager,
    retrieval: RetrievalEngine,
    llm: Arc<dyn LlmClient>,
    history_limit: i64,
}

impl ChatService {
    pub fn new(
        store: HistoryStore,
        sessions: SessionManager,
        retrieval: RetrievalEngine,
        llm: Arc<dyn LlmClient>,
        settings: &ChatSettings,
    ) -> Self {
        Self {
            store,
            sessions,
            retrieval,
            llm,
            history_limit: settings.history_limit,
        }
    }

    /// Single-shot exchange: the full pipeline, answer returned only after
    /// the pair is persisted.
    pub async fn process(
        &self,
        identity: Identity,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<ChatOutcome, ChatError> {
        validate_message(message)?;

        let session = self.sessions.resolve(identity, session_id).await?;
        let history = self
            .store
            .recent_history(&session.id, self.history_limit)
            .await?;
        let retrieved = self.retrieval.retrieve(message).await?;

        let messages = prompt::build(message, &retrieved.context, &history);
        let answer = self.llm.complete(&messages).await?;

        let created_at = self
            .store
            .append_exchange(&session.id, message, &answer, &retrieved.sources)
            .await?;
        self.finish_exchange(&session.id, message, retrieved.sources.len())
            .await;

        Ok(ChatOutcome {
            session_id: session.id,
            answer,
            sources: retrieved.sources,
            created_at,
        })
    }

    /// Streamed exchange. The returned receiver yields the event sequence;
    /// an error item ends the stream. Dropping the receiver mid-generation
    /// stops the pipeline and skips persistence.
    pub fn stream(
        self: Arc<Self>,
        identity: Identity,
        message: String,
        session_id: Option<String>,
    ) -> mpsc::Receiver<Result<ChatEvent, ChatError>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            self.run_stream(identity, message, session_id, tx).await;
        });

        rx
    }

    async fn run_stream(
        &self,
        identity: Identity,
        message: String,
        session_id: Option<String>,
        tx: mpsc::Sender<Result<ChatEvent, ChatError>>,
    ) {
        if let Err(err) = validate_message(&message) {
            let _ = tx.send(Err(err)).await;
            return;
        }

        if !emit(&tx, ChatEvent::Status { status: STATUS_INITIALIZING.to_string() }).await {
            return;
        }
        let session = match self.sessions.resolve(identity, session_id.as_deref()).await {
            Ok(session) => session,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        if !emit(&tx, ChatEvent::Status { status: STATUS_LOADING_HISTORY.to_string() }).await {
            return;
        }
        let history = match self.store.recent_history(&session.id, self.history_limit).await {
            Ok(history) => history,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        if !emit(&tx, ChatEvent::Status { status: STATUS_SEARCHING.to_string() }).await {
            return;
        }
        let retrieved = match self.retrieval.retrieve(&message).await {
            Ok(retrieved) => retrieved,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        if !emit(&tx, ChatEvent::Status { status: STATUS_GENERATING.to_string() }).await {
            return;
        }
        if !emit(&tx, ChatEvent::Start { session_id: session.id.clone() }).await {
            return;
        }

        let messages = prompt::build(&message, &retrieved.context, &history);
        let mut fragments = match self.llm.stream(&messages).await {
            Ok(fragments) => fragments,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        let mut answer = String::new();
        while let Some(item) = fragments.recv().await {
            match item {
                Ok(fragment) => {
                    answer.push_str(&fragment);
                    if !emit(&tx, ChatEvent::Chunk { content: fragment }).await {
                        // Client gone mid-generation. Returning drops the
                        // fragment receiver, which stops the producer, and
                        // nothing is persisted for this exchange.
                        warn!(session_id = %session.id, "client dropped mid-generation, exchange discarded");
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }

        // Generation is complete, so the pair is persisted even when the
        // closing event can no longer be delivered.
        let created_at = match self
            .store
            .append_exchange(&session.id, &message, &answer, &retrieved.sources)
            .await
        {
            Ok(created_at) => created_at,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        self.finish_exchange(&session.id, &message, retrieved.sources.len())
            .await;

        let _ = tx
            .send(Ok(ChatEvent::End {
                sources: retrieved.sources,
                created_at,
            }))
            .await;
    }

    /// Post-persist bookkeeping. A failed title write leaves the sentinel
    /// in place, which the next exchange retries; it never fails the
    /// already-persisted exchange.
    async fn finish_exchange(&self, session_id: &str, message: &str, source_count: usize) {
        if let Err(err) = self.sessions.maybe_set_title(session_id, message).await {
            warn!(session_id, error = %err, "session title update failed");
        }
        info!(session_id, sources = source_count, "chat exchange complete");
    }
}

async fn emit(tx: &mpsc::Sender<Result<ChatEvent, ChatError>>, event: ChatEvent) -> bool {
    tx.send(Ok(event)).await.is_ok()
}

fn validate_message(message: &str) -> Result<(), ChatError> {
    if message.trim().is_empty() {
        return Err(ChatError::Validation("message must not be empty".to_string()));
    }
    Ok(())
}
