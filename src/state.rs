use std::sync::Arc;

use crate::auth::{SignedTokenVerifier, TokenVerifier};
use crate::chat::ChatService;
use crate::config::Settings;
use crate::errors::ChatError;
use crate::history::HistoryStore;
use crate::limiter::MessageRateLimiter;
use crate::llm::{LlmClient, OpenAiChatClient};
use crate::registry::ConnectionRegistry;
use crate::retrieval::{DocumentIndex, RetrievalEngine, SqliteDocumentIndex};
use crate::session::SessionManager;

/// Global application state shared across all routes and background tasks.
///
/// Contains references to:
/// - Runtime configuration
/// - Database-backed stores (chat history, session manager)
/// - The token verifier, rate limiter and connection registry
/// - The chat pipeline service
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub store: HistoryStore,
    pub sessions: SessionManager,
    pub verifier: Arc<dyn TokenVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub limiter: Arc<MessageRateLimiter>,
    pub chat: Arc<ChatService>,
}

impl AppState {
    /// Initializes the application state with production services.
    ///
    /// This process includes:
    /// 1. Starting the LLM client against the configured model server
    /// 2. Opening the databases (chat history, document index)
    /// 3. Wiring the retrieval engine, rate limiter and connection registry
    pub async fn initialize(settings: Settings) -> Result<Arc<Self>, ChatError> {
        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiChatClient::new(&settings.llm));
        let index: Arc<dyn DocumentIndex> = Arc::new(
            SqliteDocumentIndex::new(settings.database.index_path.clone(), Arc::clone(&llm))
                .await?,
        );
        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(SignedTokenVerifier::new(settings.auth.secret_key.clone()));

        Self::with_services(settings, llm, index, verifier).await
    }

    /// Wires the state around externally supplied services. Tests use this
    /// to run the full router against stub models and indexes.
    pub async fn with_services(
        settings: Settings,
        llm: Arc<dyn LlmClient>,
        index: Arc<dyn DocumentIndex>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Arc<Self>, ChatError> {
        let store = HistoryStore::new(settings.database.chat_path.clone()).await?;
        let sessions = SessionManager::new(store.clone(), settings.chat.title_max_len);
        let retrieval = RetrievalEngine::new(
            index,
            settings.retrieval.top_k,
            settings.retrieval.score_threshold,
        );
        let limiter = Arc::new(MessageRateLimiter::new(
            settings.rate_limit.messages_per_minute,
            settings.rate_limit.burst_size,
        )?);
        let registry = Arc::new(ConnectionRegistry::new(
            settings.websocket.max_connections_per_user,
        ));
        let chat = Arc::new(ChatService::new(
            store.clone(),
            sessions.clone(),
            retrieval,
            llm,
            &settings.chat,
        ));

        Ok(Arc::new(AppState {
            settings,
            store,
            sessions,
            verifier,
            registry,
            limiter,
            chat,
        }))
    }
}
