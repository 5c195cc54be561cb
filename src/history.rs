use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::ChatError;

const SCHEMA_VERSION: i64 = 1;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const MAX_PAGE_LIMIT: i64 = 200;

pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// Title given to a session created without one. The first successful
/// exchange replaces it via [`HistoryStore::set_title_if_default`].
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: String,
    pub user_id: i64,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Value>,
    pub created_at: String,
}

/// SQLite-backed session and message store. Sessions are owned by a single
/// user for life and soft-deleted; message pairs are written atomically so
/// a half-recorded exchange is never visible.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, ChatError> {
        let connect_options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(connect_options)
            .await?;

        let store = Self { pool };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<(), ChatError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;

        match version {
            0 => self.create_schema().await,
            SCHEMA_VERSION => Ok(()),
            other => Err(ChatError::Store(format!(
                "chat database has unsupported schema version {other}"
            ))),
        }
    }

    async fn create_schema(&self) -> Result<(), ChatError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "\
            CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                title TEXT NOT NULL CHECK(length(trim(title)) > 0),
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                deleted_at TEXT
            )",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "\
            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL,
                sources TEXT,
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                deleted_at TEXT,
                FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_updated
             ON chat_sessions(user_id, updated_at DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session_created
             ON chat_messages(session_id, created_at)",
        )
        .execute(&mut *tx)
        .await?;

        let pragma = format!("PRAGMA user_version = {SCHEMA_VERSION}");
        sqlx::query(&pragma).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn create_session(
        &self,
        user_id: i64,
        title: &str,
    ) -> Result<ChatSession, ChatError> {
        let session_id = Uuid::new_v4().to_string();

        sqlx::query("INSERT INTO chat_sessions (id, user_id, title) VALUES (?1, ?2, ?3)")
            .bind(&session_id)
            .bind(user_id)
            .bind(title)
            .execute(&self.pool)
            .await?;

        self.get_session(&session_id).await?.ok_or_else(|| {
            ChatError::Store("session vanished immediately after insert".to_string())
        })
    }

    /// Fetches a non-deleted session. Ownership is the caller's concern.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>, ChatError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at
             FROM chat_sessions
             WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| session_from_row(&row)).transpose()
    }

    /// The caller's non-deleted sessions, most recently updated first.
    pub async fn list_sessions(&self, user_id: i64) -> Result<Vec<SessionSummary>, ChatError> {
        let rows = sqlx::query(
            "\
            SELECT s.id, s.title, s.created_at, s.updated_at,
                   (SELECT COUNT(*) FROM chat_messages
                    WHERE session_id = s.id AND deleted_at IS NULL) AS message_count,
                   (SELECT content FROM chat_messages
                    WHERE session_id = s.id AND deleted_at IS NULL
                    ORDER BY created_at DESC LIMIT 1) AS last_message
            FROM chat_sessions s
            WHERE s.user_id = ?1 AND s.deleted_at IS NULL
            ORDER BY s.updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    /// Soft-deletes a session and its messages in one transaction. Returns
    /// false when no live session matched the id/owner pair.
    pub async fn soft_delete_session(
        &self,
        session_id: &str,
        user_id: i64,
    ) -> Result<bool, ChatError> {
        let mut tx = self.pool.begin().await?;
        let now = format_timestamp(Utc::now());

        let result = sqlx::query(
            "UPDATE chat_sessions SET deleted_at = ?1
             WHERE id = ?2 AND user_id = ?3 AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(session_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE chat_messages SET deleted_at = ?1
             WHERE session_id = ?2 AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// The last `limit` messages of a session in chronological order.
    pub async fn recent_history(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, ChatError> {
        let limit = sanitize_limit(limit);

        let rows = sqlx::query(
            "\
            SELECT id, role, content, sources, created_at
            FROM (
                SELECT id, role, content, sources, created_at
                FROM chat_messages
                WHERE session_id = ?1 AND deleted_at IS NULL
                ORDER BY created_at DESC
                LIMIT ?2
            )
            ORDER BY created_at ASC",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// One page of a session's messages, oldest first.
    pub async fn messages_page(
        &self,
        session_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, ChatError> {
        let limit = sanitize_limit(limit);
        let offset = offset.max(0);

        let rows = sqlx::query(
            "\
            SELECT id, role, content, sources, created_at
            FROM chat_messages
            WHERE session_id = ?1 AND deleted_at IS NULL
            ORDER BY created_at ASC
            LIMIT ?2 OFFSET ?3",
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Writes the user/assistant pair of a completed exchange in one
    /// transaction and bumps the session's `updated_at`. The assistant row
    /// is stamped one millisecond after the user row so `created_at` stays
    /// a total order within the session. Returns the assistant timestamp.
    pub async fn append_exchange(
        &self,
        session_id: &str,
        user_text: &str,
        assistant_text: &str,
        sources: &[Value],
    ) -> Result<String, ChatError> {
        let user_at = Utc::now();
        let assistant_at = user_at + chrono::Duration::milliseconds(1);
        let user_stamp = format_timestamp(user_at);
        let assistant_stamp = format_timestamp(assistant_at);

        let sources_json = if sources.is_empty() {
            None
        } else {
            Some(serde_json::to_string(sources).map_err(ChatError::internal)?)
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, role, content, created_at)
             VALUES (?1, ?2, 'user', ?3, ?4)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(user_text)
        .bind(&user_stamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, role, content, sources, created_at)
             VALUES (?1, ?2, 'assistant', ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(assistant_text)
        .bind(&sources_json)
        .bind(&assistant_stamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(&assistant_stamp)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(assistant_stamp)
    }

    /// Compare-and-set title update: only fires while the title still holds
    /// the sentinel, so concurrent first messages cannot both rename.
    pub async fn set_title_if_default(
        &self,
        session_id: &str,
        title: &str,
    ) -> Result<bool, ChatError> {
        let result = sqlx::query(
            "UPDATE chat_sessions
             SET title = ?1, updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE id = ?2 AND title = ?3 AND deleted_at IS NULL",
        )
        .bind(title)
        .bind(session_id)
        .bind(DEFAULT_SESSION_TITLE)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChatSession, ChatError> {
    Ok(ChatSession {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn summary_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SessionSummary, ChatError> {
    let last_message: Option<String> = row.try_get("last_message")?;
    let preview = last_message.unwrap_or_default().chars().take(100).collect();

    Ok(SessionSummary {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        message_count: row.try_get("message_count")?,
        preview,
    })
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage, ChatError> {
    // Only the free-form JSON column degrades leniently; a malformed
    // sources payload reads as no sources.
    let raw_sources: Option<String> = row.try_get("sources")?;
    let sources = raw_sources.and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(StoredMessage {
        id: row.try_get("id")?,
        role: row.try_get("role")?,
        content: row.try_get("content")?,
        sources,
        created_at: row.try_get("created_at")?,
    })
}

fn sanitize_limit(limit: i64) -> i64 {
    if limit <= 0 {
        return DEFAULT_PAGE_LIMIT;
    }
    limit.min(MAX_PAGE_LIMIT)
}
