//! SQLite-backed document index.
//!
//! In-process vector store: embeddings live as little-endian f32 BLOBs next
//! to content and JSON metadata, searched by brute-force L2 distance. Sized
//! for a catalog of thousands of products, not millions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{DocumentIndex, ScoredDocument};
use crate::errors::ChatError;
use crate::llm::LlmClient;

/// A document to be ingested into the index.
#[derive(Debug, Clone)]
pub struct IndexDocument {
    pub content: String,
    pub metadata: Value,
}

pub struct SqliteDocumentIndex {
    pool: SqlitePool,
    embedder: Arc<dyn LlmClient>,
}

impl SqliteDocumentIndex {
    pub async fn new(db_path: PathBuf, embedder: Arc<dyn LlmClient>) -> Result<Self, ChatError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await?;

        let index = Self { pool, embedder };
        index.init_schema().await?;
        Ok(index)
    }

    async fn init_schema(&self) -> Result<(), ChatError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Embeds and stores a batch of documents in one transaction.
    pub async fn insert_documents(&self, documents: &[IndexDocument]) -> Result<usize, ChatError> {
        if documents.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = documents.iter().map(|doc| doc.content.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let mut tx = self.pool.begin().await?;
        for (doc, embedding) in documents.iter().zip(embeddings.iter()) {
            let metadata = serde_json::to_string(&doc.metadata).map_err(ChatError::internal)?;
            sqlx::query(
                "INSERT INTO documents (id, content, metadata, embedding)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&doc.content)
            .bind(&metadata)
            .bind(serialize_embedding(embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(documents.len())
    }

    pub async fn count(&self) -> Result<usize, ChatError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl DocumentIndex for SqliteDocumentIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredDocument>, ChatError> {
        let embeddings = self.embedder.embed(&[query.to_string()]).await?;
        let Some(query_embedding) = embeddings.first() else {
            return Err(ChatError::Generation(
                "embedding server returned no vector for the query".to_string(),
            ));
        };

        let rows = sqlx::query("SELECT content, metadata, embedding FROM documents")
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<ScoredDocument> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = deserialize_embedding(&blob);
                let metadata_str: String = row.get("metadata");
                let metadata = serde_json::from_str(&metadata_str).unwrap_or(Value::Null);

                ScoredDocument {
                    content: row.get("content"),
                    metadata,
                    score: l2_distance(query_embedding, &stored),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k.max(1));

        Ok(scored)
    }
}

fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Euclidean distance. Mismatched dimensions (stale index after an
/// embedding-model change) rank last instead of failing the search.
fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::MAX;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
