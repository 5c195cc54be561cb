//! Document retrieval over the medicine knowledge base.
//!
//! `DocumentIndex` is the storage seam; `RetrievalEngine` applies the
//! similarity threshold and formats the surviving documents into the
//! context block the prompt assembler consumes.

mod sqlite;

pub use sqlite::{IndexDocument, SqliteDocumentIndex};

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::errors::ChatError;

/// A candidate document with its distance to the query.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub content: String,
    pub metadata: Value,
    /// L2 distance to the query embedding. Lower is more similar.
    pub score: f32,
}

#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// The `k` nearest documents, most similar first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredDocument>, ChatError>;
}

/// Outcome of a retrieval pass. An empty `context` means no document was
/// similar enough and the answer will not be grounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retrieved {
    pub context: String,
    pub sources: Vec<Value>,
}

impl Retrieved {
    pub fn is_grounded(&self) -> bool {
        !self.context.is_empty()
    }
}

pub struct RetrievalEngine {
    index: Arc<dyn DocumentIndex>,
    top_k: usize,
    score_threshold: f32,
}

impl RetrievalEngine {
    pub fn new(index: Arc<dyn DocumentIndex>, top_k: usize, score_threshold: f32) -> Self {
        Self {
            index,
            top_k,
            score_threshold,
        }
    }

    /// Searches the index and keeps candidates strictly under the distance
    /// threshold, most similar first. Zero survivors is a valid outcome.
    pub async fn retrieve(&self, query: &str) -> Result<Retrieved, ChatError> {
        let candidates = self.index.search(query, self.top_k).await?;
        let candidate_count = candidates.len();

        let mut survivors: Vec<ScoredDocument> = candidates
            .into_iter()
            .filter(|doc| doc.score < self.score_threshold)
            .collect();
        survivors.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal));

        debug!(
            candidates = candidate_count,
            survivors = survivors.len(),
            threshold = self.score_threshold,
            "retrieval pass"
        );

        if survivors.is_empty() {
            return Ok(Retrieved::default());
        }

        let context = survivors
            .iter()
            .enumerate()
            .map(|(i, doc)| format!("[Source {}] {}", i + 1, doc.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let sources = survivors.into_iter().map(|doc| doc.metadata).collect();

        Ok(Retrieved { context, sources })
    }
}
