//! Memory traits: long-term storage of conversation turns with hybrid search.
//!
//! The memory system lets a session recall earlier turns and inject them
//! back into the context window. Ranking combines:
//! - Vector similarity between embeddings (semantic)
//! - Keyword overlap between the query and the stored text (lexical)

use crate::error::MemoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique ID, assigned on store
    pub id: String,

    /// What the user said
    pub user_text: String,

    /// What the assistant answered
    pub assistant_text: String,

    /// Embedding of `content()`, owned by the store
    #[serde(default)]
    pub embedding: Vec<f32>,

    /// When this record was stored
    pub created_at: DateTime<Utc>,

    /// The session the turn came from, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl MemoryRecord {
    /// The combined turn text that is embedded and keyword-matched.
    pub fn content(&self) -> String {
        turn_text(&self.user_text, &self.assistant_text)
    }
}

/// Render a user/assistant pair the way records are embedded.
pub fn turn_text(user_text: &str, assistant_text: &str) -> String {
    format!("User: {user_text}\nAssistant: {assistant_text}")
}

/// A record returned by search, with its score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,

    /// Cosine similarity mapped to [0, 1]
    pub semantic: f32,

    /// Fraction of query keywords found in the record text
    pub keyword: f32,

    /// Weighted combination used for ranking
    pub score: f32,
}

/// Embedding capability consumed by the memory store.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one piece of text.
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, MemoryError>;
}

/// The core MemoryBackend trait.
///
/// Implementations: hybrid (in-memory or JSONL-backed), none (no-op).
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// The backend name (e.g., "hybrid", "none").
    fn name(&self) -> &str;

    /// Embed and persist a new turn, returning its id.
    async fn store(
        &self,
        user_text: &str,
        assistant_text: &str,
    ) -> std::result::Result<String, MemoryError>;

    /// [`store`](Self::store), tagging the record with the session it came
    /// from. Backends that do not keep the tag fall back to `store`.
    async fn store_in_session(
        &self,
        _session_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> std::result::Result<String, MemoryError> {
        self.store(user_text, assistant_text).await
    }

    /// Rank records against `query`, best first. `limit == 0` yields nothing.
    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<ScoredRecord>, MemoryError>;

    /// Most recent records first, unscored. `limit == 0` yields nothing.
    async fn list(&self, limit: usize) -> std::result::Result<Vec<MemoryRecord>, MemoryError>;

    /// Get a record by ID.
    async fn get(&self, id: &str) -> std::result::Result<Option<MemoryRecord>, MemoryError>;

    /// Delete a record by ID. Deleting an unknown id succeeds with `false`.
    async fn delete(&self, id: &str) -> std::result::Result<bool, MemoryError>;

    /// Get total record count.
    async fn count(&self) -> std::result::Result<usize, MemoryError>;

    /// Remove all records.
    async fn clear(&self) -> std::result::Result<(), MemoryError>;
}
