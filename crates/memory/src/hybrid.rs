//! Hybrid-ranked memory store.
//!
//! Records live in a single index behind a `tokio::sync::RwLock`: searches,
//! listings and counts share the read side, store/delete/clear take the
//! write side. Embeddings are computed before any lock is taken. When a
//! path is configured the index is mirrored to a JSONL file on every
//! mutation.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tanren_core::error::MemoryError;
use tanren_core::memory::{Embedder, MemoryBackend, MemoryRecord, ScoredRecord, turn_text};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::jsonl;
use crate::vector::{ScoreWeights, keyword_overlap, query_keywords, semantic_similarity};

#[derive(Default)]
struct Index {
    /// Insertion order, oldest first
    records: Vec<MemoryRecord>,
    /// Fixed by the first vector the store sees
    dimension: Option<usize>,
}

impl Index {
    fn from_records(records: Vec<MemoryRecord>) -> Result<Self, MemoryError> {
        let mut index = Self::default();
        for record in &records {
            index.check_dimension(record.embedding.len())?;
        }
        index.records = records;
        Ok(index)
    }

    fn check_dimension(&mut self, actual: usize) -> Result<(), MemoryError> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(MemoryError::DimensionMismatch { expected, actual })
            }
            Some(_) => Ok(()),
            None => {
                self.dimension = Some(actual);
                Ok(())
            }
        }
    }
}

/// Memory store ranking records by `semantic × w₁ + keyword × w₂`.
pub struct HybridMemory {
    embedder: Arc<dyn Embedder>,
    weights: ScoreWeights,
    path: Option<PathBuf>,
    index: Arc<RwLock<Index>>,
}

impl HybridMemory {
    /// A store that keeps records in process memory only.
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            weights: ScoreWeights::default(),
            path: None,
            index: Arc::new(RwLock::new(Index::default())),
        }
    }

    /// A store backed by a JSONL file. Existing records are loaded; a
    /// missing file starts empty and is created on the first write.
    pub async fn open(
        path: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        let records = jsonl::load_records(&path).await?;
        debug!(path = %path.display(), count = records.len(), "Memory store loaded");
        Ok(Self {
            embedder,
            weights: ScoreWeights::default(),
            path: Some(path),
            index: Arc::new(RwLock::new(Index::from_records(records)?)),
        })
    }

    /// Override the default 0.7 / 0.3 weighting.
    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let vector = self.embedder.embed(text).await.map_err(|e| match e {
            MemoryError::EmbeddingFailed(_) => e,
            other => MemoryError::EmbeddingFailed(other.to_string()),
        })?;
        if vector.is_empty() {
            return Err(MemoryError::EmbeddingFailed(
                "embedder returned an empty vector".into(),
            ));
        }
        Ok(vector)
    }

    async fn insert(
        &self,
        session_id: Option<&str>,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<String, MemoryError> {
        let embedding = self.embed(&turn_text(user_text, assistant_text)).await?;

        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            user_text: user_text.to_string(),
            assistant_text: assistant_text.to_string(),
            embedding,
            created_at: Utc::now(),
            session_id: session_id.map(str::to_string),
        };
        let id = record.id.clone();

        let mut index = self.index.write().await;
        let dimension_was_unset = index.dimension.is_none();
        index.check_dimension(record.embedding.len())?;
        index.records.push(record);

        if let Err(e) = self.persist(&index.records).await {
            index.records.pop();
            if dimension_was_unset {
                index.dimension = None;
            }
            return Err(e);
        }

        debug!(memory_id = %id, total = index.records.len(), "Stored memory");
        Ok(id)
    }

    async fn persist(&self, records: &[MemoryRecord]) -> Result<(), MemoryError> {
        match &self.path {
            Some(path) => jsonl::write_records(path, records).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MemoryBackend for HybridMemory {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn store(&self, user_text: &str, assistant_text: &str) -> Result<String, MemoryError> {
        self.insert(None, user_text, assistant_text).await
    }

    async fn store_in_session(
        &self,
        session_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<String, MemoryError> {
        self.insert(Some(session_id), user_text, assistant_text).await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredRecord>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embed(query).await?;
        let keywords = query_keywords(query);

        let index = self.index.read().await;
        if index.records.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(expected) = index.dimension
            && expected != query_vector.len()
        {
            return Err(MemoryError::DimensionMismatch {
                expected,
                actual: query_vector.len(),
            });
        }

        // Newest first so the stable sort below breaks exact ties by recency.
        let mut scored: Vec<ScoredRecord> = index
            .records
            .iter()
            .rev()
            .map(|record| {
                let semantic = semantic_similarity(&query_vector, &record.embedding);
                let keyword = keyword_overlap(&keywords, &record.content());
                ScoredRecord {
                    record: record.clone(),
                    semantic,
                    keyword,
                    score: self.weights.combine(semantic, keyword),
                }
            })
            .collect();
        drop(index);

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn list(&self, limit: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        let index = self.index.read().await;
        Ok(index.records.iter().rev().take(limit).cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        let index = self.index.read().await;
        Ok(index.records.iter().find(|r| r.id == id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, MemoryError> {
        let mut index = self.index.write().await;
        let Some(pos) = index.records.iter().position(|r| r.id == id) else {
            return Ok(false);
        };
        let removed = index.records.remove(pos);
        if let Err(e) = self.persist(&index.records).await {
            index.records.insert(pos, removed);
            return Err(e);
        }
        Ok(true)
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.index.read().await.records.len())
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        let mut index = self.index.write().await;
        let previous = std::mem::take(&mut index.records);
        if let Err(e) = self.persist(&index.records).await {
            index.records = previous;
            return Err(e);
        }
        Ok(())
    }
}
