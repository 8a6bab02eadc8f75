//! No-op memory backend: disables long-term memory entirely.

use async_trait::async_trait;
use tanren_core::error::MemoryError;
use tanren_core::memory::{MemoryBackend, MemoryRecord, ScoredRecord};

/// A memory backend that stores nothing and recalls nothing.
pub struct NoopMemory;

#[async_trait]
impl MemoryBackend for NoopMemory {
    fn name(&self) -> &str {
        "none"
    }

    async fn store(&self, _user_text: &str, _assistant_text: &str) -> Result<String, MemoryError> {
        Ok(String::new())
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<ScoredRecord>, MemoryError> {
        Ok(Vec::new())
    }

    async fn list(&self, _limit: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(Vec::new())
    }

    async fn get(&self, _id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        Ok(None)
    }

    async fn delete(&self, _id: &str) -> Result<bool, MemoryError> {
        Ok(false)
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(0)
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remembers_nothing() {
        let mem = NoopMemory;
        mem.store("q", "a").await.unwrap();
        assert_eq!(mem.count().await.unwrap(), 0);
        assert!(mem.search("q", 5).await.unwrap().is_empty());
    }
}
