//! Memory embeddings served by a provider's `/embeddings` endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tanren_core::error::MemoryError;
use tanren_core::memory::Embedder;
use tanren_core::provider::{EmbeddingRequest, Provider};

/// Adapts a [`Provider`] to the memory store's [`Embedder`] seam.
pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let response = self
            .provider
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                inputs: vec![text.to_string()],
            })
            .await
            .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;

        match response.embeddings.into_iter().next() {
            Some(vector) if !vector.is_empty() => Ok(vector),
            _ => Err(MemoryError::EmbeddingFailed(format!(
                "{} returned no embedding",
                self.provider.name()
            ))),
        }
    }
}
