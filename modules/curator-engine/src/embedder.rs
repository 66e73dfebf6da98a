use anyhow::Result;
use async_trait::async_trait;

use ai_client::{EmbedAgent, RerankAgent, Voyage};
use curator_common::IndexConfig;

use crate::traits::{Reranker, TextEmbedder};

/// Voyage embeddings and rerank behind the engine's provider traits.
pub struct VoyageEmbedder {
    client: Voyage,
}

impl VoyageEmbedder {
    pub fn new(api_key: &str, config: &IndexConfig) -> Result<Self> {
        let client = Voyage::new(api_key)?
            .with_embedding_model(&config.embedding_model)
            .with_rerank_model(&config.rerank_model);
        Ok(Self { client })
    }
}

#[async_trait]
impl TextEmbedder for VoyageEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(EmbedAgent::embed(&self.client, text).await?)
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(EmbedAgent::embed_batch(&self.client, texts).await?)
    }
}

#[async_trait]
impl Reranker for VoyageEmbedder {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f64>> {
        let scores = RerankAgent::rerank(&self.client, query, documents).await?;
        let mut aligned = vec![0.0; documents.len()];
        for score in scores {
            if let Some(slot) = aligned.get_mut(score.index) {
                *slot = score.relevance_score;
            }
        }
        Ok(aligned)
    }
}
