use async_trait::async_trait;

use crate::error::AiError;
use crate::voyage::RerankScore;

#[async_trait]
pub trait EmbedAgent: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError>;
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AiError>;
}

#[async_trait]
pub trait RerankAgent: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<RerankScore>, AiError>;
}
