use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use curator_common::RecordId;

use crate::traits::{Reranker, SimilarityIndex, TextEmbedder};

/// Brute-force cosine index over embedder vectors.
///
/// Embeddings are computed before the write lock is taken, so the lock is
/// held only for the map insert and concurrent searches never wait on a
/// provider call.
pub struct MemoryIndex {
    embedder: Arc<dyn TextEmbedder>,
    reranker: Option<Arc<dyn Reranker>>,
    vectors: RwLock<HashMap<RecordId, Vec<f32>>>,
}

impl MemoryIndex {
    pub fn new(embedder: Arc<dyn TextEmbedder>) -> Self {
        Self {
            embedder,
            reranker: None,
            vectors: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vectors.read().await.is_empty()
    }

    /// Embed and insert many records with one provider call.
    pub async fn upsert_batch(&self, items: Vec<(RecordId, String)>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let (ids, texts): (Vec<RecordId>, Vec<String>) = items.into_iter().unzip();
        let vectors = self.embedder.embed_batch(texts).await?;
        if vectors.len() != ids.len() {
            bail!("embedder returned {} vectors for {} texts", vectors.len(), ids.len());
        }
        let mut guard = self.vectors.write().await;
        for (id, vector) in ids.into_iter().zip(vectors) {
            guard.insert(id, vector);
        }
        Ok(())
    }
}

#[async_trait]
impl SimilarityIndex for MemoryIndex {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder.embed(text).await
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<(RecordId, f64)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let guard = self.vectors.read().await;
        let mut scored: Vec<(RecordId, f64)> = guard
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(vector, v)))
            .collect();
        drop(guard);

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f64>> {
        let Some(reranker) = &self.reranker else {
            bail!("rerank requested but no reranker is configured");
        };
        let scores = reranker.rerank(query, candidates).await?;
        if scores.len() != candidates.len() {
            bail!(
                "reranker returned {} scores for {} candidates",
                scores.len(),
                candidates.len()
            );
        }
        Ok(scores)
    }

    async fn upsert(&self, id: &str, text: &str) -> Result<()> {
        let vector = self.embedder.embed(text).await?;
        self.vectors.write().await.insert(id.to_string(), vector);
        debug!(id, "Indexed record");
        Ok(())
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.vectors.read().await.contains_key(id))
    }
}

/// Dry-run wrapper. Upserts land in a local map and never reach `inner`;
/// searches see both, with local vectors shadowing inner ones.
pub struct OverlayIndex {
    inner: Arc<dyn SimilarityIndex>,
    local: RwLock<HashMap<RecordId, Vec<f32>>>,
}

impl OverlayIndex {
    pub fn new(inner: Arc<dyn SimilarityIndex>) -> Self {
        Self {
            inner,
            local: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SimilarityIndex for OverlayIndex {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed(text).await
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<(RecordId, f64)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let local = self.local.read().await;
        let mut scored: Vec<(RecordId, f64)> = self
            .inner
            .search(vector, k + local.len())
            .await?
            .into_iter()
            .filter(|(id, _)| !local.contains_key(id))
            .collect();
        scored.extend(
            local
                .iter()
                .map(|(id, v)| (id.clone(), cosine_similarity(vector, v))),
        );
        drop(local);

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f64>> {
        self.inner.rerank(query, candidates).await
    }

    async fn upsert(&self, id: &str, text: &str) -> Result<()> {
        let vector = self.inner.embed(text).await?;
        self.local.write().await.insert(id.to_string(), vector);
        debug!(id, "Indexed record in dry-run overlay");
        Ok(())
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        if self.local.read().await.contains_key(id) {
            return Ok(true);
        }
        self.inner.contains(id).await
    }
}

/// Cosine similarity; 0 for mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
