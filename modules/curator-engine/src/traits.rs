// Trait abstractions for the curation engine's external collaborators.
//
// RecordStore: durable records plus append-only provenance and decision logs.
// SimilarityIndex: embed/search/rerank over record outlines; owned elsewhere.
// DecisionOracle: merge/atomicity/synthesis verdicts, returned as raw JSON text
//   so the engine validates every response once, at its own boundary.
//
// These let the whole engine run against MemoryStore, MemoryIndex and
// MockOracle without network or disk access.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use curator_common::{DecisionLogEntry, ProvenanceRecord, Record, RecordId, RecordStatus};

use crate::oracle::{AtomicityRequest, DecisionRequest, MergeRequest};

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every record, in id order.
    async fn all(&self) -> Result<Vec<Record>>;

    async fn get(&self, id: &str) -> Result<Option<Record>>;

    /// Insert a new record. Fails if the id is taken.
    async fn create(&self, record: Record) -> Result<()>;

    /// Move a record to `status`. Returns `false` when it already had that
    /// status; fails on a transition out of a terminal state.
    async fn update_status(&self, id: &str, status: RecordStatus) -> Result<bool>;

    /// Shallow-merge `patch` into the record's metadata.
    async fn patch_metadata(&self, id: &str, patch: Map<String, Value>) -> Result<()>;

    async fn append_provenance(&self, entry: ProvenanceRecord) -> Result<()>;

    async fn provenance_for(&self, decision_id: &str) -> Result<Vec<ProvenanceRecord>>;

    async fn append_decision(&self, entry: DecisionLogEntry) -> Result<()>;

    /// Whether a decision-log entry with this id has been written.
    async fn decision_applied(&self, decision_id: &str) -> Result<bool>;

    /// Apply many metadata patches. Stores with costly writes override this
    /// to persist once for the whole batch.
    async fn patch_metadata_batch(&self, patches: Vec<(RecordId, Map<String, Value>)>) -> Result<()> {
        for (id, patch) in patches {
            self.patch_metadata(&id, patch).await?;
        }
        Ok(())
    }

    async fn list(&self, status: RecordStatus) -> Result<Vec<Record>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    async fn count(&self, status: RecordStatus) -> Result<usize> {
        Ok(self.list(status).await?.len())
    }
}

// ---------------------------------------------------------------------------
// SimilarityIndex
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Nearest neighbors of `vector`, best first.
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<(RecordId, f64)>>;

    /// Relevance of each candidate to `query`, aligned with `candidates`.
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f64>>;

    /// Insert or replace the vector for `id`. Requires exclusive access for
    /// the duration of the write only.
    async fn upsert(&self, id: &str, text: &str) -> Result<()>;

    async fn contains(&self, id: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Embedding / rerank providers behind MemoryIndex
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Scores aligned with `documents`.
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f64>>;
}

// ---------------------------------------------------------------------------
// DecisionOracle
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// Identifier recorded on every decision this oracle produces.
    fn name(&self) -> &str;

    async fn decide(&self, request: &DecisionRequest) -> Result<String>;

    async fn check_atomicity(&self, request: &AtomicityRequest) -> Result<String>;

    async fn synthesize(&self, request: &MergeRequest) -> Result<String>;
}
