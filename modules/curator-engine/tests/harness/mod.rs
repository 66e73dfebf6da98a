//! Shared fixtures for end-to-end curation runs: an in-memory store, an
//! index over scripted vectors, and a config tuned for fast retries.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use curator_common::{FileConfig, Record, RecordStatus};
use curator_engine::index::MemoryIndex;
use curator_engine::store::MemoryStore;
use curator_engine::testing::{record_at, similar_pair, FixedEmbedder, TEST_EMBEDDING_DIM};
use curator_engine::traits::{DecisionOracle, RecordStore, SimilarityIndex};
use curator_engine::Curator;

pub const MERGE_AB: &str =
    r#"{"decision":"merge_all","merges":[["a","b"]],"notes":"same fix","confidence":0.9}"#;
pub const MERGE_CD: &str =
    r#"{"decision":"merge_all","merges":[["c","d"]],"notes":"same fix","confidence":0.9}"#;
pub const MERGE_EF: &str =
    r#"{"decision":"merge_all","merges":[["e","f"]],"notes":"same fix","confidence":0.9}"#;

/// Default config with the atomicity pass off and millisecond backoff.
pub fn test_config() -> FileConfig {
    let mut config = FileConfig::default();
    config.oracle.backoff_ms = 1;
    config.oracle.timeout_secs = 5;
    config.run.atomicity_pass = false;
    config
}

/// Records plus the vectors the embedder should return for them.
#[derive(Default)]
pub struct Corpus {
    pub records: Vec<Record>,
    vectors: Vec<(Record, Vec<f32>)>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two records `x` (older) and `y` scoring `score` against each other.
    /// Each pair needs its own `axis` so pairs stay orthogonal.
    pub fn pair(mut self, x: &str, y: &str, axis: usize, score: f64) -> Self {
        let (vx, vy) = similar_pair(axis, score);
        let rx = record_at(x, axis as i64 * 100);
        let ry = record_at(y, axis as i64 * 100 + 10);
        self.vectors.push((rx.clone(), vx));
        self.vectors.push((ry.clone(), vy));
        self.records.push(rx);
        self.records.push(ry);
        self
    }

    /// A record with no close neighbor.
    pub fn lone(mut self, record: Record) -> Self {
        self.records.push(record);
        self
    }

    /// A record with an explicit vector.
    pub fn with_vector(mut self, record: Record, vector: Vec<f32>) -> Self {
        self.vectors.push((record.clone(), vector));
        self.records.push(record);
        self
    }

    /// Register a vector for content the run will create, without adding a
    /// record to the store.
    pub fn expect_content(mut self, record: Record, vector: Vec<f32>) -> Self {
        self.vectors.push((record, vector));
        self
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_records(self.records.clone()))
    }

    pub fn index(&self) -> Arc<MemoryIndex> {
        let embedder = self
            .vectors
            .iter()
            .fold(FixedEmbedder::new(TEST_EMBEDDING_DIM), |e, (r, v)| {
                e.on_record(r, v.clone())
            });
        Arc::new(MemoryIndex::new(Arc::new(embedder)))
    }
}

pub fn curator(
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SimilarityIndex>,
    oracle: Arc<dyn DecisionOracle>,
    config: FileConfig,
    out: &Path,
) -> Curator {
    Curator::new(store, index, oracle, config, out)
}

pub async fn status(store: &MemoryStore, id: &str) -> RecordStatus {
    store
        .status_of(id)
        .await
        .unwrap_or_else(|| panic!("record {id} missing"))
}
