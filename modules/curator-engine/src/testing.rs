// Test mocks for the curation engine.
//
// Matching the trait boundaries:
// - FixedEmbedder (TextEmbedder): registered text→vector, hash vectors otherwise
// - MockOracle (DecisionOracle): scripted responses per member set / record
// - MemoryStore (RecordStore) lives in `store::memory`
//
// Plus record and decision fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use curator_common::{
    content_hash, structural_outline, Decision, MergeGroup, Record, RecordId, ValidationStatus,
    Verdict,
};

use crate::applier::merge_groups;
use crate::oracle::{AtomicityRequest, DecisionRequest, MergeRequest};
use crate::traits::{DecisionOracle, TextEmbedder};

// ---------------------------------------------------------------------------
// Test constants
// ---------------------------------------------------------------------------

/// Standard embedding dimension for test vectors.
pub const TEST_EMBEDDING_DIM: usize = 64;

/// Author on fixture records.
pub const TEST_AUTHOR: &str = "tester";

fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A pending record created at a fixed instant.
pub fn record(id: &str, category: &str, title: &str, body: &str) -> Record {
    Record::new(id, category, title, body, TEST_AUTHOR, base_time())
}

/// A pending `infra` record created `secs` seconds after the fixture epoch.
pub fn record_at(id: &str, secs: i64) -> Record {
    let created = base_time() + Duration::seconds(secs);
    Record::new(
        id,
        "infra",
        format!("Title {id}"),
        format!("Body of {id}."),
        TEST_AUTHOR,
        created,
    )
}

/// A validated decision over `members`, grouped the way DECIDE groups it.
pub fn decision_for(members: &[&str], verdict: Verdict) -> Decision {
    let ids: Vec<RecordId> = members.iter().map(|m| m.to_string()).collect();
    let groups = if verdict.kind().is_merge() {
        merge_groups(verdict.merges())
            .into_iter()
            .map(|members| MergeGroup {
                members,
                content: None,
            })
            .collect()
    } else {
        vec![MergeGroup {
            members: ids.clone(),
            content: None,
        }]
    };
    Decision {
        id: content_hash(&format!("{}:{}", ids.join("+"), verdict.kind())),
        community_id: format!("c-{}", ids.join("-")),
        round: 1,
        category: "infra".into(),
        verdict,
        notes: String::new(),
        confidence: None,
        oracle: "mock".into(),
        prompt_ref: String::new(),
        raw_response: None,
        retry_count: 0,
        validation: ValidationStatus::Valid,
        groups,
    }
}

/// Two unit vectors with cosine similarity `score`, built on axes `axis`
/// and `axis + 1`. Pairs on disjoint axes are orthogonal to each other.
pub fn similar_pair(axis: usize, score: f64) -> (Vec<f32>, Vec<f32>) {
    let mut a = vec![0.0f32; TEST_EMBEDDING_DIM];
    let mut b = vec![0.0f32; TEST_EMBEDDING_DIM];
    a[axis] = 1.0;
    b[axis] = score as f32;
    b[axis + 1] = (1.0 - score * score).max(0.0).sqrt() as f32;
    (a, b)
}

// ---------------------------------------------------------------------------
// FixedEmbedder
// ---------------------------------------------------------------------------

/// Deterministic embedder for testing. Registered texts get exact vectors;
/// unmatched texts get a unique hash-based vector (low similarity to everything).
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    dimension: usize,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: HashMap::new(),
            dimension,
        }
    }

    /// Register a text→vector mapping for controlled similarity.
    pub fn on_text(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    /// Register `vector` for every text the engine may embed for `record`:
    /// its title and body, and its structural outline.
    pub fn on_record(self, record: &Record, vector: Vec<f32>) -> Self {
        let outline = structural_outline(record);
        self.on_text(&record.comparison_text(), vector.clone())
            .on_text(&outline, vector)
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let mut state = hasher.finish();

        let mut vec = vec![0.0f32; self.dimension];
        for v in vec.iter_mut() {
            // Simple LCG PRNG
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            *v = ((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0;
        }
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vec.iter_mut() {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.hash_vector(text)))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in &texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// MockOracle
// ---------------------------------------------------------------------------

const KEEP_SEPARATE: &str = r#"{"decision": "keep_separate", "notes": "mock default"}"#;
const ATOMIC: &str = r#"{"atomic": true, "parts": []}"#;

/// Scripted oracle. Decision responses are keyed by the sorted member ids of
/// the community; atomicity responses by record id. Each script is a queue:
/// responses are served in order and the last one repeats. Unscripted
/// communities get `keep_separate`, unscripted records are atomic, and
/// synthesis concatenates the sources.
#[derive(Default)]
pub struct MockOracle {
    decisions: Mutex<HashMap<Vec<RecordId>, VecDeque<String>>>,
    atomicity: Mutex<HashMap<RecordId, VecDeque<String>>>,
    synthesis: Mutex<VecDeque<String>>,
    decided: Mutex<Vec<Vec<RecordId>>>,
    decide_calls: AtomicUsize,
    atomicity_calls: AtomicUsize,
    synthesis_calls: AtomicUsize,
}

fn member_key(ids: &[&str]) -> Vec<RecordId> {
    let mut key: Vec<RecordId> = ids.iter().map(|s| s.to_string()).collect();
    key.sort();
    key
}

fn next_response(queue: &mut VecDeque<String>) -> Option<String> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_decide<S: Into<String>>(
        self,
        members: &[&str],
        responses: impl IntoIterator<Item = S>,
    ) -> Self {
        if let Ok(mut map) = self.decisions.lock() {
            map.insert(
                member_key(members),
                responses.into_iter().map(Into::into).collect(),
            );
        }
        self
    }

    pub fn on_atomicity<S: Into<String>>(
        self,
        record_id: &str,
        responses: impl IntoIterator<Item = S>,
    ) -> Self {
        if let Ok(mut map) = self.atomicity.lock() {
            map.insert(
                record_id.to_string(),
                responses.into_iter().map(Into::into).collect(),
            );
        }
        self
    }

    pub fn on_synthesize<S: Into<String>>(self, responses: impl IntoIterator<Item = S>) -> Self {
        if let Ok(mut queue) = self.synthesis.lock() {
            *queue = responses.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn decide_calls(&self) -> usize {
        self.decide_calls.load(Ordering::SeqCst)
    }

    pub fn atomicity_calls(&self) -> usize {
        self.atomicity_calls.load(Ordering::SeqCst)
    }

    pub fn synthesis_calls(&self) -> usize {
        self.synthesis_calls.load(Ordering::SeqCst)
    }

    /// Member sets of every decide call, in call order.
    pub fn decided(&self) -> Vec<Vec<RecordId>> {
        self.decided.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Whether a community with exactly these members was asked about.
    pub fn was_asked_about(&self, members: &[&str]) -> bool {
        let key = member_key(members);
        self.decided().iter().any(|m| *m == key)
    }
}

#[async_trait]
impl DecisionOracle for MockOracle {
    fn name(&self) -> &str {
        "mock"
    }

    async fn decide(&self, request: &DecisionRequest) -> Result<String> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        let mut key = request.member_ids();
        key.sort();
        if let Ok(mut decided) = self.decided.lock() {
            decided.push(key.clone());
        }
        let scripted = self
            .decisions
            .lock()
            .ok()
            .and_then(|mut map| map.get_mut(&key).and_then(next_response));
        Ok(scripted.unwrap_or_else(|| KEEP_SEPARATE.to_string()))
    }

    async fn check_atomicity(&self, request: &AtomicityRequest) -> Result<String> {
        self.atomicity_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .atomicity
            .lock()
            .ok()
            .and_then(|mut map| map.get_mut(&request.record_id).and_then(next_response));
        Ok(scripted.unwrap_or_else(|| ATOMIC.to_string()))
    }

    async fn synthesize(&self, request: &MergeRequest) -> Result<String> {
        self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.synthesis.lock().ok().and_then(|mut q| next_response(&mut q)) {
            return Ok(scripted);
        }
        let title = request
            .sources
            .iter()
            .map(|s| s.title.as_str())
            .collect::<Vec<_>>()
            .join(" / ");
        let body = request
            .sources
            .iter()
            .map(|s| s.body.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(json!({ "title": title, "body": body }).to_string())
    }
}
