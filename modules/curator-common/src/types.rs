use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable identifier assigned by the store.
pub type RecordId = String;

/// Well-known keys inside [`Record::metadata`].
pub mod meta {
    /// Machine-generated structural outline used for comparison and reranking.
    pub const OUTLINE: &str = "outline";
    /// Id of the record that absorbed a superseded record.
    pub const SUPERSEDED_BY: &str = "superseded_by";
    /// Notes attached by keep-separate / manual-review decisions.
    pub const CURATION_NOTES: &str = "curation_notes";
    /// Set once the atomicity pre-pass has looked at a record.
    pub const ATOMICITY_CHECKED: &str = "atomicity_checked";
    /// Set when a record was left pending because it needs a human.
    pub const NEEDS_REVIEW: &str = "needs_review";
    /// Source ids of a record created by a merge or split.
    pub const DERIVED_FROM: &str = "derived_from";
}

// --- Records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    #[default]
    Experience,
    Skill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Synced,
    Superseded,
}

impl RecordStatus {
    /// Only pending records move; setting a record to the status it already
    /// has is accepted as a no-op.
    pub fn can_transition_to(self, next: RecordStatus) -> bool {
        self == next || self == RecordStatus::Pending
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Synced => write!(f, "SYNCED"),
            Self::Superseded => write!(f, "SUPERSEDED"),
        }
    }
}

/// A unit of captured team knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub category: String,
    #[serde(default)]
    pub kind: RecordKind,
    pub title: String,
    pub body: String,
    pub status: RecordStatus,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(
        id: impl Into<RecordId>,
        category: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        author: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            kind: RecordKind::default(),
            title: title.into(),
            body: body.into(),
            status: RecordStatus::Pending,
            author: author.into(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RecordStatus::Pending
    }

    pub fn outline(&self) -> Option<&str> {
        self.metadata
            .get(meta::OUTLINE)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Text used for embedding and reranking: the outline when one exists,
    /// otherwise title and body.
    pub fn comparison_text(&self) -> String {
        match self.outline() {
            Some(outline) => outline.to_string(),
            None => format!("{}\n{}", self.title, self.body),
        }
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

// --- Candidates ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBucket {
    /// Safe for unsupervised merge.
    Auto,
    High,
    Medium,
    Ignored,
}

/// Unordered, scored similarity relation between two distinct records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEdge {
    pub a: RecordId,
    pub b: RecordId,
    pub score: f64,
    /// Shared category, `None` when the endpoints differ.
    pub category: Option<String>,
    pub bucket: ScoreBucket,
}

impl CandidateEdge {
    /// Returns `None` for self-pairs. Endpoints are stored in sorted order so
    /// `(x, y)` and `(y, x)` produce the same edge.
    pub fn new(
        x: &str,
        y: &str,
        score: f64,
        category: Option<String>,
        bucket: ScoreBucket,
    ) -> Option<Self> {
        if x == y {
            return None;
        }
        let (a, b) = if x < y { (x, y) } else { (y, x) };
        Some(Self {
            a: a.to_string(),
            b: b.to_string(),
            score,
            category,
            bucket,
        })
    }

    pub fn key(&self) -> (RecordId, RecordId) {
        (self.a.clone(), self.b.clone())
    }

    pub fn touches(&self, id: &str) -> bool {
        self.a == id || self.b == id
    }
}

// --- Communities ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedEdge {
    pub a: RecordId,
    pub b: RecordId,
    pub weight: f64,
}

/// A group of related records reviewed together in one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    /// Fingerprint of the sorted member ids; identical member sets share an id.
    pub id: String,
    pub category: String,
    pub members: Vec<RecordId>,
    pub edges: Vec<WeightedEdge>,
    pub avg_weight: f64,
    pub priority: f64,
    pub oversized: bool,
}

impl Community {
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m == id)
    }
}

// --- Decisions ---

/// Two records the oracle wants merged. Serialized as `[a, b]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergePair(pub RecordId, pub RecordId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    MergeAll,
    MergeSubset,
    KeepSeparate,
    ManualReview,
}

impl DecisionKind {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge_all" => Some(Self::MergeAll),
            "merge_subset" => Some(Self::MergeSubset),
            "keep_separate" => Some(Self::KeepSeparate),
            "manual_review" => Some(Self::ManualReview),
            _ => None,
        }
    }

    pub fn is_merge(self) -> bool {
        matches!(self, Self::MergeAll | Self::MergeSubset)
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MergeAll => write!(f, "merge_all"),
            Self::MergeSubset => write!(f, "merge_subset"),
            Self::KeepSeparate => write!(f, "keep_separate"),
            Self::ManualReview => write!(f, "manual_review"),
        }
    }
}

/// A validated verdict. Merge variants always carry at least one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Verdict {
    MergeAll { merges: Vec<MergePair> },
    MergeSubset { merges: Vec<MergePair> },
    KeepSeparate,
    ManualReview,
}

impl Verdict {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::MergeAll { .. } => DecisionKind::MergeAll,
            Self::MergeSubset { .. } => DecisionKind::MergeSubset,
            Self::KeepSeparate => DecisionKind::KeepSeparate,
            Self::ManualReview => DecisionKind::ManualReview,
        }
    }

    pub fn merges(&self) -> &[MergePair] {
        match self {
            Self::MergeAll { merges } | Self::MergeSubset { merges } => merges,
            Self::KeepSeparate | Self::ManualReview => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Accepted as returned.
    Valid,
    /// Accepted after dropping invalid pairs or downgrading the kind.
    Downgraded,
    /// Retry budget spent; recorded as manual review.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedContent {
    pub title: String,
    pub body: String,
}

/// Records that collapse into one result, plus oracle-written content for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeGroup {
    pub members: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MergedContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub community_id: String,
    pub round: u32,
    pub category: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Which oracle (or `auto-dedup`) produced the verdict.
    pub oracle: String,
    /// Hash of the request payload sent to the oracle.
    pub prompt_ref: String,
    #[serde(default)]
    pub raw_response: Option<String>,
    pub retry_count: u32,
    pub validation: ValidationStatus,
    #[serde(default)]
    pub groups: Vec<MergeGroup>,
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        self.verdict.kind()
    }
}

// --- Provenance ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceKind {
    Merge,
    Split,
}

/// Append-only audit entry linking sources to what replaced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub decision_id: String,
    pub kind: ProvenanceKind,
    pub sources: Vec<RecordId>,
    pub results: Vec<RecordId>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl ProvenanceRecord {
    /// Identity ignoring the timestamp, for duplicate detection.
    pub fn same_effect(&self, other: &ProvenanceRecord) -> bool {
        self.decision_id == other.decision_id
            && self.kind == other.kind
            && self.sources == other.sources
            && self.results == other.results
    }
}

// --- Decision log ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedEffects {
    pub superseded: Vec<RecordId>,
    pub created: Vec<RecordId>,
    pub noted: Vec<RecordId>,
    pub review_queued: bool,
}

impl AppliedEffects {
    pub fn is_empty(&self) -> bool {
        self.superseded.is_empty() && self.created.is_empty() && self.noted.is_empty() && !self.review_queued
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub decision: Decision,
    pub effects: AppliedEffects,
    pub dry_run: bool,
    pub applied_at: DateTime<Utc>,
}
