//! Decision oracle: request payloads, response contract, retry loop, and the
//! Claude-backed and offline implementations.

pub mod claude;
pub mod contract;
pub mod prompts;
pub mod retry;
pub mod stub;

use serde::{Deserialize, Serialize};

use curator_common::{RecordId, WeightedEdge};

pub use claude::ClaudeOracle;
pub use contract::{AtomicityVerdict, ContractViolation, ValidatedDecision};
pub use retry::{RetryOutcome, RetryPolicy};
pub use stub::StubOracle;

/// One member of a community as the oracle sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub id: RecordId,
    pub summary: String,
}

/// Payload for a community merge decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub community_id: String,
    pub round_index: u32,
    pub category: String,
    pub members: Vec<MemberSummary>,
    pub edges: Vec<WeightedEdge>,
}

impl DecisionRequest {
    pub fn member_ids(&self) -> Vec<RecordId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicityRequest {
    pub record_id: RecordId,
    pub category: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSource {
    pub id: RecordId,
    pub title: String,
    pub body: String,
}

/// Payload asking the oracle to write one record replacing `sources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub category: String,
    pub sources: Vec<MergeSource>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}
