//! SELECT and DECIDE for one round: pick the communities to review, then ask
//! the oracle about each of them and turn its answers into decisions.

use std::collections::{BTreeSet, HashMap};

use tracing::{info, warn};

use curator_common::{
    content_hash, Community, Decision, MergeGroup, MergedContent, Record, RecordId, RecordStatus,
    RoundsConfig, ValidationStatus, Verdict, WeightedEdge,
};

use crate::applier::merge_groups;
use crate::oracle::contract::{validate_decision, validate_synthesis};
use crate::oracle::prompts::decision_prompt;
use crate::oracle::{DecisionRequest, MemberSummary, MergeRequest, MergeSource, RetryOutcome, RetryPolicy};
use crate::traits::DecisionOracle;

fn is_live(status: RecordStatus) -> bool {
    matches!(status, RecordStatus::Pending | RecordStatus::Synced)
}

/// A community that can still change the record set: at least one pending
/// member and at least two live members.
pub fn is_open(community: &Community, statuses: &HashMap<RecordId, RecordStatus>) -> bool {
    let live: Vec<RecordStatus> = community
        .members
        .iter()
        .filter_map(|id| statuses.get(id).copied())
        .filter(|s| is_live(*s))
        .collect();
    live.len() >= 2 && live.contains(&RecordStatus::Pending)
}

/// An open community not yet decided this run.
pub fn is_reviewable(
    community: &Community,
    reviewed: &BTreeSet<String>,
    statuses: &HashMap<RecordId, RecordStatus>,
) -> bool {
    !reviewed.contains(&community.id) && is_open(community, statuses)
}

/// Community count used for convergence. Merges and splits close
/// communities; keep-separate and manual-review verdicts leave it unchanged.
pub fn open_community_count(
    communities: &[Community],
    statuses: &HashMap<RecordId, RecordStatus>,
) -> usize {
    communities.iter().filter(|c| is_open(c, statuses)).count()
}

/// Open communities still waiting for a decision this run.
pub fn unreviewed_count(
    communities: &[Community],
    reviewed: &BTreeSet<String>,
    statuses: &HashMap<RecordId, RecordStatus>,
) -> usize {
    communities
        .iter()
        .filter(|c| is_reviewable(c, reviewed, statuses))
        .count()
}

#[derive(Debug, Default)]
pub struct Selection {
    pub selected: Vec<Community>,
    pub skipped_oversized: usize,
    pub skipped_settled: usize,
}

/// SELECT: reviewable communities, oversized ones only when asked for,
/// highest priority first, at most `batch_size`.
pub fn select(
    communities: &[Community],
    reviewed: &BTreeSet<String>,
    statuses: &HashMap<RecordId, RecordStatus>,
    config: &RoundsConfig,
) -> Selection {
    let mut selection = Selection::default();
    let mut eligible: Vec<&Community> = Vec::new();
    for community in communities {
        if !is_reviewable(community, reviewed, statuses) {
            selection.skipped_settled += 1;
        } else if community.oversized && !config.include_oversized {
            selection.skipped_oversized += 1;
        } else {
            eligible.push(community);
        }
    }
    eligible.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    selection.selected = eligible
        .into_iter()
        .take(config.batch_size)
        .cloned()
        .collect();
    selection
}

/// Decision id for a community in a round. Independent of the run, so a dry
/// run and a live run over the same input agree.
pub fn decision_id(community_id: &str, round: u32) -> String {
    content_hash(&format!("{community_id}:{round}"))
}

/// What DECIDE produced for one community.
#[derive(Debug, Clone)]
pub enum Decided {
    Decision {
        decision: Decision,
        warnings: Vec<String>,
    },
    /// Not enough live members left to decide anything.
    Skipped { community_id: String, reason: String },
}

impl Decided {
    pub fn community_id(&self) -> &str {
        match self {
            Self::Decision { decision, .. } => &decision.community_id,
            Self::Skipped { community_id, .. } => community_id,
        }
    }
}

/// DECIDE for a single community against a snapshot of the records.
pub struct Decider<'a> {
    pub oracle: &'a dyn DecisionOracle,
    pub policy: RetryPolicy,
    pub records: &'a HashMap<RecordId, Record>,
}

impl Decider<'_> {
    pub async fn decide(&self, community: &Community, round: u32) -> Decided {
        let live: Vec<&Record> = community
            .members
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| is_live(r.status))
            .collect();
        if live.len() < 2 || !live.iter().any(|r| r.is_pending()) {
            return Decided::Skipped {
                community_id: community.id.clone(),
                reason: format!("{} live members left", live.len()),
            };
        }

        let live_ids: BTreeSet<&str> = live.iter().map(|r| r.id.as_str()).collect();
        let request = DecisionRequest {
            community_id: community.id.clone(),
            round_index: round,
            category: community.category.clone(),
            members: live
                .iter()
                .map(|r| MemberSummary {
                    id: r.id.clone(),
                    summary: r.comparison_text(),
                })
                .collect(),
            edges: community
                .edges
                .iter()
                .filter(|e| live_ids.contains(e.a.as_str()) && live_ids.contains(e.b.as_str()))
                .cloned()
                .collect::<Vec<WeightedEdge>>(),
        };
        let member_ids = request.member_ids();
        let label = format!("decide:{}", community.id);

        let outcome = self
            .policy
            .run(&label, || self.oracle.decide(&request), |raw| {
                validate_decision(raw, &member_ids)
            })
            .await;

        let mut decision = Decision {
            id: decision_id(&community.id, round),
            community_id: community.id.clone(),
            round,
            category: community.category.clone(),
            verdict: Verdict::ManualReview,
            notes: String::new(),
            confidence: None,
            oracle: self.oracle.name().to_string(),
            prompt_ref: format!("decision:{}", content_hash(&decision_prompt(&request))),
            raw_response: None,
            retry_count: outcome.retries(),
            validation: ValidationStatus::Exhausted,
            groups: Vec::new(),
        };
        let mut warnings = Vec::new();

        match outcome {
            RetryOutcome::Accepted { value, raw, .. } => {
                for w in &value.warnings {
                    warnings.push(format!("community {}: {w}", community.id));
                }
                decision.verdict = value.verdict;
                decision.notes = value.notes;
                decision.confidence = value.confidence;
                decision.validation = value.validation;
                decision.raw_response = Some(raw);
            }
            RetryOutcome::Exhausted {
                retries,
                last_error,
                last_raw,
            } => {
                let msg = format!(
                    "community {}: oracle gave no valid decision after {} attempts ({last_error}); sent to manual review",
                    community.id,
                    retries + 1
                );
                warn!("{msg}");
                warnings.push(msg);
                decision.notes = format!("oracle retries exhausted: {last_error}");
                decision.raw_response = last_raw;
            }
        }

        if decision.kind().is_merge() {
            for members in merge_groups(decision.verdict.merges()) {
                let content = self
                    .synthesize(&decision, &members, &mut warnings)
                    .await;
                decision.groups.push(MergeGroup { members, content });
            }
        } else {
            decision.groups.push(MergeGroup {
                members: member_ids,
                content: None,
            });
        }

        info!(
            community_id = community.id.as_str(),
            round,
            decision = %decision.kind(),
            retries = decision.retry_count,
            "Community decided"
        );
        Decided::Decision { decision, warnings }
    }

    /// Merged content for a group whose members are all pending. Groups with
    /// an approved member, or whose synthesis fails, fall back to
    /// survivor-pick (`None`).
    async fn synthesize(
        &self,
        decision: &Decision,
        members: &[RecordId],
        warnings: &mut Vec<String>,
    ) -> Option<MergedContent> {
        let sources: Vec<&Record> = members.iter().filter_map(|id| self.records.get(id)).collect();
        if sources.len() != members.len() || !sources.iter().all(|r| r.is_pending()) {
            return None;
        }
        let request = MergeRequest {
            category: decision.category.clone(),
            sources: sources
                .iter()
                .map(|r| MergeSource {
                    id: r.id.clone(),
                    title: r.title.clone(),
                    body: r.body.clone(),
                })
                .collect(),
            notes: decision.notes.clone(),
        };
        let label = format!("synthesize:{}", decision.community_id);
        match self
            .policy
            .run(&label, || self.oracle.synthesize(&request), validate_synthesis)
            .await
        {
            RetryOutcome::Accepted { value, .. } => Some(value),
            RetryOutcome::Exhausted { last_error, .. } => {
                let msg = format!(
                    "community {}: synthesis of {} failed ({last_error}); keeping a survivor instead",
                    decision.community_id,
                    members.join("+")
                );
                warn!("{msg}");
                warnings.push(msg);
                None
            }
        }
    }
}
