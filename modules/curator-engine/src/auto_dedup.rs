use std::collections::HashMap;

use curator_common::{
    community_fingerprint, content_hash, CandidateEdge, Decision, MergeGroup, MergePair, Record,
    RecordId, RecordStatus, ScoreBucket, ValidationStatus, Verdict,
};

use crate::applier::merge_groups;

/// Oracle name recorded on decisions made without an oracle.
pub const AUTO_DEDUP_ORACLE: &str = "auto-dedup";

/// Turn auto-bucket edges into merge decisions, one per group of records
/// linked by auto edges. The applier resolves each group by survivor-pick.
///
/// Pairs whose records are gone, or that contain no pending record, are
/// skipped, and so are cross-category pairs unless `allow_cross_category`.
/// Decision ids depend only on the group's members.
pub fn plan(
    edges: &[CandidateEdge],
    records: &HashMap<RecordId, Record>,
    allow_cross_category: bool,
) -> Vec<Decision> {
    let live = |id: &str| {
        records
            .get(id)
            .filter(|r| r.status != RecordStatus::Superseded)
    };
    let eligible: Vec<&CandidateEdge> = edges
        .iter()
        .filter(|e| e.bucket == ScoreBucket::Auto)
        .filter(|e| {
            let (Some(a), Some(b)) = (live(&e.a), live(&e.b)) else {
                return false;
            };
            let same_category = a.category == b.category;
            (a.is_pending() || b.is_pending()) && (same_category || allow_cross_category)
        })
        .collect();
    let pairs: Vec<MergePair> = eligible
        .iter()
        .map(|e| MergePair(e.a.clone(), e.b.clone()))
        .collect();

    merge_groups(&pairs)
        .into_iter()
        .map(|members| {
            let fingerprint = community_fingerprint(&members);
            let group_pairs: Vec<MergePair> = pairs
                .iter()
                .filter(|p| members.contains(&p.0))
                .cloned()
                .collect();
            let score = eligible
                .iter()
                .filter(|e| members.contains(&e.a))
                .map(|e| e.score)
                .fold(0.0_f64, f64::max);
            let category = members
                .first()
                .and_then(|id| records.get(id))
                .map(|r| r.category.clone())
                .unwrap_or_default();
            Decision {
                id: content_hash(&format!("auto:{fingerprint}")),
                community_id: fingerprint,
                round: 0,
                category,
                verdict: Verdict::MergeAll {
                    merges: group_pairs,
                },
                notes: format!("similarity {score:.3} at or above the auto-merge threshold"),
                confidence: Some(score),
                oracle: AUTO_DEDUP_ORACLE.to_string(),
                prompt_ref: String::new(),
                raw_response: None,
                retry_count: 0,
                validation: ValidationStatus::Valid,
                groups: vec![MergeGroup {
                    members,
                    content: None,
                }],
            }
        })
        .collect()
}

/// Auto edges counted toward the report.
pub fn auto_pairs(edges: &[CandidateEdge]) -> usize {
    edges.iter().filter(|e| e.bucket == ScoreBucket::Auto).count()
}
