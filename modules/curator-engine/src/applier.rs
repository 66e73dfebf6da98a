use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use curator_common::{
    derived_record_id, meta, structural_outline, AppliedEffects, Decision, DecisionKind,
    DecisionLogEntry, MergeGroup, MergePair, ProvenanceKind, ProvenanceRecord, Record, RecordId,
    RecordStatus, SurvivorPolicy,
};

use crate::traits::{RecordStore, SimilarityIndex};

/// Author recorded on records the engine writes.
pub const CURATOR_AUTHOR: &str = "curator";

/// Collapse merge pairs into disjoint groups (pairs sharing a record chain
/// end up together). Groups and their members are sorted.
pub fn merge_groups(pairs: &[MergePair]) -> Vec<Vec<RecordId>> {
    let mut parent: BTreeMap<RecordId, RecordId> = BTreeMap::new();

    fn root(parent: &mut BTreeMap<RecordId, RecordId>, id: &str) -> RecordId {
        let mut current = id.to_string();
        loop {
            let next = parent
                .entry(current.clone())
                .or_insert_with(|| current.clone())
                .clone();
            if next == current {
                return current;
            }
            current = next;
        }
    }

    for MergePair(a, b) in pairs {
        let (ra, rb) = (root(&mut parent, a), root(&mut parent, b));
        if ra != rb {
            let (keep, fold) = if ra < rb { (ra, rb) } else { (rb, ra) };
            parent.insert(fold, keep);
        }
    }

    let ids: Vec<RecordId> = parent.keys().cloned().collect();
    let mut groups: BTreeMap<RecordId, BTreeSet<RecordId>> = BTreeMap::new();
    for id in ids {
        let r = root(&mut parent, &id);
        groups.entry(r).or_default().insert(id);
    }
    groups
        .into_values()
        .filter(|g| g.len() >= 2)
        .map(|g| g.into_iter().collect())
        .collect()
}

/// Pick the record that survives a survivor-pick merge. An approved
/// (`SYNCED`) record always wins; otherwise the policy decides.
pub fn pick_survivor<'r>(records: &[&'r Record], policy: SurvivorPolicy) -> Option<&'r Record> {
    let older = |a: &Record, b: &Record| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    };
    records.iter().copied().min_by(|a, b| {
        let synced = |r: &Record| r.status == RecordStatus::Synced;
        match (synced(a), synced(b)) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        match policy {
            SurvivorPolicy::Older => older(a, b),
            SurvivorPolicy::MoreComplete => b
                .body
                .chars()
                .count()
                .cmp(&a.body.chars().count())
                .then_with(|| older(a, b)),
        }
    })
}

/// What applying one decision did.
#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    pub effects: AppliedEffects,
    /// The decision-log entry written, `None` when already applied.
    pub entry: Option<DecisionLogEntry>,
    pub provenance: Vec<ProvenanceRecord>,
    pub already_applied: bool,
    pub warnings: Vec<String>,
}

/// Turns validated decisions into store mutations, provenance and a
/// decision-log entry.
///
/// Every step is idempotent (create-if-absent, supersede-if-pending,
/// provenance deduplicated by decision id) and the log entry is written
/// last, so re-applying a decision after an interruption completes it
/// without duplicating anything, and re-applying a logged decision is a
/// no-op.
pub struct DecisionApplier<'a> {
    store: &'a dyn RecordStore,
    index: &'a dyn SimilarityIndex,
    survivor: SurvivorPolicy,
    dry_run: bool,
}

impl<'a> DecisionApplier<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        index: &'a dyn SimilarityIndex,
        survivor: SurvivorPolicy,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            index,
            survivor,
            dry_run,
        }
    }

    pub async fn apply(&self, decision: &Decision) -> Result<ApplyResult> {
        if self.store.decision_applied(&decision.id).await? {
            info!(decision_id = decision.id.as_str(), "Decision already applied, skipping");
            return Ok(ApplyResult {
                already_applied: true,
                ..ApplyResult::default()
            });
        }

        let mut result = ApplyResult::default();
        match decision.kind() {
            DecisionKind::MergeAll | DecisionKind::MergeSubset => {
                for (idx, group) in decision.groups.iter().enumerate() {
                    self.apply_group(decision, idx, group, &mut result).await?;
                }
            }
            DecisionKind::KeepSeparate => {
                result.effects.noted = self.annotate(decision, false).await?;
            }
            DecisionKind::ManualReview => {
                result.effects.noted = self.annotate(decision, true).await?;
                result.effects.review_queued = true;
            }
        }

        let entry = DecisionLogEntry {
            decision: decision.clone(),
            effects: result.effects.clone(),
            dry_run: self.dry_run,
            applied_at: Utc::now(),
        };
        self.store.append_decision(entry.clone()).await?;
        result.entry = Some(entry);

        info!(
            decision_id = decision.id.as_str(),
            kind = %decision.kind(),
            superseded = result.effects.superseded.len(),
            created = result.effects.created.len(),
            noted = result.effects.noted.len(),
            "Applied decision"
        );
        Ok(result)
    }

    async fn load(&self, ids: &[RecordId]) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get(id).await? {
                Some(record) => records.push(record),
                None => warn!(id = id.as_str(), "Merge member not found in store"),
            }
        }
        Ok(records)
    }

    async fn apply_group(
        &self,
        decision: &Decision,
        idx: usize,
        group: &MergeGroup,
        result: &mut ApplyResult,
    ) -> Result<()> {
        let members = self.load(&group.members).await?;
        if !members.iter().any(Record::is_pending) {
            let msg = format!(
                "merge group {} of decision {} has no pending member; skipped",
                group.members.join("+"),
                decision.id
            );
            warn!("{msg}");
            result.warnings.push(msg);
            return Ok(());
        }

        let new_id = derived_record_id(&format!("{}:{idx}", decision.id));
        let new_exists = self.store.get(&new_id).await?.is_some();
        let all_pending = members.len() == group.members.len() && members.iter().all(Record::is_pending);

        match &group.content {
            Some(content) if all_pending || new_exists => {
                if !new_exists {
                    let mut record = Record::new(
                        new_id.clone(),
                        members[0].category.clone(),
                        content.title.clone(),
                        content.body.clone(),
                        merged_author(&members),
                        Utc::now(),
                    );
                    record.kind = members[0].kind;
                    record
                        .metadata
                        .insert(meta::OUTLINE.into(), Value::String(structural_outline(&record)));
                    record
                        .metadata
                        .insert(meta::DERIVED_FROM.into(), json!(group.members));
                    record
                        .metadata
                        .insert(meta::ATOMICITY_CHECKED.into(), Value::Bool(true));
                    let outline = record.comparison_text();
                    self.store.create(record).await?;
                    self.index.upsert(&new_id, &outline).await?;
                    result.effects.created.push(new_id.clone());
                }
                let sources: Vec<RecordId> = members.iter().map(|r| r.id.clone()).collect();
                for source in &members {
                    self.supersede(source, &new_id, result).await?;
                }
                self.record_provenance(decision, ProvenanceKind::Merge, sources, vec![new_id], result)
                    .await?;
            }
            _ => {
                let refs: Vec<&Record> = members
                    .iter()
                    .filter(|r| r.status != RecordStatus::Superseded)
                    .collect();
                let Some(survivor) = pick_survivor(&refs, self.survivor) else {
                    return Ok(());
                };
                let losers: Vec<&Record> = members
                    .iter()
                    .filter(|r| r.id != survivor.id)
                    .filter(|r| r.is_pending() || superseded_by(r) == Some(survivor.id.as_str()))
                    .collect();
                if losers.is_empty() {
                    let msg = format!(
                        "merge group {} of decision {} has nothing to supersede",
                        group.members.join("+"),
                        decision.id
                    );
                    warn!("{msg}");
                    result.warnings.push(msg);
                    return Ok(());
                }
                for loser in &losers {
                    self.supersede(loser, &survivor.id, result).await?;
                }
                let sources = losers.iter().map(|r| r.id.clone()).collect();
                self.record_provenance(
                    decision,
                    ProvenanceKind::Merge,
                    sources,
                    vec![survivor.id.clone()],
                    result,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn supersede(&self, record: &Record, by: &str, result: &mut ApplyResult) -> Result<()> {
        let current = match self.store.get(&record.id).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        if !current.is_pending() {
            return Ok(());
        }
        let mut patch = Map::new();
        patch.insert(meta::SUPERSEDED_BY.into(), Value::String(by.to_string()));
        self.store.patch_metadata(&record.id, patch).await?;
        self.store
            .update_status(&record.id, RecordStatus::Superseded)
            .await?;
        result.effects.superseded.push(record.id.clone());
        Ok(())
    }

    async fn record_provenance(
        &self,
        decision: &Decision,
        kind: ProvenanceKind,
        sources: Vec<RecordId>,
        results: Vec<RecordId>,
        result: &mut ApplyResult,
    ) -> Result<()> {
        let entry = ProvenanceRecord {
            decision_id: decision.id.clone(),
            kind,
            sources,
            results,
            reason: provenance_reason(decision),
            recorded_at: Utc::now(),
        };
        let existing = self.store.provenance_for(&decision.id).await?;
        if existing.iter().any(|p| p.same_effect(&entry)) {
            return Ok(());
        }
        self.store.append_provenance(entry.clone()).await?;
        result.provenance.push(entry);
        Ok(())
    }

    /// Attach the decision's note to every pending member; optionally flag
    /// them for human review. Returns the ids that were annotated.
    async fn annotate(&self, decision: &Decision, needs_review: bool) -> Result<Vec<RecordId>> {
        let members = self.community_members(decision).await?;
        let mut noted = Vec::new();
        for record in members.iter().filter(|r| r.is_pending()) {
            let mut notes: Vec<Value> = record
                .metadata
                .get(meta::CURATION_NOTES)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let already = notes
                .iter()
                .any(|n| n.get("decision_id").and_then(Value::as_str) == Some(decision.id.as_str()));
            if !already {
                notes.push(json!({
                    "decision_id": decision.id,
                    "decision": decision.kind(),
                    "round": decision.round,
                    "notes": decision.notes,
                }));
            }
            let mut patch = Map::new();
            patch.insert(meta::CURATION_NOTES.into(), Value::Array(notes));
            if needs_review {
                patch.insert(meta::NEEDS_REVIEW.into(), Value::Bool(true));
            }
            self.store.patch_metadata(&record.id, patch).await?;
            noted.push(record.id.clone());
        }
        Ok(noted)
    }

    async fn community_members(&self, decision: &Decision) -> Result<Vec<Record>> {
        let ids: Vec<RecordId> = decision
            .groups
            .iter()
            .flat_map(|g| g.members.iter().cloned())
            .collect();
        self.load(&ids).await
    }
}

fn superseded_by(record: &Record) -> Option<&str> {
    record.metadata.get(meta::SUPERSEDED_BY).and_then(Value::as_str)
}

fn merged_author(members: &[Record]) -> String {
    let authors: BTreeSet<&str> = members
        .iter()
        .map(|r| r.author.as_str())
        .filter(|a| !a.is_empty())
        .collect();
    if authors.is_empty() {
        CURATOR_AUTHOR.to_string()
    } else {
        authors.into_iter().collect::<Vec<_>>().join(", ")
    }
}

fn provenance_reason(decision: &Decision) -> String {
    let mut reason = format!("{} by {}", decision.kind(), decision.oracle);
    if !decision.notes.is_empty() {
        reason.push_str(": ");
        reason.push_str(&decision.notes);
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::store::MemoryStore;
    use crate::testing::{decision_for, record, record_at, FixedEmbedder, TEST_EMBEDDING_DIM};
    use curator_common::{MergedContent, Verdict};
    use std::sync::Arc;

    fn index() -> MemoryIndex {
        MemoryIndex::new(Arc::new(FixedEmbedder::new(TEST_EMBEDDING_DIM)))
    }

    #[test]
    fn pairs_union_into_groups() {
        let groups = merge_groups(&[
            MergePair("b".into(), "c".into()),
            MergePair("a".into(), "b".into()),
            MergePair("x".into(), "y".into()),
        ]);
        assert_eq!(
            groups,
            vec![
                vec!["a".to_string(), "b".into(), "c".into()],
                vec!["x".to_string(), "y".into()]
            ]
        );
    }

    #[test]
    fn synced_records_always_survive() {
        let old = record_at("old", 1);
        let mut synced = record_at("synced", 5);
        synced.status = RecordStatus::Synced;
        let picked = pick_survivor(&[&old, &synced], SurvivorPolicy::Older).unwrap();
        assert_eq!(picked.id, "synced");
    }

    #[test]
    fn survivor_policy_tie_breaks() {
        let mut old = record_at("old", 1);
        old.body = "short".into();
        let mut long = record_at("long", 2);
        long.body = "a much longer body with details".into();
        assert_eq!(pick_survivor(&[&old, &long], SurvivorPolicy::Older).unwrap().id, "old");
        assert_eq!(
            pick_survivor(&[&old, &long], SurvivorPolicy::MoreComplete).unwrap().id,
            "long"
        );
    }

    #[tokio::test]
    async fn survivor_merge_supersedes_loser_with_provenance() {
        let store = MemoryStore::with_records([record_at("a", 1), record_at("b", 2)]);
        let index = index();
        let applier = DecisionApplier::new(&store, &index, SurvivorPolicy::Older, false);
        let decision = decision_for(
            &["a", "b"],
            Verdict::MergeAll {
                merges: vec![MergePair("a".into(), "b".into())],
            },
        );

        let result = applier.apply(&decision).await.unwrap();
        assert_eq!(result.effects.superseded, vec!["b".to_string()]);
        assert_eq!(store.status_of("a").await, Some(RecordStatus::Pending));
        assert_eq!(store.status_of("b").await, Some(RecordStatus::Superseded));

        let b = store.get("b").await.unwrap().unwrap();
        assert_eq!(b.metadata[meta::SUPERSEDED_BY], "a");
        let provenance = store.provenance().await;
        assert_eq!(provenance.len(), 1);
        assert_eq!(provenance[0].sources, vec!["b".to_string()]);
        assert_eq!(provenance[0].results, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn reapplying_is_a_no_op() {
        let store = MemoryStore::with_records([record_at("a", 1), record_at("b", 2)]);
        let index = index();
        let applier = DecisionApplier::new(&store, &index, SurvivorPolicy::Older, false);
        let decision = decision_for(
            &["a", "b"],
            Verdict::MergeAll {
                merges: vec![MergePair("a".into(), "b".into())],
            },
        );
        applier.apply(&decision).await.unwrap();
        let before = store.all().await.unwrap();

        let again = applier.apply(&decision).await.unwrap();
        assert!(again.already_applied);
        assert_eq!(store.all().await.unwrap(), before);
        assert_eq!(store.provenance().await.len(), 1);
        assert_eq!(store.decisions().await.len(), 1);
    }

    #[tokio::test]
    async fn synthesized_content_creates_a_new_record() {
        let store = MemoryStore::with_records([record_at("a", 1), record_at("b", 2)]);
        let index = index();
        let applier = DecisionApplier::new(&store, &index, SurvivorPolicy::Older, false);
        let mut decision = decision_for(
            &["a", "b"],
            Verdict::MergeAll {
                merges: vec![MergePair("a".into(), "b".into())],
            },
        );
        decision.groups[0].content = Some(MergedContent {
            title: "Pool sizing".into(),
            body: "Raise the pool to fix timeouts.".into(),
        });

        let result = applier.apply(&decision).await.unwrap();
        assert_eq!(result.effects.created.len(), 1);
        let new_id = &result.effects.created[0];
        assert_eq!(new_id, &derived_record_id(&format!("{}:0", decision.id)));
        assert_eq!(store.status_of(new_id).await, Some(RecordStatus::Pending));
        assert_eq!(store.status_of("a").await, Some(RecordStatus::Superseded));
        assert_eq!(store.status_of("b").await, Some(RecordStatus::Superseded));
        assert!(index.contains(new_id).await.unwrap());

        let provenance = store.provenance().await;
        assert_eq!(provenance[0].sources, vec!["a".to_string(), "b".into()]);
        assert_eq!(provenance[0].results, vec![new_id.clone()]);
    }

    #[tokio::test]
    async fn keep_separate_leaves_records_pending_with_a_note() {
        let store = MemoryStore::with_records([record("a", "infra", "t", "b"), record("b", "infra", "t", "b")]);
        let index = index();
        let applier = DecisionApplier::new(&store, &index, SurvivorPolicy::Older, false);
        let mut decision = decision_for(&["a", "b"], Verdict::KeepSeparate);
        decision.notes = "different fixes".into();

        let result = applier.apply(&decision).await.unwrap();
        assert_eq!(result.effects.noted.len(), 2);
        assert!(!result.effects.review_queued);
        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, RecordStatus::Pending);
        assert_eq!(a.metadata[meta::CURATION_NOTES][0]["notes"], "different fixes");
        assert!(store.provenance().await.is_empty());
    }

    #[tokio::test]
    async fn manual_review_flags_members() {
        let store = MemoryStore::with_records([record("a", "infra", "t", "b"), record("b", "infra", "t", "b")]);
        let index = index();
        let applier = DecisionApplier::new(&store, &index, SurvivorPolicy::Older, false);
        let decision = decision_for(&["a", "b"], Verdict::ManualReview);

        let result = applier.apply(&decision).await.unwrap();
        assert!(result.effects.review_queued);
        let b = store.get("b").await.unwrap().unwrap();
        assert_eq!(b.metadata[meta::NEEDS_REVIEW], true);
        assert_eq!(b.status, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn interrupted_merge_completes_without_duplicates() {
        let store = MemoryStore::with_records([record_at("a", 1), record_at("b", 2), record_at("c", 3)]);
        let index = index();
        let applier = DecisionApplier::new(&store, &index, SurvivorPolicy::Older, false);
        let decision = decision_for(
            &["a", "b", "c"],
            Verdict::MergeAll {
                merges: vec![MergePair("a".into(), "b".into()), MergePair("a".into(), "c".into())],
            },
        );
        // Simulate a crash after the first supersede.
        let mut patch = Map::new();
        patch.insert(meta::SUPERSEDED_BY.into(), Value::String("a".into()));
        store.patch_metadata("b", patch).await.unwrap();
        store.update_status("b", RecordStatus::Superseded).await.unwrap();

        applier.apply(&decision).await.unwrap();
        assert_eq!(store.status_of("c").await, Some(RecordStatus::Superseded));
        let provenance = store.provenance().await;
        assert_eq!(provenance.len(), 1);
        assert_eq!(provenance[0].sources, vec!["b".to_string(), "c".into()]);
    }
}
