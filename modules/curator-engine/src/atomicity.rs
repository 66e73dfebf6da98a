use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use curator_common::{
    content_hash, derived_record_id, meta, structural_outline, ProvenanceKind, ProvenanceRecord,
    Record, RecordId, RecordStatus,
};

use crate::oracle::contract::{validate_atomicity, AtomicPart, AtomicityVerdict};
use crate::oracle::{AtomicityRequest, RetryOutcome, RetryPolicy};
use crate::report::AtomicityStats;
use crate::traits::{DecisionOracle, RecordStore, SimilarityIndex};

/// Decision id recorded on the provenance of a split.
pub fn split_decision_id(source: &str) -> String {
    format!("split-{}", content_hash(source))
}

/// Id of the `index`-th part split out of `source`.
pub fn split_record_id(source: &str, index: usize) -> RecordId {
    derived_record_id(&format!("{source}:split:{index}"))
}

/// Result of the pre-pass.
#[derive(Debug, Default)]
pub struct AtomicityOutcome {
    pub stats: AtomicityStats,
    pub provenance: Vec<ProvenanceRecord>,
    pub warnings: Vec<String>,
}

/// Checks every unchecked pending record for bundled guidance and splits the
/// ones that bundle several pieces. Oracle calls run concurrently; splits
/// are applied one at a time.
pub struct AtomicityPass<'a> {
    store: &'a dyn RecordStore,
    index: &'a dyn SimilarityIndex,
    oracle: &'a dyn DecisionOracle,
    policy: RetryPolicy,
    workers: usize,
}

impl<'a> AtomicityPass<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        index: &'a dyn SimilarityIndex,
        oracle: &'a dyn DecisionOracle,
        policy: RetryPolicy,
        workers: usize,
    ) -> Self {
        Self {
            store,
            index,
            oracle,
            policy,
            workers: workers.max(1),
        }
    }

    pub async fn run(&self) -> Result<AtomicityOutcome> {
        let candidates: Vec<Record> = self
            .store
            .list(RecordStatus::Pending)
            .await?
            .into_iter()
            .filter(|r| !r.meta_flag(meta::ATOMICITY_CHECKED))
            .collect();

        let mut outcome = AtomicityOutcome::default();
        if candidates.is_empty() {
            return Ok(outcome);
        }
        info!(records = candidates.len(), "Atomicity pre-pass starting");

        let verdicts: Vec<(Record, RetryOutcome<AtomicityVerdict>)> = stream::iter(candidates)
            .map(|record| async move {
                let request = AtomicityRequest {
                    record_id: record.id.clone(),
                    category: record.category.clone(),
                    title: record.title.clone(),
                    body: record.body.clone(),
                };
                let label = format!("atomicity:{}", record.id);
                let verdict = self
                    .policy
                    .run(&label, || self.oracle.check_atomicity(&request), validate_atomicity)
                    .await;
                (record, verdict)
            })
            .buffered(self.workers)
            .collect()
            .await;

        for (record, verdict) in verdicts {
            outcome.stats.checked += 1;
            match verdict {
                RetryOutcome::Accepted {
                    value: AtomicityVerdict::Atomic,
                    ..
                } => {
                    let mut patch = Map::new();
                    patch.insert(meta::ATOMICITY_CHECKED.into(), Value::Bool(true));
                    self.store.patch_metadata(&record.id, patch).await?;
                }
                RetryOutcome::Accepted {
                    value: AtomicityVerdict::Split { parts, notes },
                    ..
                } => {
                    let created = self.split(&record, &parts, &notes, &mut outcome).await?;
                    if created > 0 {
                        outcome.stats.split += 1;
                        outcome.stats.created += created;
                    }
                }
                RetryOutcome::Exhausted { last_error, .. } => {
                    outcome.stats.failed += 1;
                    let msg = format!(
                        "atomicity check for {} failed, record left unchecked: {last_error}",
                        record.id
                    );
                    warn!("{msg}");
                    outcome.warnings.push(msg);
                }
            }
        }

        info!("Atomicity pre-pass complete. {}", outcome.stats);
        Ok(outcome)
    }

    /// Replace `source` with one pending record per part. Returns the number
    /// of records created by this call.
    async fn split(
        &self,
        source: &Record,
        parts: &[AtomicPart],
        notes: &str,
        outcome: &mut AtomicityOutcome,
    ) -> Result<usize> {
        let current = self.store.get(&source.id).await?;
        if !current.as_ref().is_some_and(Record::is_pending) {
            return Ok(0);
        }

        let mut created = 0;
        let mut results = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let id = split_record_id(&source.id, i);
            if self.store.get(&id).await?.is_none() {
                let mut record = Record::new(
                    id.clone(),
                    source.category.clone(),
                    part.title.clone(),
                    part.body.clone(),
                    source.author.clone(),
                    Utc::now(),
                );
                record.kind = source.kind;
                record
                    .metadata
                    .insert(meta::OUTLINE.into(), Value::String(structural_outline(&record)));
                record
                    .metadata
                    .insert(meta::DERIVED_FROM.into(), json!([source.id]));
                record
                    .metadata
                    .insert(meta::ATOMICITY_CHECKED.into(), Value::Bool(true));
                let text = record.comparison_text();
                self.store.create(record).await?;
                self.index.upsert(&id, &text).await?;
                created += 1;
            }
            results.push(id);
        }

        let mut patch = Map::new();
        patch.insert(meta::SUPERSEDED_BY.into(), json!(results));
        self.store.patch_metadata(&source.id, patch).await?;
        self.store
            .update_status(&source.id, RecordStatus::Superseded)
            .await?;

        let decision_id = split_decision_id(&source.id);
        let entry = ProvenanceRecord {
            decision_id: decision_id.clone(),
            kind: ProvenanceKind::Split,
            sources: vec![source.id.clone()],
            results,
            reason: if notes.is_empty() {
                format!("split into {} atomic records", parts.len())
            } else {
                format!("split into {} atomic records: {notes}", parts.len())
            },
            recorded_at: Utc::now(),
        };
        let existing = self.store.provenance_for(&decision_id).await?;
        if !existing.iter().any(|p| p.same_effect(&entry)) {
            self.store.append_provenance(entry.clone()).await?;
            outcome.provenance.push(entry);
        }

        info!(source = source.id.as_str(), parts = parts.len(), "Split non-atomic record");
        Ok(created)
    }
}
