use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use curator_common::{
    CuratorError, DecisionLogEntry, ProvenanceRecord, Record, RecordId, RecordStatus,
};

use super::memory::{apply_patch, apply_status};
use crate::traits::RecordStore;

#[derive(Default)]
struct Overlay {
    records: BTreeMap<RecordId, Record>,
    provenance: Vec<ProvenanceRecord>,
    decisions: Vec<DecisionLogEntry>,
}

/// Dry-run wrapper. Reads fall through to `inner`; every write lands in an
/// in-memory overlay, so the inner store is never mutated.
pub struct OverlayStore {
    inner: Arc<dyn RecordStore>,
    overlay: RwLock<Overlay>,
}

impl OverlayStore {
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self {
            inner,
            overlay: RwLock::new(Overlay::default()),
        }
    }

    /// Number of records written to the overlay (created or changed).
    pub async fn touched(&self) -> usize {
        self.overlay.read().await.records.len()
    }

    async fn load_for_write(&self, id: &str) -> Result<Record> {
        if let Some(record) = self.overlay.read().await.records.get(id) {
            return Ok(record.clone());
        }
        self.inner
            .get(id)
            .await?
            .ok_or_else(|| CuratorError::NotFound(id.to_string()).into())
    }
}

#[async_trait]
impl RecordStore for OverlayStore {
    async fn all(&self) -> Result<Vec<Record>> {
        let mut merged: BTreeMap<RecordId, Record> = self
            .inner
            .all()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let overlay = self.overlay.read().await;
        for (id, record) in &overlay.records {
            merged.insert(id.clone(), record.clone());
        }
        Ok(merged.into_values().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        if let Some(record) = self.overlay.read().await.records.get(id) {
            return Ok(Some(record.clone()));
        }
        self.inner.get(id).await
    }

    async fn create(&self, record: Record) -> Result<()> {
        if self.get(&record.id).await?.is_some() {
            return Err(CuratorError::Store(format!("record {} already exists", record.id)).into());
        }
        self.overlay
            .write()
            .await
            .records
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_status(&self, id: &str, status: RecordStatus) -> Result<bool> {
        let mut record = self.load_for_write(id).await?;
        let changed = apply_status(&mut record, status)?;
        if changed {
            self.overlay
                .write()
                .await
                .records
                .insert(id.to_string(), record);
        }
        Ok(changed)
    }

    async fn patch_metadata(&self, id: &str, patch: Map<String, Value>) -> Result<()> {
        let mut record = self.load_for_write(id).await?;
        apply_patch(&mut record, patch);
        self.overlay
            .write()
            .await
            .records
            .insert(id.to_string(), record);
        Ok(())
    }

    async fn append_provenance(&self, entry: ProvenanceRecord) -> Result<()> {
        self.overlay.write().await.provenance.push(entry);
        Ok(())
    }

    async fn provenance_for(&self, decision_id: &str) -> Result<Vec<ProvenanceRecord>> {
        let mut entries = self.inner.provenance_for(decision_id).await?;
        entries.extend(
            self.overlay
                .read()
                .await
                .provenance
                .iter()
                .filter(|p| p.decision_id == decision_id)
                .cloned(),
        );
        Ok(entries)
    }

    async fn append_decision(&self, entry: DecisionLogEntry) -> Result<()> {
        self.overlay.write().await.decisions.push(entry);
        Ok(())
    }

    async fn decision_applied(&self, decision_id: &str) -> Result<bool> {
        if self
            .overlay
            .read()
            .await
            .decisions
            .iter()
            .any(|d| d.decision.id == decision_id)
        {
            return Ok(true);
        }
        self.inner.decision_applied(decision_id).await
    }
}
