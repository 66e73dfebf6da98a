use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use curator_common::{
    CuratorError, DecisionLogEntry, ProvenanceRecord, Record, RecordId, RecordStatus,
};

use crate::traits::RecordStore;

#[derive(Debug, Default, Clone)]
pub(crate) struct StoreData {
    pub records: BTreeMap<RecordId, Record>,
    pub provenance: Vec<ProvenanceRecord>,
    pub decisions: Vec<DecisionLogEntry>,
}

impl StoreData {
    pub fn create(&mut self, record: Record) -> Result<()> {
        if self.records.contains_key(&record.id) {
            return Err(CuratorError::Store(format!("record {} already exists", record.id)).into());
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn update_status(&mut self, id: &str, status: RecordStatus) -> Result<bool> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CuratorError::NotFound(id.to_string()))?;
        apply_status(record, status)
    }

    pub fn patch_metadata(&mut self, id: &str, patch: Map<String, Value>) -> Result<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CuratorError::NotFound(id.to_string()))?;
        apply_patch(record, patch);
        Ok(())
    }

    pub fn decision_applied(&self, decision_id: &str) -> bool {
        self.decisions.iter().any(|d| d.decision.id == decision_id)
    }

    pub fn provenance_for(&self, decision_id: &str) -> Vec<ProvenanceRecord> {
        self.provenance
            .iter()
            .filter(|p| p.decision_id == decision_id)
            .cloned()
            .collect()
    }
}

/// Shared status-transition rule for every backend.
pub(crate) fn apply_status(record: &mut Record, status: RecordStatus) -> Result<bool> {
    if record.status == status {
        return Ok(false);
    }
    if !record.status.can_transition_to(status) {
        return Err(CuratorError::InvalidTransition {
            id: record.id.clone(),
            from: record.status,
            to: status,
        }
        .into());
    }
    record.status = status;
    record.updated_at = Utc::now();
    Ok(true)
}

pub(crate) fn apply_patch(record: &mut Record, patch: Map<String, Value>) {
    if patch.is_empty() {
        return;
    }
    for (key, value) in patch {
        record.metadata.insert(key, value);
    }
    record.updated_at = Utc::now();
}

/// In-process record store.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let data = StoreData {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            ..StoreData::default()
        };
        Self {
            data: RwLock::new(data),
        }
    }

    pub async fn provenance(&self) -> Vec<ProvenanceRecord> {
        self.data.read().await.provenance.clone()
    }

    pub async fn decisions(&self) -> Vec<DecisionLogEntry> {
        self.data.read().await.decisions.clone()
    }

    pub async fn status_of(&self, id: &str) -> Option<RecordStatus> {
        self.data.read().await.records.get(id).map(|r| r.status)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn all(&self) -> Result<Vec<Record>> {
        Ok(self.data.read().await.records.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.data.read().await.records.get(id).cloned())
    }

    async fn create(&self, record: Record) -> Result<()> {
        self.data.write().await.create(record)
    }

    async fn update_status(&self, id: &str, status: RecordStatus) -> Result<bool> {
        self.data.write().await.update_status(id, status)
    }

    async fn patch_metadata(&self, id: &str, patch: Map<String, Value>) -> Result<()> {
        self.data.write().await.patch_metadata(id, patch)
    }

    async fn append_provenance(&self, entry: ProvenanceRecord) -> Result<()> {
        self.data.write().await.provenance.push(entry);
        Ok(())
    }

    async fn provenance_for(&self, decision_id: &str) -> Result<Vec<ProvenanceRecord>> {
        Ok(self.data.read().await.provenance_for(decision_id))
    }

    async fn append_decision(&self, entry: DecisionLogEntry) -> Result<()> {
        self.data.write().await.decisions.push(entry);
        Ok(())
    }

    async fn decision_applied(&self, decision_id: &str) -> Result<bool> {
        Ok(self.data.read().await.decision_applied(decision_id))
    }
}
