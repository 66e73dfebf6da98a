use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use curator_common::{DecisionLogEntry, ProvenanceRecord, Record, RecordId, RecordStatus};

use super::memory::StoreData;
use crate::traits::RecordStore;

const RECORDS_FILE: &str = "records.json";
const PROVENANCE_FILE: &str = "provenance.jsonl";
const DECISIONS_FILE: &str = "decisions.jsonl";

/// Directory-backed store.
///
/// `records.json` holds every record and is rewritten through a temp file and
/// rename on each mutation; `provenance.jsonl` and `decisions.jsonl` are
/// append-only. All state is cached in memory after `open`.
pub struct FileStore {
    dir: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create store directory {}", dir.display()))?;

        let records_path = dir.join(RECORDS_FILE);
        let records: Vec<Record> = if tokio::fs::try_exists(&records_path).await? {
            let content = tokio::fs::read_to_string(&records_path)
                .await
                .with_context(|| format!("Failed to read {}", records_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", records_path.display()))?
        } else {
            Vec::new()
        };

        let provenance: Vec<ProvenanceRecord> = read_jsonl(&dir.join(PROVENANCE_FILE)).await?;
        let decisions: Vec<DecisionLogEntry> = read_jsonl(&dir.join(DECISIONS_FILE)).await?;

        info!(
            dir = %dir.display(),
            records = records.len(),
            provenance = provenance.len(),
            decisions = decisions.len(),
            "Opened file store"
        );

        let data = StoreData {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            provenance,
            decisions,
        };
        Ok(Self {
            dir,
            data: Mutex::new(data),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn persist_records(&self, data: &StoreData) -> Result<()> {
        let records: Vec<&Record> = data.records.values().collect();
        let json = serde_json::to_vec_pretty(&records)?;
        write_atomic(&self.dir.join(RECORDS_FILE), &json).await
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn all(&self) -> Result<Vec<Record>> {
        Ok(self.data.lock().await.records.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.data.lock().await.records.get(id).cloned())
    }

    async fn create(&self, record: Record) -> Result<()> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        next.create(record)?;
        self.persist_records(&next).await?;
        *data = next;
        Ok(())
    }

    async fn update_status(&self, id: &str, status: RecordStatus) -> Result<bool> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let changed = next.update_status(id, status)?;
        if changed {
            self.persist_records(&next).await?;
            *data = next;
        }
        Ok(changed)
    }

    async fn patch_metadata(&self, id: &str, patch: Map<String, Value>) -> Result<()> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        next.patch_metadata(id, patch)?;
        self.persist_records(&next).await?;
        *data = next;
        Ok(())
    }

    async fn patch_metadata_batch(&self, patches: Vec<(RecordId, Map<String, Value>)>) -> Result<()> {
        if patches.is_empty() {
            return Ok(());
        }
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        for (id, patch) in patches {
            next.patch_metadata(&id, patch)?;
        }
        self.persist_records(&next).await?;
        *data = next;
        Ok(())
    }

    async fn append_provenance(&self, entry: ProvenanceRecord) -> Result<()> {
        let mut data = self.data.lock().await;
        append_jsonl(&self.dir.join(PROVENANCE_FILE), &entry).await?;
        data.provenance.push(entry);
        Ok(())
    }

    async fn provenance_for(&self, decision_id: &str) -> Result<Vec<ProvenanceRecord>> {
        Ok(self.data.lock().await.provenance_for(decision_id))
    }

    async fn append_decision(&self, entry: DecisionLogEntry) -> Result<()> {
        let mut data = self.data.lock().await;
        append_jsonl(&self.dir.join(DECISIONS_FILE), &entry).await?;
        data.decisions.push(entry);
        Ok(())
    }

    async fn decision_applied(&self, decision_id: &str) -> Result<bool> {
        Ok(self.data.lock().await.decision_applied(decision_id))
    }
}

// ---------------------------------------------------------------------------
// File helpers shared with the run artifacts
// ---------------------------------------------------------------------------

/// Write `bytes` to a sibling temp file, then rename over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

pub(crate) async fn append_jsonl<T: Serialize>(path: &Path, entry: &T) -> Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let (end, needs_newline) = repair_tail(&mut file, path).await?;
    file.seek(SeekFrom::Start(end)).await?;
    if needs_newline {
        line.insert(0, b'\n');
    }
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

/// Make the file safe to append to after an interrupted write. A complete
/// final entry missing its newline is kept; a partial one is cut off. Returns
/// the offset to append at and whether a newline must come first.
async fn repair_tail(file: &mut tokio::fs::File, path: &Path) -> Result<(u64, bool)> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok((0, false));
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok((len, false));
    }

    file.seek(SeekFrom::Start(0)).await?;
    let mut content = Vec::with_capacity(len as usize);
    file.read_to_end(&mut content).await?;
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    if serde_json::from_slice::<Value>(&content[keep..]).is_ok() {
        return Ok((len, true));
    }

    warn!(
        path = %path.display(),
        dropped = content.len() - keep,
        "Dropping truncated final line before append"
    );
    file.set_len(keep as u64).await?;
    Ok((keep as u64, false))
}

/// Read a JSON-lines file. A truncated final line (interrupted append) is
/// skipped with a warning; a malformed line elsewhere is an error.
pub(crate) async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(Vec::new());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut entries = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if i + 1 == lines.len() && !content.ends_with('\n') => {
                warn!(path = %path.display(), error = %e, "Skipping truncated final line");
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Malformed line {} in {}", i + 1, path.display())
                });
            }
        }
    }
    Ok(entries)
}
