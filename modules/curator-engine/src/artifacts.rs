use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use curator_common::{DecisionLogEntry, ProvenanceRecord};

use crate::report::RunReport;
use crate::state::RunState;
use crate::store::file::{append_jsonl, read_jsonl, write_atomic};

pub const STATE_FILE: &str = "state.json";
pub const DECISIONS_FILE: &str = "decisions.jsonl";
pub const PROVENANCE_FILE: &str = "provenance.jsonl";
pub const REPORT_MD: &str = "report.md";
pub const REPORT_JSON: &str = "report.json";
pub const LOCK_FILE: &str = "curator.lock";
pub const DRY_RUN_DIR: &str = "dry-run";

/// Locks older than this belong to a killed process and are cleared.
const STALE_LOCK_HOURS: i64 = 6;

/// Run output directory: state file, decision and provenance logs, report.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    /// Live runs write to `out`; dry runs to `out/dry-run`.
    pub fn for_run(out: &Path, dry_run: bool) -> Self {
        let root = if dry_run {
            out.join(DRY_RUN_DIR)
        } else {
            out.to_path_buf()
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create run directory {}", self.root.display()))
    }

    /// Drop the logs and report of a previous run. The lock and anything
    /// else in the directory are left alone.
    pub async fn reset(&self) -> Result<()> {
        for name in [STATE_FILE, DECISIONS_FILE, PROVENANCE_FILE, REPORT_MD, REPORT_JSON] {
            let path = self.path(name);
            if tokio::fs::try_exists(&path).await? {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }

    pub async fn load_state(&self) -> Result<Option<RunState>> {
        let path = self.path(STATE_FILE);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match serde_json::from_str(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable run state, ignoring");
                Ok(None)
            }
        }
    }

    pub async fn save_state(&self, state: &RunState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path(STATE_FILE), &json).await
    }

    pub async fn append_decision(&self, entry: &DecisionLogEntry) -> Result<()> {
        append_jsonl(&self.path(DECISIONS_FILE), entry).await
    }

    pub async fn append_provenance(&self, entry: &ProvenanceRecord) -> Result<()> {
        append_jsonl(&self.path(PROVENANCE_FILE), entry).await
    }

    pub async fn decisions(&self) -> Result<Vec<DecisionLogEntry>> {
        read_jsonl(&self.path(DECISIONS_FILE)).await
    }

    pub async fn provenance(&self) -> Result<Vec<ProvenanceRecord>> {
        read_jsonl(&self.path(PROVENANCE_FILE)).await
    }

    pub async fn write_report(&self, report: &RunReport) -> Result<()> {
        write_atomic(&self.path(REPORT_MD), report.to_markdown().as_bytes()).await?;
        write_atomic(&self.path(REPORT_JSON), &serde_json::to_vec_pretty(report)?).await?;
        info!(dir = %self.root.display(), "Wrote run report");
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    started_at: DateTime<Utc>,
}

/// Single-writer guard for a run directory. Acquire before touching state,
/// release when done, whatever the outcome.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Returns `None` when another live run holds the lock. Stale locks left
    /// by killed processes are cleared first.
    pub async fn acquire(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(LOCK_FILE);
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            let stale = serde_json::from_str::<LockInfo>(&content)
                .map(|info| Utc::now() - info.started_at > Duration::hours(STALE_LOCK_HOURS))
                .unwrap_or(true);
            if stale {
                warn!(path = %path.display(), "Removing stale run lock");
                tokio::fs::remove_file(&path).await.ok();
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match file {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(&serde_json::to_vec(&info)?).await?;
                file.flush().await?;
                Ok(Some(Self { path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to create {}", path.display())),
        }
    }

    pub async fn release(self) -> Result<()> {
        tokio::fs::remove_file(&self.path)
            .await
            .with_context(|| format!("Failed to remove {}", self.path.display()))
    }
}
