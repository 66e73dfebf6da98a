use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use curator_common::Community;

use crate::convergence::{RoundProgress, RunOutcome};
use crate::report::{RoundReport, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Atomicity,
    AutoDedup,
    Rounds,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atomicity => write!(f, "atomicity"),
            Self::AutoDedup => write!(f, "auto_dedup"),
            Self::Rounds => write!(f, "rounds"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// The communities selected for the current round and how far APPLY got.
/// Persisted so a resumed round works through exactly the same batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundBatch {
    pub round: u32,
    pub communities: Vec<Community>,
    /// Communities `[0, offset)` have been applied.
    pub offset: usize,
    pub pending_before: usize,
    pub communities_before: usize,
    pub report: RoundReport,
}

impl RoundBatch {
    pub fn remaining(&self) -> &[Community] {
        &self.communities[self.offset.min(self.communities.len())..]
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.communities.len()
    }
}

/// Everything needed to resume an interrupted run. Written to `state.json`
/// after every applied decision and at every phase and round boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    /// Checksum of the record set as of the last checkpoint.
    pub checksum: String,
    pub phase: Phase,
    /// 1-based index of the current round.
    pub round: u32,
    pub max_rounds: u32,
    pub history: Vec<RoundProgress>,
    /// Communities from the last graph build. Rounds between rebuilds select
    /// from and measure against this list, so it survives a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communities: Option<Vec<Community>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<RoundBatch>,
    /// Fingerprints of communities already decided in this run.
    pub reviewed: BTreeSet<String>,
    pub below_threshold_streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    /// Decision log this run appends to, relative to the run directory.
    pub decision_log: String,
    pub report: RunReport,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(checksum: String, max_rounds: u32, decision_log: &str, dry_run: bool) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            report: RunReport::new(run_id.clone(), dry_run),
            run_id,
            checksum,
            phase: Phase::Atomicity,
            round: 1,
            max_rounds,
            history: Vec::new(),
            communities: None,
            batch: None,
            reviewed: BTreeSet::new(),
            below_threshold_streak: 0,
            outcome: None,
            decision_log: decision_log.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Mark the community at the batch offset as applied.
    pub fn advance_batch(&mut self, community_id: &str) {
        if let Some(batch) = &mut self.batch {
            batch.offset += 1;
        }
        self.reviewed.insert(community_id.to_string());
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = Some(outcome);
        self.report.outcome = Some(outcome);
        self.report.finished_at = Some(Utc::now());
        if !outcome.is_resumable() {
            self.phase = Phase::Finished;
        }
    }
}
