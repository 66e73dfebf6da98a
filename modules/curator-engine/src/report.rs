use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use curator_common::{Decision, DecisionKind, RecordId};

use crate::convergence::{RoundProgress, RunOutcome};

/// A community left for a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub decision_id: String,
    pub community_id: String,
    pub round: u32,
    pub members: Vec<RecordId>,
    pub notes: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AtomicityStats {
    pub checked: usize,
    pub split: usize,
    pub created: usize,
    pub failed: usize,
}

impl fmt::Display for AtomicityStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "atomicity(checked={} split={} created={} failed={})",
            self.checked, self.split, self.created, self.failed
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoDedupStats {
    pub pairs: usize,
    pub groups: usize,
    pub superseded: usize,
}

impl fmt::Display for AutoDedupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "auto_dedup(pairs={} groups={} superseded={})",
            self.pairs, self.groups, self.superseded
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub round: u32,
    pub selected: usize,
    pub skipped: usize,
    /// Decision counts keyed by decision kind.
    pub decisions: BTreeMap<String, usize>,
    pub records_superseded: usize,
    pub records_created: usize,
    pub retries: u32,
    pub rebuilt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<RoundProgress>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RoundReport {
    pub fn new(round: u32) -> Self {
        Self {
            round,
            ..Self::default()
        }
    }

    pub fn count(&mut self, kind: DecisionKind) {
        *self.decisions.entry(kind.to_string()).or_default() += 1;
    }

    pub fn decided(&self) -> usize {
        self.decisions.values().sum()
    }
}

/// Round-by-round account of a run, persisted in the run state as it grows
/// and rendered to `report.md` / `report.json` at the end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub dry_run: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub pending_at_start: usize,
    pub pending_at_end: usize,
    pub atomicity: AtomicityStats,
    pub auto_dedup: AutoDedupStats,
    pub rounds: Vec<RoundReport>,
    pub review_queue: Vec<ReviewItem>,
    pub warnings: Vec<String>,
    /// Times this run was resumed from saved state.
    pub resumes: u32,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            dry_run,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn queue_review(&mut self, decision: &Decision) {
        if self
            .review_queue
            .iter()
            .any(|r| r.decision_id == decision.id)
        {
            return;
        }
        self.review_queue.push(ReviewItem {
            decision_id: decision.id.clone(),
            community_id: decision.community_id.clone(),
            round: decision.round,
            members: decision
                .groups
                .iter()
                .flat_map(|g| g.members.iter().cloned())
                .collect(),
            notes: decision.notes.clone(),
        });
    }

    pub fn total_superseded(&self) -> usize {
        self.auto_dedup.superseded
            + self.atomicity.split
            + self.rounds.iter().map(|r| r.records_superseded).sum::<usize>()
    }

    pub fn decision_totals(&self) -> BTreeMap<String, usize> {
        let mut totals = BTreeMap::new();
        for round in &self.rounds {
            for (kind, n) in &round.decisions {
                *totals.entry(kind.clone()).or_default() += n;
            }
        }
        totals
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let outcome = self
            .outcome
            .map(|o| o.to_string())
            .unwrap_or_else(|| "in_progress".to_string());

        let _ = writeln!(out, "# Curation run {}", self.run_id);
        let _ = writeln!(out);
        if self.dry_run {
            let _ = writeln!(out, "> Dry run: no records were changed.");
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "- Outcome: **{outcome}**");
        if let Some(started) = self.started_at {
            let _ = writeln!(out, "- Started: {}", started.to_rfc3339());
        }
        if let Some(finished) = self.finished_at {
            let _ = writeln!(out, "- Finished: {}", finished.to_rfc3339());
        }
        let _ = writeln!(
            out,
            "- Pending records: {} → {}",
            self.pending_at_start, self.pending_at_end
        );
        let _ = writeln!(
            out,
            "- Atomicity: {} checked, {} split into {} records, {} failed",
            self.atomicity.checked, self.atomicity.split, self.atomicity.created, self.atomicity.failed
        );
        let _ = writeln!(
            out,
            "- Auto-dedup: {} pairs in {} groups, {} records superseded",
            self.auto_dedup.pairs, self.auto_dedup.groups, self.auto_dedup.superseded
        );
        if self.resumes > 0 {
            let _ = writeln!(out, "- Resumed {} time(s)", self.resumes);
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "## Rounds");
        let _ = writeln!(out);
        if self.rounds.is_empty() {
            let _ = writeln!(out, "No rounds ran.");
        } else {
            let _ = writeln!(
                out,
                "| Round | Selected | Skipped | Decisions | Superseded | Created | Retries | Pending Δ | Communities Δ |"
            );
            let _ = writeln!(out, "|---|---|---|---|---|---|---|---|---|");
            for round in &self.rounds {
                let decisions = round
                    .decisions
                    .iter()
                    .map(|(k, n)| format!("{k}={n}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let (pending, communities) = match round.progress {
                    Some(p) => (
                        format!("{} → {} ({:.3})", p.pending_before, p.pending_after, p.pending_delta),
                        format!(
                            "{} → {} ({:.3})",
                            p.communities_before, p.communities_after, p.community_delta
                        ),
                    ),
                    None => ("-".to_string(), "-".to_string()),
                };
                let _ = writeln!(
                    out,
                    "| {}{} | {} | {} | {} | {} | {} | {} | {} | {} |",
                    round.round,
                    if round.rebuilt { "*" } else { "" },
                    round.selected,
                    round.skipped,
                    if decisions.is_empty() { "-".to_string() } else { decisions },
                    round.records_superseded,
                    round.records_created,
                    round.retries,
                    pending,
                    communities
                );
            }
            let _ = writeln!(out);
            let _ = writeln!(out, "`*` graph and communities rebuilt before the round.");
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "## Manual review queue");
        let _ = writeln!(out);
        if self.review_queue.is_empty() {
            let _ = writeln!(out, "Empty.");
        } else {
            for item in &self.review_queue {
                let _ = writeln!(
                    out,
                    "- `{}` (round {}): {}{}",
                    item.community_id,
                    item.round,
                    item.members.join(", "),
                    if item.notes.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", item.notes)
                    }
                );
            }
        }

        let warnings: Vec<String> = self
            .warnings
            .iter()
            .cloned()
            .chain(self.rounds.iter().flat_map(|r| {
                r.warnings
                    .iter()
                    .map(move |w| format!("round {}: {w}", r.round))
            }))
            .collect();
        let _ = writeln!(out);
        let _ = writeln!(out, "## Warnings");
        let _ = writeln!(out);
        if warnings.is_empty() {
            let _ = writeln!(out, "None.");
        } else {
            for w in warnings {
                let _ = writeln!(out, "- {w}");
            }
        }
        out
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = self
            .outcome
            .map(|o| o.to_string())
            .unwrap_or_else(|| "in_progress".to_string());
        let totals = self
            .decision_totals()
            .iter()
            .map(|(k, n)| format!("{k}={n}"))
            .collect::<Vec<_>>()
            .join(" ");
        write!(
            f,
            "outcome={outcome} rounds={} pending={}->{} superseded={} review_queue={} warnings={} {} {} decisions({totals})",
            self.rounds.len(),
            self.pending_at_start,
            self.pending_at_end,
            self.total_superseded(),
            self.review_queue.len(),
            self.warnings.len() + self.rounds.iter().map(|r| r.warnings.len()).sum::<usize>(),
            self.atomicity,
            self.auto_dedup,
        )
    }
}
