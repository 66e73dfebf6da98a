use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use tracing::{info, warn};

use curator_common::{
    meta, record_set_checksum, structural_outline, Community, CuratorError, Decision, FileConfig,
    Record, RecordId, RecordStatus,
};

use crate::applier::{ApplyResult, DecisionApplier};
use crate::artifacts::{ArtifactDir, RunLock, DECISIONS_FILE};
use crate::atomicity::AtomicityPass;
use crate::auto_dedup;
use crate::candidates::{CandidateBuilder, CandidateSet};
use crate::community::detect_communities;
use crate::convergence::{ConvergenceTracker, RoundProgress, RunOutcome, Step};
use crate::graph::SimilarityGraph;
use crate::index::OverlayIndex;
use crate::oracle::RetryPolicy;
use crate::report::{RoundReport, RunReport};
use crate::rounds::{self, Decided, Decider};
use crate::state::{Phase, RoundBatch, RunState};
use crate::store::OverlayStore;
use crate::traits::{DecisionOracle, RecordStore, SimilarityIndex};

/// How to treat saved state from an earlier run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Ignore saved state and start over.
    pub fresh: bool,
    /// Accept discarding stale state even when the config asks for
    /// confirmation.
    pub assume_yes: bool,
}

/// The curation engine: atomicity pre-pass, auto-dedup, then decision rounds
/// until convergence, with state checkpointed after every applied decision.
pub struct Curator {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SimilarityIndex>,
    oracle: Arc<dyn DecisionOracle>,
    config: FileConfig,
    out: PathBuf,
    options: RunOptions,
    stop: Arc<AtomicBool>,
}

impl Curator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SimilarityIndex>,
        oracle: Arc<dyn DecisionOracle>,
        config: FileConfig,
        out: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            index,
            oracle,
            config,
            out: out.into(),
            options: RunOptions::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Set to request a clean halt at the next round boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run the engine. Acquires the run lock, runs, releases the lock.
    pub async fn run(&self) -> Result<RunReport> {
        self.config.validate()?;
        let dry_run = self.config.run.dry_run;
        let artifacts = ArtifactDir::for_run(&self.out, dry_run);
        artifacts.create().await?;

        let Some(lock) = RunLock::acquire(artifacts.root()).await? else {
            warn!(dir = %artifacts.root().display(), "Another curation run holds the lock");
            return Err(CuratorError::State(format!(
                "run directory {} is locked by another run",
                artifacts.root().display()
            ))
            .into());
        };

        let (store, index): (Arc<dyn RecordStore>, Arc<dyn SimilarityIndex>) = if dry_run {
            info!("Dry run: writes go to overlays, the store and index are left untouched");
            (
                Arc::new(OverlayStore::new(self.store.clone())),
                Arc::new(OverlayIndex::new(self.index.clone())),
            )
        } else {
            (self.store.clone(), self.index.clone())
        };

        let result = self
            .run_inner(store.as_ref(), index.as_ref(), &artifacts)
            .await;

        // Always release lock
        if let Err(e) = lock.release().await {
            warn!(error = %e, "Failed to release run lock");
        }

        result
    }

    async fn run_inner(
        &self,
        store: &dyn RecordStore,
        index: &dyn SimilarityIndex,
        artifacts: &ArtifactDir,
    ) -> Result<RunReport> {
        let records = store.all().await?;
        let checksum = record_set_checksum(&records);
        let pending = records.iter().filter(|r| r.is_pending()).count();
        let state = self.load_or_start(artifacts, checksum, pending).await?;

        let mut run = Run {
            curator: self,
            store,
            index,
            artifacts,
            state,
        };
        run.execute().await
    }

    async fn load_or_start(
        &self,
        artifacts: &ArtifactDir,
        checksum: String,
        pending: usize,
    ) -> Result<RunState> {
        let dry_run = self.config.run.dry_run;
        let saved = if dry_run || self.options.fresh {
            None
        } else {
            artifacts.load_state().await?
        };

        let mut state = match saved {
            Some(state) if state.is_finished() => {
                info!(run_id = state.run_id.as_str(), "Previous run finished, starting a new one");
                None
            }
            Some(state) if state.checksum == checksum => {
                info!(
                    run_id = state.run_id.as_str(),
                    phase = %state.phase,
                    round = state.round,
                    offset = state.batch.as_ref().map(|b| b.offset).unwrap_or(0),
                    "Resuming run"
                );
                Some(state)
            }
            Some(state) => {
                if self.config.run.confirm_stale_state && !self.options.assume_yes {
                    return Err(CuratorError::StaleState {
                        expected: state.checksum,
                        found: checksum,
                    }
                    .into());
                }
                warn!(
                    run_id = state.run_id.as_str(),
                    "Records changed since the saved run state, discarding it"
                );
                None
            }
            None => None,
        };

        match &mut state {
            Some(state) => {
                state.report.resumes += 1;
                state.outcome = None;
                state.report.outcome = None;
                state.report.finished_at = None;
            }
            None => {
                artifacts.reset().await?;
            }
        }
        let mut state = state.unwrap_or_else(|| {
            let mut fresh = RunState::new(checksum, self.config.rounds.max_rounds, DECISIONS_FILE, dry_run);
            fresh.report.pending_at_start = pending;
            fresh
        });
        state.max_rounds = self.config.rounds.max_rounds;
        Ok(state)
    }
}

/// One execution of the engine over a store, carrying the run state.
struct Run<'a> {
    curator: &'a Curator,
    store: &'a dyn RecordStore,
    index: &'a dyn SimilarityIndex,
    artifacts: &'a ArtifactDir,
    state: RunState,
}

impl Run<'_> {
    fn config(&self) -> &FileConfig {
        &self.curator.config
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config().oracle)
    }

    fn applier(&self) -> DecisionApplier<'_> {
        DecisionApplier::new(
            self.store,
            self.index,
            self.config().run.survivor,
            self.config().run.dry_run,
        )
    }

    async fn checkpoint(&mut self) -> Result<()> {
        let records = self.store.all().await?;
        self.state.checksum = record_set_checksum(&records);
        self.state.updated_at = Utc::now();
        self.artifacts.save_state(&self.state).await
    }

    async fn execute(&mut self) -> Result<RunReport> {
        info!(
            run_id = self.state.run_id.as_str(),
            dry_run = self.config().run.dry_run,
            phase = %self.state.phase,
            "Curation run starting"
        );
        self.ensure_outlines().await?;
        self.checkpoint().await?;

        let outcome = match self.phases().await? {
            Some(outcome) => outcome,
            None => self.rounds().await?,
        };

        self.state.finish(outcome);
        self.state.report.pending_at_end = self.store.count(RecordStatus::Pending).await?;
        self.artifacts.write_report(&self.state.report).await?;
        self.checkpoint().await?;

        info!("Curation run complete. {}", self.state.report);
        Ok(self.state.report.clone())
    }

    /// Atomicity pre-pass and auto-dedup. Returns an outcome only when the
    /// run cannot continue into the rounds.
    async fn phases(&mut self) -> Result<Option<RunOutcome>> {
        if self.state.phase == Phase::Atomicity {
            if self.config().run.atomicity_pass {
                self.atomicity().await?;
            }
            self.state.phase = Phase::AutoDedup;
            self.checkpoint().await?;
        }

        if self.state.phase == Phase::AutoDedup {
            let (candidates, live) = match self.candidates().await {
                Ok(built) => built,
                Err(e) => return Ok(Some(self.abort("candidate generation", &e))),
            };
            self.auto_dedup(&candidates).await?;

            let live = self.refresh_live(live).await?;
            match self.communities_from(&candidates, &live) {
                Ok(communities) => self.state.communities = Some(communities),
                Err(e) => return Ok(Some(self.abort("graph construction", &e))),
            }
            self.state.phase = Phase::Rounds;
            self.checkpoint().await?;
        }
        Ok(None)
    }

    async fn atomicity(&mut self) -> Result<()> {
        let config = self.config();
        let outcome = AtomicityPass::new(
            self.store,
            self.index,
            self.curator.oracle.as_ref(),
            self.policy(),
            config.oracle.workers,
        )
        .run()
        .await?;

        for entry in &outcome.provenance {
            self.artifacts.append_provenance(entry).await?;
        }
        let stats = &mut self.state.report.atomicity;
        stats.checked += outcome.stats.checked;
        stats.split += outcome.stats.split;
        stats.created += outcome.stats.created;
        stats.failed += outcome.stats.failed;
        for w in outcome.warnings {
            self.state.report.warn(w);
        }
        Ok(())
    }

    async fn auto_dedup(&mut self, candidates: &CandidateSet) -> Result<()> {
        let records: HashMap<RecordId, Record> = self
            .store
            .all()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let decisions = auto_dedup::plan(
            &candidates.edges,
            &records,
            self.config().thresholds.allow_cross_category,
        );
        self.state.report.auto_dedup.pairs = auto_dedup::auto_pairs(&candidates.edges);
        info!(
            pairs = self.state.report.auto_dedup.pairs,
            groups = decisions.len(),
            "Auto-dedup starting"
        );

        for decision in &decisions {
            let result = self.applier().apply(decision).await?;
            self.record_applied(&result).await?;
            self.state.report.auto_dedup.groups += 1;
            self.state.report.auto_dedup.superseded += result.effects.superseded.len();
            for w in result.warnings {
                self.state.report.warn(w);
            }
            self.checkpoint().await?;
        }
        info!("Auto-dedup complete. {}", self.state.report.auto_dedup);
        Ok(())
    }

    async fn rounds(&mut self) -> Result<RunOutcome> {
        let rounds_config = self.config().rounds.clone();
        let mut tracker = ConvergenceTracker::new(
            rounds_config.improvement_threshold,
            self.state.below_threshold_streak,
        );

        loop {
            if self.curator.stop.load(Ordering::SeqCst) {
                info!(round = self.state.round, "Stop requested, halting at round boundary");
                return Ok(RunOutcome::Stopped);
            }

            if self.state.batch.is_none() {
                if self.state.round > self.state.max_rounds {
                    info!(max_rounds = self.state.max_rounds, "Round cap reached");
                    return Ok(RunOutcome::MaxRoundsReached);
                }
                let round = self.state.round;
                let every = rounds_config.rebuild_every;
                let due = round > 1 && every > 0 && (round - 1) % every == 0;
                let rebuilt = due || self.state.communities.is_none();
                if rebuilt {
                    match self.rebuild().await {
                        Ok(communities) => self.state.communities = Some(communities),
                        Err(e) => return Ok(self.abort(&format!("round {round} rebuild"), &e)),
                    }
                }

                let statuses = self.statuses().await?;
                let communities = self.state.communities.as_deref().unwrap_or_default();
                let selection = rounds::select(communities, &self.state.reviewed, &statuses, &rounds_config);
                if selection.selected.is_empty() {
                    info!(round, "No eligible communities left");
                    return Ok(RunOutcome::Converged);
                }

                let mut report = RoundReport::new(round);
                report.selected = selection.selected.len();
                report.rebuilt = rebuilt && round > 1;
                if selection.skipped_oversized > 0 {
                    let msg = format!(
                        "{} oversized communities skipped (cap {})",
                        selection.skipped_oversized, rounds_config.oversized_cap
                    );
                    warn!("{msg}");
                    report.warnings.push(msg);
                }
                info!(
                    round,
                    selected = selection.selected.len(),
                    skipped_oversized = selection.skipped_oversized,
                    "Round selected"
                );

                self.state.batch = Some(RoundBatch {
                    round,
                    pending_before: statuses
                        .values()
                        .filter(|s| **s == RecordStatus::Pending)
                        .count(),
                    communities_before: rounds::open_community_count(communities, &statuses),
                    communities: selection.selected,
                    offset: 0,
                    report,
                });
                self.checkpoint().await?;
            }

            self.process_batch().await?;

            if let Step::Stop(outcome) = self.close_round(&mut tracker).await? {
                return Ok(outcome);
            }
        }
    }

    /// DECIDE concurrently, then APPLY one decision at a time, checkpointing
    /// after each so an interrupted round resumes at the next community.
    async fn process_batch(&mut self) -> Result<()> {
        let Some(batch) = &self.state.batch else {
            return Ok(());
        };
        let round = batch.round;
        let remaining: Vec<Community> = batch.remaining().to_vec();
        if remaining.is_empty() {
            return Ok(());
        }

        let records: HashMap<RecordId, Record> = self
            .store
            .all()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let decider = Decider {
            oracle: self.curator.oracle.as_ref(),
            policy: self.policy(),
            records: &records,
        };
        let decided: Vec<Decided> = stream::iter(remaining.iter())
            .map(|community| decider.decide(community, round))
            .buffered(self.config().oracle.workers.max(1))
            .collect()
            .await;

        for outcome in decided {
            let community_id = outcome.community_id().to_string();
            match outcome {
                Decided::Skipped { community_id, reason } => {
                    let msg = format!("community {community_id} skipped: {reason}");
                    warn!("{msg}");
                    if let Some(batch) = &mut self.state.batch {
                        batch.report.skipped += 1;
                        batch.report.warnings.push(msg);
                    }
                }
                Decided::Decision { decision, warnings } => {
                    let result = self.applier().apply(&decision).await?;
                    self.record_applied(&result).await?;
                    self.tally(&decision, result, warnings);
                }
            }
            self.state.advance_batch(&community_id);
            self.checkpoint().await?;
        }
        Ok(())
    }

    fn tally(&mut self, decision: &Decision, result: ApplyResult, warnings: Vec<String>) {
        if result.effects.review_queued {
            self.state.report.queue_review(decision);
        }
        if let Some(batch) = &mut self.state.batch {
            let report = &mut batch.report;
            report.count(decision.kind());
            report.retries += decision.retry_count;
            report.records_superseded += result.effects.superseded.len();
            report.records_created += result.effects.created.len();
            report.warnings.extend(warnings);
            report.warnings.extend(result.warnings);
        }
    }

    /// CHECK_CONVERGENCE: measure the round against its starting counts.
    async fn close_round(&mut self, tracker: &mut ConvergenceTracker) -> Result<Step> {
        let Some(mut batch) = self.state.batch.take() else {
            return Ok(Step::Continue);
        };
        let statuses = self.statuses().await?;
        let pending_after = statuses
            .values()
            .filter(|s| **s == RecordStatus::Pending)
            .count();
        let communities = self.state.communities.as_deref().unwrap_or_default();
        let communities_after = rounds::open_community_count(communities, &statuses);
        let unreviewed = rounds::unreviewed_count(communities, &self.state.reviewed, &statuses);
        let progress = RoundProgress::measure(
            batch.round,
            (batch.pending_before, pending_after),
            (batch.communities_before, communities_after),
        );
        let mut step = tracker.observe(progress.pending_delta, progress.community_delta);
        if step == Step::Stop(RunOutcome::ZeroProgress) && unreviewed == 0 {
            // Nothing left to decide; the next SELECT settles the run.
            step = Step::Continue;
        }

        info!(
            round = batch.round,
            pending = pending_after,
            communities = communities_after,
            unreviewed,
            pending_delta = progress.pending_delta,
            community_delta = progress.community_delta,
            decided = batch.report.decided(),
            "Round complete"
        );

        batch.report.progress = Some(progress);
        self.state.history.push(progress);
        self.state.report.rounds.push(batch.report);
        self.state.below_threshold_streak = tracker.streak();
        self.state.round += 1;
        self.checkpoint().await?;
        Ok(step)
    }

    async fn record_applied(&mut self, result: &ApplyResult) -> Result<()> {
        for entry in &result.provenance {
            self.artifacts.append_provenance(entry).await?;
        }
        if let Some(entry) = &result.entry {
            self.artifacts.append_decision(entry).await?;
        }
        Ok(())
    }

    fn abort(&mut self, stage: &str, error: &anyhow::Error) -> RunOutcome {
        let msg = format!("{stage} failed, round aborted with the store unchanged: {error:#}");
        warn!("{msg}");
        self.state.report.warn(msg);
        RunOutcome::Aborted
    }

    async fn statuses(&self) -> Result<HashMap<RecordId, RecordStatus>> {
        Ok(self
            .store
            .all()
            .await?
            .into_iter()
            .map(|r| (r.id, r.status))
            .collect())
    }

    /// Give every live record a structural outline so comparisons use it.
    async fn ensure_outlines(&self) -> Result<()> {
        let patches: Vec<(RecordId, Map<String, Value>)> = self
            .store
            .all()
            .await?
            .into_iter()
            .filter(|r| r.status != RecordStatus::Superseded && r.outline().is_none())
            .map(|r| {
                let mut patch = Map::new();
                patch.insert(meta::OUTLINE.into(), Value::String(structural_outline(&r)));
                (r.id, patch)
            })
            .collect();
        let patched = patches.len();
        self.store.patch_metadata_batch(patches).await?;
        if patched > 0 {
            info!(patched, "Generated structural outlines");
        }
        Ok(())
    }

    /// Candidate edges for the pending pool against approved anchors, plus
    /// the live records they were built from.
    async fn candidates(&mut self) -> Result<(CandidateSet, HashMap<RecordId, Record>)> {
        let records = self.store.all().await?;
        let (pending, anchors): (Vec<Record>, Vec<Record>) = records
            .into_iter()
            .filter(|r| r.status != RecordStatus::Superseded)
            .partition(Record::is_pending);

        let set = CandidateBuilder::new(self.index, self.config())
            .build(&pending, &anchors)
            .await?;
        if !set.failed.is_empty() {
            self.state.report.warn(format!(
                "neighbor search failed for {} records: {}",
                set.failed.len(),
                set.failed.join(", ")
            ));
        }
        let live = pending
            .into_iter()
            .chain(anchors)
            .map(|r| (r.id.clone(), r))
            .collect();
        Ok((set, live))
    }

    /// Drop records superseded since `live` was taken.
    async fn refresh_live(
        &self,
        mut live: HashMap<RecordId, Record>,
    ) -> Result<HashMap<RecordId, Record>> {
        for (id, status) in self.statuses().await? {
            if status == RecordStatus::Superseded {
                live.remove(&id);
            }
        }
        Ok(live)
    }

    fn communities_from(
        &self,
        candidates: &CandidateSet,
        live: &HashMap<RecordId, Record>,
    ) -> Result<Vec<Community>> {
        let graph = SimilarityGraph::build(&candidates.edges, live, &self.config().thresholds)?;
        Ok(detect_communities(&graph, self.config().rounds.oversized_cap))
    }

    async fn rebuild(&mut self) -> Result<Vec<Community>> {
        info!(round = self.state.round, "Rebuilding similarity graph and communities");
        let (candidates, live) = self.candidates().await?;
        self.communities_from(&candidates, &live)
    }
}
