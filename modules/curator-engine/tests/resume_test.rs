//! Interrupted runs resume from the saved state without re-deciding or
//! re-applying anything.

mod harness;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use curator_common::{DecisionLogEntry, ProvenanceRecord, Record, RecordStatus};
use curator_engine::artifacts::ArtifactDir;
use curator_engine::state::Phase;
use curator_engine::store::MemoryStore;
use curator_engine::testing::MockOracle;
use curator_engine::traits::RecordStore;
use curator_engine::{RunOutcome, RunReport};
use harness::{curator, test_config, Corpus, MERGE_AB, MERGE_CD, MERGE_EF};

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

/// Store that starts failing reads once one decision has been logged, so the
/// engine dies between two APPLY steps.
struct FailingStore {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
    decisions: AtomicUsize,
}

impl FailingStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            decisions: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn all(&self) -> Result<Vec<Record>> {
        self.inner.all().await
    }

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        if self.armed.load(Ordering::SeqCst) && self.decisions.load(Ordering::SeqCst) >= 1 {
            bail!("store unavailable while reading {id}");
        }
        self.inner.get(id).await
    }

    async fn create(&self, record: Record) -> Result<()> {
        self.inner.create(record).await
    }

    async fn update_status(&self, id: &str, status: RecordStatus) -> Result<bool> {
        self.inner.update_status(id, status).await
    }

    async fn patch_metadata(&self, id: &str, patch: Map<String, Value>) -> Result<()> {
        self.inner.patch_metadata(id, patch).await
    }

    async fn append_provenance(&self, entry: ProvenanceRecord) -> Result<()> {
        self.inner.append_provenance(entry).await
    }

    async fn provenance_for(&self, decision_id: &str) -> Result<Vec<ProvenanceRecord>> {
        self.inner.provenance_for(decision_id).await
    }

    async fn append_decision(&self, entry: DecisionLogEntry) -> Result<()> {
        self.inner.append_decision(entry).await?;
        self.decisions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn decision_applied(&self, decision_id: &str) -> Result<bool> {
        self.inner.decision_applied(decision_id).await
    }
}

fn two_pairs() -> Corpus {
    Corpus::new()
        .pair("a", "b", 0, 0.93)
        .pair("c", "d", 2, 0.93)
}

fn merging_oracle() -> Arc<MockOracle> {
    Arc::new(
        MockOracle::new()
            .on_decide(&["a", "b"], [MERGE_AB])
            .on_decide(&["c", "d"], [MERGE_CD]),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crash_mid_round_resumes_at_the_next_community() {
    let corpus = two_pairs();
    let inner = corpus.store();
    let failing = Arc::new(FailingStore::new(inner.clone()));
    let index = corpus.index();
    let oracle = merging_oracle();
    let out = tempfile::tempdir().unwrap();

    let err = curator(failing.clone(), index.clone(), oracle.clone(), test_config(), out.path())
        .run()
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("store unavailable"));

    let artifacts = ArtifactDir::for_run(out.path(), false);
    let saved = artifacts.load_state().await.unwrap().unwrap();
    assert_eq!(saved.phase, Phase::Rounds);
    let batch = saved.batch.as_ref().unwrap();
    assert_eq!(batch.offset, 1);
    assert_eq!(batch.communities.len(), 2);
    assert_eq!(inner.decisions().await.len(), 1);

    let applied = artifacts.decisions().await.unwrap();
    assert_eq!(applied.len(), 1);
    let mut first_members: Vec<String> = applied[0]
        .decision
        .groups
        .iter()
        .flat_map(|g| g.members.clone())
        .collect();
    first_members.sort();

    failing.armed.store(false, Ordering::SeqCst);
    let report = curator(failing.clone(), index, oracle.clone(), test_config(), out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Converged));
    assert_eq!(report.resumes, 1);
    assert_eq!(report.run_id, saved.run_id);

    // Both communities were decided in the first run; only the unapplied one
    // is asked about again.
    assert_eq!(oracle.decide_calls(), 3);
    let asked_first = oracle
        .decided()
        .iter()
        .filter(|m| **m == first_members)
        .count();
    assert_eq!(asked_first, 1);

    for id in ["a", "b", "c", "d"] {
        assert_eq!(inner.status_of(id).await, Some(RecordStatus::Superseded));
    }

    let provenance = artifacts.provenance().await.unwrap();
    assert_eq!(provenance.len(), 2);
    assert_ne!(provenance[0].decision_id, provenance[1].decision_id);
    assert_eq!(inner.provenance().await.len(), 2);
    assert_eq!(artifacts.decisions().await.unwrap().len(), 2);
}

#[tokio::test]
async fn resumed_round_measures_progress_like_an_uninterrupted_one() {
    let corpus = two_pairs().pair("e", "f", 4, 0.93);
    let oracle = || {
        Arc::new(
            MockOracle::new()
                .on_decide(&["a", "b"], [MERGE_AB])
                .on_decide(&["c", "d"], [MERGE_CD])
                .on_decide(&["e", "f"], [MERGE_EF]),
        )
    };
    let mut config = test_config();
    config.rounds.batch_size = 2;
    config.rounds.rebuild_every = 0;

    let baseline_out = tempfile::tempdir().unwrap();
    let baseline = curator(
        corpus.store(),
        corpus.index(),
        oracle(),
        config.clone(),
        baseline_out.path(),
    )
    .run()
    .await
    .unwrap();

    let failing = Arc::new(FailingStore::new(corpus.store()));
    let index = corpus.index();
    let out = tempfile::tempdir().unwrap();
    curator(failing.clone(), index.clone(), oracle(), config.clone(), out.path())
        .run()
        .await
        .unwrap_err();
    failing.armed.store(false, Ordering::SeqCst);
    let resumed = curator(failing, index, oracle(), config, out.path())
        .run()
        .await
        .unwrap();

    let progress = |report: &RunReport| -> Vec<_> {
        report.rounds.iter().map(|r| r.progress).collect()
    };
    assert_eq!(resumed.resumes, 1);
    assert_eq!(resumed.outcome, baseline.outcome);
    assert_eq!(progress(&resumed), progress(&baseline));
    let first = resumed.rounds[0].progress.unwrap();
    assert_eq!((first.communities_before, first.communities_after), (3, 1));
}

#[tokio::test]
async fn resume_between_rounds_reuses_the_saved_communities() {
    let corpus = two_pairs();
    let store = corpus.store();
    let index = corpus.index();
    let oracle = merging_oracle();
    let mut config = test_config();
    config.rounds.batch_size = 1;
    config.rounds.max_rounds = 1;
    let out = tempfile::tempdir().unwrap();

    curator(store.clone(), index.clone(), oracle.clone(), config.clone(), out.path())
        .run()
        .await
        .unwrap();
    let artifacts = ArtifactDir::for_run(out.path(), false);
    let mut saved = artifacts.load_state().await.unwrap().unwrap();
    let communities = saved.communities.clone().unwrap();
    assert_eq!(communities.len(), 2);

    // Reopen the finished run as if it had been stopped after round 1.
    saved.phase = Phase::Rounds;
    saved.outcome = None;
    saved.max_rounds = 2;
    artifacts.save_state(&saved).await.unwrap();
    config.rounds.max_rounds = 2;

    let report = curator(store, index, oracle.clone(), config, out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(report.resumes, 1);
    assert_eq!(report.rounds.len(), 2);
    assert!(!report.rounds[1].rebuilt);
    let second = report.rounds[1].progress.unwrap();
    assert_eq!((second.communities_before, second.communities_after), (1, 0));
    assert_eq!(oracle.decide_calls(), 2);
    let resumed = artifacts.load_state().await.unwrap().unwrap();
    assert_eq!(resumed.communities, Some(communities));
}

#[tokio::test]
async fn stop_request_halts_at_a_round_boundary_and_resumes() {
    let corpus = two_pairs();
    let store = corpus.store();
    let index = corpus.index();
    let oracle = merging_oracle();
    let out = tempfile::tempdir().unwrap();

    let first = curator(store.clone(), index.clone(), oracle.clone(), test_config(), out.path());
    first.stop_handle().store(true, Ordering::SeqCst);
    let report = first.run().await.unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Stopped));
    assert!(report.rounds.is_empty());
    assert_eq!(oracle.decide_calls(), 0);

    let artifacts = ArtifactDir::for_run(out.path(), false);
    let saved = artifacts.load_state().await.unwrap().unwrap();
    assert!(!saved.is_finished());

    let report = curator(store.clone(), index, oracle.clone(), test_config(), out.path())
        .run()
        .await
        .unwrap();
    assert_eq!(report.outcome, Some(RunOutcome::Converged));
    assert_eq!(report.resumes, 1);
    assert_eq!(report.run_id, saved.run_id);
    assert_eq!(oracle.decide_calls(), 2);
}

#[tokio::test]
async fn rerun_after_finish_starts_fresh_and_skips_applied_decisions() {
    let corpus = Corpus::new().pair("a", "b", 0, 0.93);
    let store = corpus.store();
    let index = corpus.index();
    let out = tempfile::tempdir().unwrap();

    let first = curator(
        store.clone(),
        index.clone(),
        Arc::new(MockOracle::new()),
        test_config(),
        out.path(),
    )
    .run()
    .await
    .unwrap();

    let second = curator(
        store.clone(),
        index,
        Arc::new(MockOracle::new()),
        test_config(),
        out.path(),
    )
    .run()
    .await
    .unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.resumes, 0);
    // Still pending, so the pair is reviewed again, but the verdict for the
    // same community and round is already in the store's log.
    assert_eq!(second.rounds.len(), 1);
    assert_eq!(store.decisions().await.len(), 1);
    let logged = ArtifactDir::for_run(out.path(), false)
        .decisions()
        .await
        .unwrap();
    assert!(logged.is_empty());
}

#[tokio::test]
async fn changed_records_require_confirmation_when_configured() {
    let corpus = two_pairs();
    let store = corpus.store();
    let index = corpus.index();
    let oracle = merging_oracle();
    let out = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.run.confirm_stale_state = true;

    let first = curator(store.clone(), index.clone(), oracle.clone(), config.clone(), out.path());
    first.stop_handle().store(true, Ordering::SeqCst);
    first.run().await.unwrap();

    store
        .create(curator_engine::testing::record_at("late", 900))
        .await
        .unwrap();

    let err = curator(store.clone(), index.clone(), oracle.clone(), config.clone(), out.path())
        .run()
        .await
        .unwrap_err();
    assert!(err.to_string().to_lowercase().contains("stale"));

    let report = curator(store, index, oracle, config, out.path())
        .with_options(curator_engine::RunOptions {
            fresh: false,
            assume_yes: true,
        })
        .run()
        .await
        .unwrap();
    assert_eq!(report.resumes, 0);
    assert_eq!(report.outcome, Some(RunOutcome::Converged));
}
