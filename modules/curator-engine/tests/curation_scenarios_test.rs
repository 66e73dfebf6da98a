//! End-to-end curation runs over an in-memory store with a scripted oracle.

mod harness;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use curator_common::{meta, DecisionKind, ProvenanceKind, RecordId, RecordStatus};
use curator_engine::artifacts::{ArtifactDir, RunLock, REPORT_JSON, REPORT_MD, STATE_FILE};
use curator_engine::index::MemoryIndex;
use curator_engine::oracle::StubOracle;
use curator_engine::state::Phase;
use curator_engine::testing::{record, record_at, similar_pair, MockOracle};
use curator_engine::traits::{RecordStore, SimilarityIndex};
use curator_engine::RunOutcome;
use harness::{curator, status, test_config, Corpus, MERGE_AB, MERGE_CD, MERGE_EF};

const KEEP_SEPARATE: &str =
    r#"{"decision":"keep_separate","notes":"different root causes","confidence":0.7}"#;

// ---------------------------------------------------------------------------
// Merges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn high_pair_merges_into_the_older_record() {
    let corpus = Corpus::new().pair("a", "b", 0, 0.94);
    let store = corpus.store();
    // Synthesis keeps failing, so the merge falls back to a survivor.
    let oracle = Arc::new(
        MockOracle::new()
            .on_decide(&["a", "b"], [MERGE_AB])
            .on_synthesize(["no content today"]),
    );
    let out = tempfile::tempdir().unwrap();

    let report = curator(store.clone(), corpus.index(), oracle.clone(), test_config(), out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Converged));
    assert_eq!(oracle.decide_calls(), 1);
    assert_eq!(oracle.synthesis_calls(), 3);
    assert_eq!(status(&store, "a").await, RecordStatus::Pending);
    assert_eq!(status(&store, "b").await, RecordStatus::Superseded);

    let b = store.get("b").await.unwrap().unwrap();
    assert_eq!(b.metadata[meta::SUPERSEDED_BY], "a");

    let provenance = store.provenance().await;
    assert_eq!(provenance.len(), 1);
    assert_eq!(provenance[0].kind, ProvenanceKind::Merge);
    assert_eq!(provenance[0].sources, vec!["b".to_string()]);
    assert_eq!(provenance[0].results, vec!["a".to_string()]);
    assert!(provenance[0].reason.contains("same fix"));

    let artifacts = ArtifactDir::for_run(out.path(), false);
    assert_eq!(artifacts.provenance().await.unwrap(), provenance);
    assert_eq!(report.pending_at_start, 2);
    assert_eq!(report.pending_at_end, 1);
    assert_eq!(report.rounds[0].decisions.get("merge_all"), Some(&1));
    assert!(report.rounds[0]
        .warnings
        .iter()
        .any(|w| w.contains("keeping a survivor")));
}

#[tokio::test]
async fn pending_pair_merges_into_a_synthesized_record() {
    let corpus = Corpus::new().pair("a", "b", 0, 0.94);
    let store = corpus.store();
    let oracle = Arc::new(MockOracle::new().on_decide(&["a", "b"], [MERGE_AB]));
    let out = tempfile::tempdir().unwrap();

    curator(store.clone(), corpus.index(), oracle.clone(), test_config(), out.path())
        .run()
        .await
        .unwrap();

    let decisions = ArtifactDir::for_run(out.path(), false).decisions().await.unwrap();
    assert_eq!(decisions.len(), 1);
    let created = &decisions[0].effects.created;
    assert_eq!(created.len(), 1);

    let merged = store.get(&created[0]).await.unwrap().unwrap();
    assert_eq!(merged.status, RecordStatus::Pending);
    assert!(merged.title.contains("Title a") && merged.title.contains("Title b"));
    assert_eq!(merged.metadata[meta::DERIVED_FROM], serde_json::json!(["a", "b"]));
    assert!(merged.outline().is_some());

    assert_eq!(status(&store, "a").await, RecordStatus::Superseded);
    assert_eq!(status(&store, "b").await, RecordStatus::Superseded);
    let provenance = store.provenance().await;
    assert_eq!(provenance.len(), 1);
    assert_eq!(provenance[0].sources, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(provenance[0].results, created.clone());
}

#[tokio::test]
async fn auto_bucket_pairs_merge_without_the_oracle() {
    let corpus = Corpus::new()
        .pair("a", "b", 0, 0.99)
        .lone(record_at("z", 500));
    let store = corpus.store();
    let oracle = Arc::new(MockOracle::new());
    let out = tempfile::tempdir().unwrap();

    let report = curator(store.clone(), corpus.index(), oracle.clone(), test_config(), out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(oracle.decide_calls(), 0);
    assert_eq!(oracle.synthesis_calls(), 0);
    assert_eq!(status(&store, "a").await, RecordStatus::Pending);
    assert_eq!(status(&store, "b").await, RecordStatus::Superseded);
    assert_eq!(status(&store, "z").await, RecordStatus::Pending);
    assert_eq!(report.auto_dedup.groups, 1);
    assert_eq!(report.auto_dedup.superseded, 1);
    assert_eq!(report.outcome, Some(RunOutcome::Converged));

    let provenance = store.provenance().await;
    assert_eq!(provenance.len(), 1);
    assert!(provenance[0].reason.contains("auto-dedup"));
}

// ---------------------------------------------------------------------------
// Oracle failures and human review
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_responses_are_retried_before_keep_separate() {
    let corpus = Corpus::new().pair("a", "b", 0, 0.92);
    let store = corpus.store();
    let oracle = Arc::new(MockOracle::new().on_decide(
        &["a", "b"],
        ["I think they match", r#"{"decision":"maybe"}"#, KEEP_SEPARATE],
    ));
    let out = tempfile::tempdir().unwrap();

    let report = curator(store.clone(), corpus.index(), oracle.clone(), test_config(), out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(oracle.decide_calls(), 3);
    let decisions = ArtifactDir::for_run(out.path(), false).decisions().await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].decision.kind(), DecisionKind::KeepSeparate);
    assert_eq!(decisions[0].decision.retry_count, 2);
    assert_eq!(report.rounds[0].retries, 2);

    assert_eq!(status(&store, "a").await, RecordStatus::Pending);
    assert_eq!(status(&store, "b").await, RecordStatus::Pending);
    let a = store.get("a").await.unwrap().unwrap();
    assert!(a.metadata.contains_key(meta::CURATION_NOTES));
    assert_eq!(report.outcome, Some(RunOutcome::Converged));
}

#[tokio::test]
async fn stub_oracle_sends_communities_to_manual_review() {
    let corpus = Corpus::new().pair("a", "b", 0, 0.92);
    let store = corpus.store();
    let out = tempfile::tempdir().unwrap();

    let report = curator(
        store.clone(),
        corpus.index(),
        Arc::new(StubOracle),
        test_config(),
        out.path(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.review_queue.len(), 1);
    let mut members = report.review_queue[0].members.clone();
    members.sort();
    assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

    let a = store.get("a").await.unwrap().unwrap();
    assert!(a.meta_flag(meta::NEEDS_REVIEW));
    assert_eq!(a.status, RecordStatus::Pending);

    let artifacts = ArtifactDir::for_run(out.path(), false);
    let markdown = tokio::fs::read_to_string(artifacts.path(REPORT_MD)).await.unwrap();
    assert!(markdown.contains("## Manual review queue"));
    assert!(markdown.contains(&report.review_queue[0].community_id));
    assert!(artifacts.path(REPORT_JSON).exists());
}

// ---------------------------------------------------------------------------
// Atomicity pre-pass
// ---------------------------------------------------------------------------

#[tokio::test]
async fn compound_records_are_split_before_dedup() {
    let corpus = Corpus::new().lone(record_at("m", 0));
    let store = corpus.store();
    let oracle = Arc::new(MockOracle::new().on_atomicity(
        "m",
        [r#"{"atomic":false,"parts":[
            {"title":"Raise the pool size","body":"Set max connections to 50."},
            {"title":"Rotate the logs","body":"Enable daily log rotation."}
        ]}"#],
    ));
    let mut config = test_config();
    config.run.atomicity_pass = true;
    let out = tempfile::tempdir().unwrap();

    let report = curator(store.clone(), corpus.index(), oracle.clone(), config, out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(oracle.atomicity_calls(), 1);
    assert_eq!(report.atomicity.split, 1);
    assert_eq!(report.atomicity.created, 2);
    assert_eq!(status(&store, "m").await, RecordStatus::Superseded);

    let provenance = ArtifactDir::for_run(out.path(), false)
        .provenance()
        .await
        .unwrap();
    assert_eq!(provenance.len(), 1);
    assert_eq!(provenance[0].kind, ProvenanceKind::Split);
    assert_eq!(provenance[0].sources, vec!["m".to_string()]);
    assert_eq!(provenance[0].results.len(), 2);
    for part in &provenance[0].results {
        let record = store.get(part).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert!(record.meta_flag(meta::ATOMICITY_CHECKED));
    }
}

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn round_cap_stops_a_run_with_work_left() {
    let corpus = Corpus::new()
        .pair("a", "b", 0, 0.93)
        .pair("c", "d", 2, 0.93);
    let store = corpus.store();
    let oracle = Arc::new(
        MockOracle::new()
            .on_decide(&["a", "b"], [MERGE_AB])
            .on_decide(&["c", "d"], [MERGE_CD]),
    );
    let mut config = test_config();
    config.rounds.batch_size = 1;
    config.rounds.max_rounds = 1;
    let out = tempfile::tempdir().unwrap();

    let report = curator(store, corpus.index(), oracle.clone(), config, out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::MaxRoundsReached));
    assert_eq!(report.rounds.len(), 1);
    assert_eq!(oracle.decide_calls(), 1);
}

#[tokio::test]
async fn small_batches_keep_going_until_every_community_is_reviewed() {
    let corpus = Corpus::new()
        .pair("a", "b", 0, 0.93)
        .pair("c", "d", 2, 0.93)
        .pair("e", "f", 4, 0.93);
    let oracle = Arc::new(
        MockOracle::new()
            .on_decide(&["a", "b"], [MERGE_AB])
            .on_decide(&["c", "d"], [MERGE_CD])
            .on_decide(&["e", "f"], [MERGE_EF]),
    );
    let mut config = test_config();
    config.rounds.batch_size = 1;
    let out = tempfile::tempdir().unwrap();

    let report = curator(corpus.store(), corpus.index(), oracle.clone(), config, out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Converged));
    assert_eq!(report.rounds.len(), 3);
    assert_eq!(oracle.decide_calls(), 3);
    let progress = report.rounds[0].progress.unwrap();
    assert_eq!(progress.communities_before, 3);
    assert_eq!(progress.communities_after, 2);
    assert_eq!(progress.pending_before, 6);
    assert_eq!(progress.pending_after, 5);
}

#[tokio::test]
async fn round_that_changes_nothing_stops_with_zero_progress() {
    let corpus = Corpus::new()
        .pair("a", "b", 0, 0.93)
        .pair("c", "d", 2, 0.93);
    let store = corpus.store();
    let oracle = Arc::new(MockOracle::new());
    let mut config = test_config();
    config.rounds.batch_size = 1;
    let out = tempfile::tempdir().unwrap();

    let report = curator(store.clone(), corpus.index(), oracle.clone(), config, out.path())
        .run()
        .await
        .unwrap();

    // One community is still unreviewed, but keep-separate moved nothing.
    assert_eq!(report.outcome, Some(RunOutcome::ZeroProgress));
    assert_eq!(report.rounds.len(), 1);
    assert_eq!(oracle.decide_calls(), 1);
    let progress = report.rounds[0].progress.unwrap();
    assert_eq!(progress.pending_delta, 0.0);
    assert_eq!(progress.community_delta, 0.0);
    assert_eq!(progress.communities_before, 2);
    assert_eq!(progress.communities_after, 2);

    let saved = ArtifactDir::for_run(out.path(), false)
        .load_state()
        .await
        .unwrap()
        .unwrap();
    assert!(saved.is_finished());
    for id in ["a", "b", "c", "d"] {
        assert_eq!(status(&store, id).await, RecordStatus::Pending);
    }
}

// ---------------------------------------------------------------------------
// Graph rebuilds
// ---------------------------------------------------------------------------

const MERGED_CONTENT: &str = r#"{"title":"Merged fix","body":"Merged body."}"#;

/// `a`/`b` merge into a record that only `c` resembles, so the new pair
/// exists only in a rebuilt graph.
fn rebuild_corpus() -> Corpus {
    let (merged_vector, c_vector) = similar_pair(5, 0.93);
    Corpus::new()
        .pair("a", "b", 0, 0.93)
        .with_vector(record_at("c", 500), c_vector)
        .expect_content(record("merged", "infra", "Merged fix", "Merged body."), merged_vector)
}

fn rebuild_oracle() -> Arc<MockOracle> {
    Arc::new(
        MockOracle::new()
            .on_decide(&["a", "b"], [MERGE_AB])
            .on_synthesize([MERGED_CONTENT]),
    )
}

#[tokio::test]
async fn merged_record_is_reviewed_after_the_next_rebuild() {
    let corpus = rebuild_corpus();
    let store = corpus.store();
    let oracle = rebuild_oracle();
    let mut config = test_config();
    config.rounds.rebuild_every = 1;
    let out = tempfile::tempdir().unwrap();

    let report = curator(store.clone(), corpus.index(), oracle.clone(), config, out.path())
        .run()
        .await
        .unwrap();

    let decisions = ArtifactDir::for_run(out.path(), false).decisions().await.unwrap();
    let merged = decisions[0].effects.created[0].clone();
    assert_eq!(status(&store, &merged).await, RecordStatus::Pending);

    assert_eq!(report.outcome, Some(RunOutcome::Converged));
    assert_eq!(report.rounds.len(), 2);
    assert!(!report.rounds[0].rebuilt);
    assert!(report.rounds[1].rebuilt);
    assert_eq!(oracle.decide_calls(), 2);
    assert!(oracle.was_asked_about(&["c", merged.as_str()]));
}

#[tokio::test]
async fn without_rebuilds_the_new_pair_waits_for_the_next_run() {
    let corpus = rebuild_corpus();
    let oracle = rebuild_oracle();
    let mut config = test_config();
    config.rounds.rebuild_every = 0;
    let out = tempfile::tempdir().unwrap();

    let report = curator(corpus.store(), corpus.index(), oracle.clone(), config, out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Converged));
    assert_eq!(report.rounds.len(), 1);
    assert_eq!(oracle.decide_calls(), 1);
    assert!(oracle.decided().iter().all(|m| !m.contains(&"c".to_string())));
}

// ---------------------------------------------------------------------------
// Structural failures
// ---------------------------------------------------------------------------

/// Index whose membership checks fail while `armed`, which breaks candidate
/// generation before any edge is built.
struct FailingIndex {
    inner: Arc<MemoryIndex>,
    armed: AtomicBool,
}

#[async_trait]
impl SimilarityIndex for FailingIndex {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed(text).await
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<(RecordId, f64)>> {
        self.inner.search(vector, k).await
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f64>> {
        self.inner.rerank(query, candidates).await
    }

    async fn upsert(&self, id: &str, text: &str) -> Result<()> {
        self.inner.upsert(id, text).await
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        if self.armed.load(Ordering::SeqCst) {
            bail!("index offline while looking up {id}");
        }
        self.inner.contains(id).await
    }
}

#[tokio::test]
async fn index_failure_aborts_with_the_store_unchanged_and_resumes() {
    let corpus = Corpus::new()
        .pair("a", "b", 0, 0.99)
        .pair("c", "d", 2, 0.93);
    let store = corpus.store();
    let index = Arc::new(FailingIndex {
        inner: corpus.index(),
        armed: AtomicBool::new(true),
    });
    let oracle = Arc::new(MockOracle::new().on_decide(&["c", "d"], [MERGE_CD]));
    let out = tempfile::tempdir().unwrap();

    let report = curator(store.clone(), index.clone(), oracle.clone(), test_config(), out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Aborted));
    assert!(report.rounds.is_empty());
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("candidate generation failed") && w.contains("index offline")));
    assert_eq!(oracle.decide_calls(), 0);
    for id in ["a", "b", "c", "d"] {
        assert_eq!(status(&store, id).await, RecordStatus::Pending);
    }
    assert!(store.decisions().await.is_empty());
    assert!(store.provenance().await.is_empty());

    let artifacts = ArtifactDir::for_run(out.path(), false);
    let saved = artifacts.load_state().await.unwrap().unwrap();
    assert_eq!(saved.phase, Phase::AutoDedup);
    assert!(!saved.is_finished());
    assert!(artifacts.path(REPORT_JSON).exists());

    index.armed.store(false, Ordering::SeqCst);
    let report = curator(store.clone(), index, oracle.clone(), test_config(), out.path())
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Converged));
    assert_eq!(report.resumes, 1);
    assert_eq!(report.run_id, saved.run_id);
    assert_eq!(report.auto_dedup.superseded, 1);
    assert_eq!(oracle.decide_calls(), 1);
    assert_eq!(status(&store, "b").await, RecordStatus::Superseded);
    assert_eq!(status(&store, "c").await, RecordStatus::Superseded);
}

#[tokio::test]
async fn invalid_config_fails_before_touching_the_store() {
    let corpus = Corpus::new().pair("a", "b", 0, 0.93);
    let store = corpus.store();
    let oracle = Arc::new(MockOracle::new());
    let mut config = test_config();
    config.thresholds.auto = 0.5;
    config.rounds.batch_size = 0;
    let out = tempfile::tempdir().unwrap();

    let err = curator(store.clone(), corpus.index(), oracle.clone(), config, out.path())
        .run()
        .await
        .unwrap_err();

    assert!(err.to_string().contains("thresholds.auto"));
    assert_eq!(oracle.decide_calls(), 0);
    for id in ["a", "b"] {
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert!(record.metadata.is_empty());
    }
    assert!(!ArtifactDir::for_run(out.path(), false).path(STATE_FILE).exists());
}

#[tokio::test]
async fn locked_run_directory_is_refused() {
    let corpus = Corpus::new().pair("a", "b", 0, 0.93);
    let out = tempfile::tempdir().unwrap();
    let lock = RunLock::acquire(out.path()).await.unwrap().unwrap();

    let err = curator(
        corpus.store(),
        corpus.index(),
        Arc::new(MockOracle::new()),
        test_config(),
        out.path(),
    )
    .run()
    .await
    .unwrap_err();
    assert!(err.to_string().contains("locked"));

    lock.release().await.unwrap();
}
