//! A dry run decides everything a live run would, logs it under `dry-run/`,
//! and leaves the store untouched.

mod harness;

use std::sync::Arc;

use curator_common::{DecisionLogEntry, RecordStatus};
use curator_engine::artifacts::{ArtifactDir, STATE_FILE};
use curator_engine::testing::MockOracle;
use curator_engine::traits::{RecordStore, SimilarityIndex};
use harness::{curator, test_config, Corpus, MERGE_AB, MERGE_CD};

fn corpus() -> Corpus {
    Corpus::new()
        .pair("a", "b", 0, 0.93)
        .pair("c", "d", 2, 0.91)
        .pair("e", "f", 4, 0.99)
}

fn oracle() -> Arc<MockOracle> {
    Arc::new(
        MockOracle::new()
            .on_decide(&["a", "b"], [MERGE_AB])
            .on_decide(&["c", "d"], [MERGE_CD]),
    )
}

type Summary = (String, String, Vec<String>, Vec<String>);

fn summarize(entries: &[DecisionLogEntry]) -> Vec<Summary> {
    let mut out: Vec<Summary> = entries
        .iter()
        .map(|e| {
            (
                e.decision.id.clone(),
                e.decision.kind().to_string(),
                e.effects.superseded.clone(),
                e.effects.created.clone(),
            )
        })
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn dry_run_leaves_the_store_untouched() {
    let corpus = corpus();
    let store = corpus.store();
    let mut config = test_config();
    config.run.dry_run = true;
    let out = tempfile::tempdir().unwrap();
    let index = corpus.index();

    let report = curator(store.clone(), index.clone(), oracle(), config, out.path())
        .run()
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.auto_dedup.superseded, 1);
    assert!(report.total_superseded() >= 5);

    let records = store.all().await.unwrap();
    assert_eq!(records.len(), corpus.records.len());
    for record in &records {
        assert_eq!(record.status, RecordStatus::Pending);
        assert!(record.metadata.is_empty(), "{} was patched", record.id);
    }
    assert!(store.decisions().await.is_empty());
    assert!(store.provenance().await.is_empty());

    let dry = ArtifactDir::for_run(out.path(), true);
    let logged = dry.decisions().await.unwrap();
    assert_eq!(logged.len(), 3);
    assert!(logged.iter().all(|e| e.dry_run));
    assert_eq!(dry.provenance().await.unwrap().len(), 3);
    assert!(index.is_empty().await, "dry run wrote to the shared index");
    let created: Vec<String> = logged.iter().flat_map(|e| e.effects.created.clone()).collect();
    assert!(!created.is_empty());
    for id in &created {
        assert!(!index.contains(id).await.unwrap());
    }
    assert!(dry.path(STATE_FILE).exists());
    assert!(!ArtifactDir::for_run(out.path(), false).path(STATE_FILE).exists());
}

#[tokio::test]
async fn dry_run_predicts_the_live_run() {
    let corpus = corpus();
    let mut dry_config = test_config();
    dry_config.run.dry_run = true;
    let dry_out = tempfile::tempdir().unwrap();
    curator(corpus.store(), corpus.index(), oracle(), dry_config, dry_out.path())
        .run()
        .await
        .unwrap();

    let live_store = corpus.store();
    let live_out = tempfile::tempdir().unwrap();
    curator(live_store.clone(), corpus.index(), oracle(), test_config(), live_out.path())
        .run()
        .await
        .unwrap();

    let predicted = ArtifactDir::for_run(dry_out.path(), true)
        .decisions()
        .await
        .unwrap();
    let applied = ArtifactDir::for_run(live_out.path(), false)
        .decisions()
        .await
        .unwrap();
    assert_eq!(summarize(&predicted), summarize(&applied));
    assert_eq!(summarize(&applied), summarize(&live_store.decisions().await));
}

#[tokio::test]
async fn repeated_dry_runs_start_over() {
    let corpus = corpus();
    let store = corpus.store();
    let mut config = test_config();
    config.run.dry_run = true;
    let out = tempfile::tempdir().unwrap();

    let first = curator(store.clone(), corpus.index(), oracle(), config.clone(), out.path())
        .run()
        .await
        .unwrap();
    let second = curator(store, corpus.index(), oracle(), config, out.path())
        .run()
        .await
        .unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.resumes, 0);
    let logged = ArtifactDir::for_run(out.path(), true)
        .decisions()
        .await
        .unwrap();
    assert_eq!(logged.len(), 3);
}
