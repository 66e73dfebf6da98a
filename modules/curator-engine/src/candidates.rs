use std::collections::{HashMap, HashSet};
use std::fmt;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use curator_common::{CandidateEdge, FileConfig, Record, RecordId, ScoreBucket, ThresholdsConfig};

use crate::traits::SimilarityIndex;

/// Classify a similarity score into its bucket.
pub fn bucket_for(score: f64, thresholds: &ThresholdsConfig) -> ScoreBucket {
    if score >= thresholds.auto {
        ScoreBucket::Auto
    } else if score >= thresholds.high {
        ScoreBucket::High
    } else if score >= thresholds.medium {
        ScoreBucket::Medium
    } else {
        ScoreBucket::Ignored
    }
}

/// Bucketed, deduplicated candidate edges. Ignored pairs are never kept.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub edges: Vec<CandidateEdge>,
    /// Pending records whose neighbor query failed.
    pub failed: Vec<RecordId>,
}

impl CandidateSet {
    pub fn bucket(&self, bucket: ScoreBucket) -> impl Iterator<Item = &CandidateEdge> {
        self.edges.iter().filter(move |e| e.bucket == bucket)
    }

    pub fn count(&self, bucket: ScoreBucket) -> usize {
        self.bucket(bucket).count()
    }
}

impl fmt::Display for CandidateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} candidate edges (auto={}, high={}, medium={})",
            self.edges.len(),
            self.count(ScoreBucket::Auto),
            self.count(ScoreBucket::High),
            self.count(ScoreBucket::Medium)
        )
    }
}

/// Queries the similarity index for every pending record and turns the
/// neighbor lists into scored, bucketed edges. Never mutates records.
pub struct CandidateBuilder<'a> {
    index: &'a dyn SimilarityIndex,
    config: &'a FileConfig,
}

impl<'a> CandidateBuilder<'a> {
    pub fn new(index: &'a dyn SimilarityIndex, config: &'a FileConfig) -> Self {
        Self { index, config }
    }

    /// Make sure every record in the pool has a vector in the index.
    pub async fn ensure_indexed(&self, pool: &[&Record]) -> Result<usize> {
        let mut added = 0;
        for record in pool {
            if !self.index.contains(&record.id).await? {
                self.index
                    .upsert(&record.id, &record.comparison_text())
                    .await?;
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "Indexed records missing from the similarity index");
        }
        Ok(added)
    }

    /// Build candidate edges for `pending`, comparing against `pending` and
    /// the `anchors` (approved records used only as comparison targets).
    pub async fn build(&self, pending: &[Record], anchors: &[Record]) -> Result<CandidateSet> {
        let pool: Vec<&Record> = pending.iter().chain(anchors.iter()).collect();
        self.ensure_indexed(&pool).await?;

        let k = self.config.effective_top_k(pool.len());
        if k == 0 || pending.is_empty() {
            return Ok(CandidateSet::default());
        }

        let by_id: HashMap<&str, &Record> = pool.iter().map(|r| (r.id.as_str(), *r)).collect();
        let workers = self.config.oracle.workers.max(1);

        let results: Vec<(RecordId, Result<Vec<(RecordId, f64)>>)> = stream::iter(pending.iter())
            .map(|record| {
                let by_id = &by_id;
                async move {
                    let hits = self.neighbors(record, by_id, k).await;
                    (record.id.clone(), hits)
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut best: HashMap<(RecordId, RecordId), f64> = HashMap::new();
        let mut failed = Vec::new();
        for (id, hits) in results {
            match hits {
                Ok(hits) => {
                    for (neighbor, score) in hits {
                        let key = if id < neighbor {
                            (id.clone(), neighbor)
                        } else {
                            (neighbor, id.clone())
                        };
                        let entry = best.entry(key).or_insert(score);
                        if score > *entry {
                            *entry = score;
                        }
                    }
                }
                Err(e) => {
                    warn!(id = id.as_str(), error = %e, "Neighbor query failed");
                    failed.push(id);
                }
            }
        }

        let thresholds = &self.config.thresholds;
        let mut edges: Vec<CandidateEdge> = best
            .into_iter()
            .filter_map(|((a, b), score)| {
                let bucket = bucket_for(score, thresholds);
                if bucket == ScoreBucket::Ignored {
                    return None;
                }
                let (ra, rb) = (by_id.get(a.as_str())?, by_id.get(b.as_str())?);
                let category = (ra.category == rb.category).then(|| ra.category.clone());
                CandidateEdge::new(&a, &b, score, category, bucket)
            })
            .collect();
        edges.sort_by(|x, y| {
            y.score
                .partial_cmp(&x.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| x.key().cmp(&y.key()))
        });
        failed.sort();

        let set = CandidateSet { edges, failed };
        info!(pending = pending.len(), anchors = anchors.len(), k, "{set}");
        Ok(set)
    }

    /// Top-k pool neighbors of one record, optionally rescored by the reranker.
    async fn neighbors(
        &self,
        record: &Record,
        pool: &HashMap<&str, &Record>,
        k: usize,
    ) -> Result<Vec<(RecordId, f64)>> {
        let query = record.comparison_text();
        let vector = self.index.embed(&query).await?;
        // The index may hold records outside the pool (superseded, other
        // categories), so over-fetch before filtering down to k.
        let raw = self.index.search(&vector, k * 2 + 1).await?;

        let mut seen = HashSet::new();
        let mut hits: Vec<(RecordId, f64)> = raw
            .into_iter()
            .filter(|(id, _)| id != &record.id && pool.contains_key(id.as_str()))
            .filter(|(id, _)| seen.insert(id.clone()))
            .take(k)
            .collect();

        if self.config.index.rerank && !hits.is_empty() {
            let documents: Vec<String> = hits
                .iter()
                .filter_map(|(id, _)| pool.get(id.as_str()).map(|r| r.comparison_text()))
                .collect();
            if documents.len() == hits.len() {
                let reranked = self.index.rerank(&query, &documents).await?;
                for ((_, score), rerank) in hits.iter_mut().zip(reranked) {
                    *score = (*score + rerank.clamp(0.0, 1.0)) / 2.0;
                }
            }
        }

        debug!(id = record.id.as_str(), hits = hits.len(), "Neighbors found");
        Ok(hits)
    }
}
