use std::collections::HashMap;

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use tracing::info;

use curator_common::{CandidateEdge, CuratorError, Record, RecordId, Result, ThresholdsConfig};

/// Undirected similarity graph over records under review.
///
/// Nodes carry record ids, edges carry similarity weights. The id→node map is
/// the only way in; the graph is rebuilt from scratch rather than mutated.
#[derive(Debug, Default)]
pub struct SimilarityGraph {
    graph: UnGraph<RecordId, f64>,
    nodes: HashMap<RecordId, NodeIndex>,
    categories: HashMap<RecordId, String>,
    /// Edges discarded for crossing categories.
    pub dropped_cross_category: usize,
}

impl SimilarityGraph {
    /// Build from candidate edges. Endpoints must be live records (`records`,
    /// keyed by id); edges below `thresholds.edge`, touching unknown records,
    /// or crossing categories (unless allowed) are left out.
    pub fn build(
        edges: &[CandidateEdge],
        records: &HashMap<RecordId, Record>,
        thresholds: &ThresholdsConfig,
    ) -> Result<Self> {
        let mut graph = Self::default();
        for edge in edges {
            if !edge.score.is_finite() {
                return Err(CuratorError::Graph(format!(
                    "edge {}-{} has non-finite score",
                    edge.a, edge.b
                )));
            }
            if edge.score < thresholds.edge {
                continue;
            }
            let (Some(ra), Some(rb)) = (records.get(&edge.a), records.get(&edge.b)) else {
                continue;
            };
            if !ra.is_pending() && !rb.is_pending() {
                continue;
            }
            if ra.category != rb.category && !thresholds.allow_cross_category {
                graph.dropped_cross_category += 1;
                continue;
            }
            let na = graph.node(ra);
            let nb = graph.node(rb);
            match graph.graph.find_edge(na, nb) {
                Some(existing) => {
                    let weight = &mut graph.graph[existing];
                    *weight = weight.max(edge.score);
                }
                None => {
                    graph.graph.add_edge(na, nb, edge.score);
                }
            }
        }
        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            dropped_cross_category = graph.dropped_cross_category,
            "Built similarity graph"
        );
        Ok(graph)
    }

    fn node(&mut self, record: &Record) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(&record.id) {
            return idx;
        }
        let idx = self.graph.add_node(record.id.clone());
        self.nodes.insert(record.id.clone(), idx);
        self.categories
            .insert(record.id.clone(), record.category.clone());
        idx
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn category_of(&self, id: &str) -> Option<&str> {
        self.categories.get(id).map(String::as_str)
    }

    pub fn weight(&self, a: &str, b: &str) -> Option<f64> {
        let (na, nb) = (self.nodes.get(a)?, self.nodes.get(b)?);
        self.graph.find_edge(*na, *nb).map(|e| self.graph[e])
    }

    /// Node ids in id order.
    pub fn ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every edge as `(a, b, weight)` with `a < b`, sorted.
    pub fn weighted_edges(&self) -> Vec<(RecordId, RecordId, f64)> {
        let mut edges: Vec<(RecordId, RecordId, f64)> = self
            .graph
            .edge_references()
            .map(|e| {
                let (a, b) = (&self.graph[e.source()], &self.graph[e.target()]);
                if a < b {
                    (a.clone(), b.clone(), *e.weight())
                } else {
                    (b.clone(), a.clone(), *e.weight())
                }
            })
            .collect();
        edges.sort_by(|x, y| (&x.0, &x.1).cmp(&(&y.0, &y.1)));
        edges
    }
}
