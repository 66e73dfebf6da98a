use std::collections::{BTreeMap, HashMap};

use petgraph::unionfind::UnionFind;
use tracing::{info, warn};

use curator_common::{community_fingerprint, Community, RecordId, WeightedEdge};

use crate::graph::SimilarityGraph;

const WEIGHT_EPSILON: f64 = 1e-9;

/// Category assigned to communities whose members span categories.
pub const MIXED_CATEGORY: &str = "mixed";

struct Group {
    members: Vec<usize>,
    oversized: bool,
}

/// Partition the graph into review-sized communities.
///
/// Connected components are taken at the graph's edge threshold. A component
/// larger than `cap` is split by discarding its weakest edge weight and
/// re-partitioning, so strongly linked records stay together and every
/// discarded edge joins two adjacent groups. A component whose edges all
/// share one weight cannot be split this way and is flagged oversized.
/// Singletons are not communities.
pub fn detect_communities(graph: &SimilarityGraph, cap: usize) -> Vec<Community> {
    let ids = graph.ids();
    let position: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let edges: Vec<(usize, usize, f64)> = graph
        .weighted_edges()
        .into_iter()
        .filter_map(|(a, b, w)| Some((*position.get(a.as_str())?, *position.get(b.as_str())?, w)))
        .collect();

    let mut groups = Vec::new();
    partition((0..ids.len()).collect(), edges.clone(), ids.len(), cap.max(2), &mut groups);

    let mut communities: Vec<Community> = groups
        .into_iter()
        .map(|group| build_community(group, &ids, &edges, graph))
        .collect();
    communities.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let oversized = communities.iter().filter(|c| c.oversized).count();
    if oversized > 0 {
        warn!(oversized, cap, "Communities exceed the size cap");
    }
    info!(
        communities = communities.len(),
        oversized,
        "Detected communities"
    );
    communities
}

fn partition(
    nodes: Vec<usize>,
    edges: Vec<(usize, usize, f64)>,
    universe: usize,
    cap: usize,
    out: &mut Vec<Group>,
) {
    let mut uf = UnionFind::<usize>::new(universe);
    for &(a, b, _) in &edges {
        uf.union(a, b);
    }
    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for node in nodes {
        components.entry(uf.find(node)).or_default().push(node);
    }

    for (_, mut members) in components {
        if members.len() < 2 {
            continue;
        }
        members.sort_unstable();
        if members.len() <= cap {
            out.push(Group {
                members,
                oversized: false,
            });
            continue;
        }

        let inner: Vec<(usize, usize, f64)> = edges
            .iter()
            .filter(|(a, b, _)| members.binary_search(a).is_ok() && members.binary_search(b).is_ok())
            .copied()
            .collect();
        let min = inner.iter().map(|e| e.2).fold(f64::INFINITY, f64::min);
        let max = inner.iter().map(|e| e.2).fold(f64::NEG_INFINITY, f64::max);
        if max - min <= WEIGHT_EPSILON {
            out.push(Group {
                members,
                oversized: true,
            });
            continue;
        }
        let stronger: Vec<(usize, usize, f64)> = inner
            .into_iter()
            .filter(|e| e.2 > min + WEIGHT_EPSILON)
            .collect();
        partition(members, stronger, universe, cap, out);
    }
}

fn build_community(
    group: Group,
    ids: &[RecordId],
    edges: &[(usize, usize, f64)],
    graph: &SimilarityGraph,
) -> Community {
    let members: Vec<RecordId> = group.members.iter().map(|&i| ids[i].clone()).collect();
    let intra: Vec<WeightedEdge> = edges
        .iter()
        .filter(|(a, b, _)| {
            group.members.binary_search(a).is_ok() && group.members.binary_search(b).is_ok()
        })
        .map(|&(a, b, w)| WeightedEdge {
            a: ids[a].clone(),
            b: ids[b].clone(),
            weight: w,
        })
        .collect();

    let avg_weight = if intra.is_empty() {
        0.0
    } else {
        intra.iter().map(|e| e.weight).sum::<f64>() / intra.len() as f64
    };

    let mut categories: Vec<&str> = members
        .iter()
        .filter_map(|id| graph.category_of(id))
        .collect();
    categories.sort_unstable();
    categories.dedup();
    let category = match categories.as_slice() {
        [single] => single.to_string(),
        _ => MIXED_CATEGORY.to_string(),
    };

    Community {
        id: community_fingerprint(&members),
        priority: priority(avg_weight, members.len()),
        category,
        members,
        edges: intra,
        avg_weight,
        oversized: group.oversized,
    }
}

/// Monotonic in both group size and average edge weight.
pub fn priority(avg_weight: f64, size: usize) -> f64 {
    avg_weight * (size as f64).ln_1p()
}
