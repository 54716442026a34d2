//! Entity clustering: weakly-connected components of the similarity graph
//!
//! Two interchangeable algorithms discover the same components: a
//! store-side recursive traversal, and a bulk fetch followed by
//! in-process iterative DFS. Cluster ids derive from the sorted member
//! set, so repeated runs produce stable identifiers, and the cluster
//! collection is truncated before each persistence pass so shrinking
//! clusters never leak stale documents.

use crate::error::Result;
use crate::record::Record;
use crate::storage::{EdgeEndpoints, EntityStore};
use crate::validate::validate_collection_name;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Component-discovery algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAlgorithm {
    /// One store-side traversal per unvisited vertex.
    GraphTraversal,
    /// Fetch all qualifying edges, then iterative DFS in process.
    #[default]
    BulkDfs,
}

/// Clustering policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default)]
    pub algorithm: ClusterAlgorithm,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default = "default_max_cluster_size")]
    pub max_cluster_size: usize,
    #[serde(default = "default_quality_threshold")]
    pub quality_score_threshold: f64,
}

fn default_min_similarity() -> f64 {
    0.75
}
fn default_min_cluster_size() -> usize {
    2
}
fn default_max_cluster_size() -> usize {
    100
}
fn default_quality_threshold() -> f64 {
    0.5
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            algorithm: ClusterAlgorithm::default(),
            min_similarity: default_min_similarity(),
            min_cluster_size: default_min_cluster_size(),
            max_cluster_size: default_max_cluster_size(),
            quality_score_threshold: default_quality_threshold(),
        }
    }
}

/// One discovered entity cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Deterministic id derived from the sorted member set.
    pub cluster_id: String,
    /// Member record ids, sorted.
    pub members: Vec<String>,
    pub size: usize,
    pub edge_count: usize,
    pub min_similarity: f64,
    pub avg_similarity: f64,
    pub max_similarity: f64,
    /// `edge_count / (size * (size - 1) / 2)`
    pub density: f64,
    pub quality_score: f64,
    /// Set when the quality score fell below the configured threshold.
    pub low_quality: bool,
}

impl Cluster {
    /// Deterministic cluster id: UUIDv5 over the sorted member ids.
    pub fn id_for(members: &[String]) -> String {
        let mut sorted: Vec<&str> = members.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        Uuid::new_v5(&Uuid::NAMESPACE_OID, sorted.join("\n").as_bytes()).to_string()
    }
}

/// Statistics for one clustering run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStats {
    pub edges_considered: usize,
    pub clusters_found: usize,
    pub undersize_clusters: usize,
    pub oversize_clusters: usize,
    pub flagged_low_quality: usize,
    pub elapsed_secs: f64,
}

/// Discovers and persists entity clusters.
pub struct ClusteringService {
    store: Arc<dyn EntityStore>,
    edge_collection: String,
    /// When set, `collection/id` edge endpoints reduce to bare ids.
    vertex_collection: Option<String>,
    config: ClusteringConfig,
}

impl ClusteringService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        edge_collection: impl Into<String>,
        config: ClusteringConfig,
    ) -> Result<Self> {
        let edge_collection = edge_collection.into();
        validate_collection_name(&edge_collection)?;
        Ok(Self {
            store,
            edge_collection,
            vertex_collection: None,
            config,
        })
    }

    /// Strip this vertex collection's prefix from edge endpoints.
    pub fn with_vertex_collection(mut self, collection: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        self.vertex_collection = Some(collection);
        Ok(self)
    }

    fn bare_id(&self, vertex: &str) -> String {
        match &self.vertex_collection {
            Some(collection) => vertex
                .strip_prefix(&format!("{collection}/"))
                .unwrap_or(vertex)
                .to_string(),
            None => vertex.to_string(),
        }
    }

    /// Discover the weakly-connected components of the edge subgraph at
    /// or above the similarity threshold.
    pub fn discover(&self) -> Result<(Vec<Cluster>, ClusterStats)> {
        let started = Instant::now();
        let edges = self
            .store
            .fetch_edges_above(&self.edge_collection, self.config.min_similarity)?;
        let mut stats = ClusterStats {
            edges_considered: edges.len(),
            ..ClusterStats::default()
        };

        let components = match self.config.algorithm {
            ClusterAlgorithm::BulkDfs => bulk_dfs_components(&edges),
            ClusterAlgorithm::GraphTraversal => self.traversal_components(&edges)?,
        };

        // Pair-score lookup for per-cluster statistics.
        let mut scores: HashMap<(String, String), f64> = HashMap::new();
        for edge in &edges {
            let (lo, hi) = ordered(&edge.from_id, &edge.to_id);
            scores.insert((lo.to_string(), hi.to_string()), edge.similarity_score);
        }

        let mut clusters = Vec::new();
        for component in components {
            if component.len() < self.config.min_cluster_size {
                stats.undersize_clusters += 1;
                continue;
            }
            if component.len() > self.config.max_cluster_size {
                warn!(
                    size = component.len(),
                    max = self.config.max_cluster_size,
                    "oversize cluster rejected as a likely false positive"
                );
                stats.oversize_clusters += 1;
                continue;
            }
            let cluster = self.build_cluster(&component, &scores);
            if cluster.low_quality {
                stats.flagged_low_quality += 1;
            }
            clusters.push(cluster);
        }

        clusters.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        stats.clusters_found = clusters.len();
        stats.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            clusters = stats.clusters_found,
            oversize = stats.oversize_clusters,
            "clustering complete"
        );
        Ok((clusters, stats))
    }

    /// Persist clusters, truncating the collection first so stale
    /// clusters from prior runs never linger.
    pub fn persist(&self, clusters: &[Cluster], cluster_collection: &str) -> Result<usize> {
        validate_collection_name(cluster_collection)?;
        self.store.ensure_collection(cluster_collection)?;
        self.store.truncate_collection(cluster_collection)?;
        for cluster in clusters {
            let mut fields = match serde_json::to_value(cluster).map_err(crate::storage::StorageError::from)? {
                Value::Object(map) => map,
                _ => unreachable!("cluster serializes to an object"),
            };
            fields.insert(
                "created_at".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            self.store
                .upsert_document(cluster_collection, &Record::new(cluster.cluster_id.clone(), fields))?;
        }
        Ok(clusters.len())
    }

    fn traversal_components(&self, edges: &[EdgeEndpoints]) -> Result<Vec<Vec<String>>> {
        let mut vertices: BTreeSet<&str> = BTreeSet::new();
        for edge in edges {
            vertices.insert(&edge.from_id);
            vertices.insert(&edge.to_id);
        }
        let mut visited: HashSet<String> = HashSet::new();
        let mut components = Vec::new();
        for vertex in vertices {
            if visited.contains(vertex) {
                continue;
            }
            let component = self.store.component_from(
                &self.edge_collection,
                vertex,
                self.config.min_similarity,
            )?;
            for member in &component {
                visited.insert(member.clone());
            }
            components.push(component);
        }
        Ok(components)
    }

    fn build_cluster(
        &self,
        component: &[String],
        scores: &HashMap<(String, String), f64>,
    ) -> Cluster {
        let mut members: Vec<String> = component.iter().map(|v| self.bare_id(v)).collect();
        members.sort_unstable();
        members.dedup();
        let size = members.len();

        let mut edge_count = 0;
        let mut min_similarity = f64::MAX;
        let mut max_similarity: f64 = 0.0;
        let mut total = 0.0;
        for (i, a) in component.iter().enumerate() {
            for b in &component[i + 1..] {
                let (lo, hi) = ordered(a, b);
                if let Some(&score) = scores.get(&(lo.to_string(), hi.to_string())) {
                    edge_count += 1;
                    total += score;
                    min_similarity = min_similarity.min(score);
                    max_similarity = max_similarity.max(score);
                }
            }
        }
        if edge_count == 0 {
            min_similarity = 0.0;
        }
        let avg_similarity = if edge_count > 0 {
            total / edge_count as f64
        } else {
            0.0
        };
        let possible = size * (size - 1) / 2;
        let density = if possible > 0 {
            edge_count as f64 / possible as f64
        } else {
            0.0
        };
        let quality_score = self.quality(density, min_similarity, avg_similarity, size);

        Cluster {
            cluster_id: Cluster::id_for(&members),
            members,
            size,
            edge_count,
            min_similarity,
            avg_similarity,
            max_similarity,
            density,
            quality_score,
            low_quality: quality_score < self.config.quality_score_threshold,
        }
    }

    /// Quality combines density, similarity spread, and a penalty for
    /// clusters drifting toward the size cap.
    fn quality(&self, density: f64, min_sim: f64, avg_sim: f64, size: usize) -> f64 {
        let base = 0.4 * density + 0.4 * avg_sim + 0.2 * min_sim;
        let cap = self.config.max_cluster_size;
        let penalty = if size <= 10 || cap <= 10 {
            0.0
        } else {
            0.2 * (((size - 10) as f64) / ((cap - 10) as f64)).min(1.0)
        };
        (base - penalty).clamp(0.0, 1.0)
    }
}

fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Iterative DFS (explicit stack) over the fetched edge list.
fn bulk_dfs_components(edges: &[EdgeEndpoints]) -> Vec<Vec<String>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut vertices: BTreeSet<&str> = BTreeSet::new();
    for edge in edges {
        adjacency.entry(&edge.from_id).or_default().push(&edge.to_id);
        adjacency.entry(&edge.to_id).or_default().push(&edge.from_id);
        vertices.insert(&edge.from_id);
        vertices.insert(&edge.to_id);
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut components = Vec::new();
    for &start in &vertices {
        if visited.contains(start) {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![start];
        while let Some(vertex) = stack.pop() {
            if !visited.insert(vertex) {
                continue;
            }
            component.push(vertex.to_string());
            if let Some(neighbours) = adjacency.get(vertex) {
                for &next in neighbours {
                    if !visited.contains(next) {
                        stack.push(next);
                    }
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edges::SimilarityEdge;
    use crate::storage::{OpenStore, SqliteStore};

    fn store_with_edges(edges: &[(&str, &str, f64)]) -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        for (a, b, score) in edges {
            store
                .upsert_edge(
                    "similarTo",
                    &SimilarityEdge::new(*a, *b, *score, true, "test"),
                    false,
                )
                .unwrap();
        }
        Arc::new(store)
    }

    fn service(store: Arc<SqliteStore>, algorithm: ClusterAlgorithm) -> ClusteringService {
        ClusteringService::new(
            store,
            "similarTo",
            ClusteringConfig {
                algorithm,
                min_similarity: 0.75,
                ..ClusteringConfig::default()
            },
        )
        .unwrap()
    }

    fn member_sets(clusters: &[Cluster]) -> Vec<Vec<String>> {
        clusters.iter().map(|c| c.members.clone()).collect()
    }

    // === Invariant: both algorithms produce identical components ===

    #[test]
    fn traversal_and_dfs_agree() {
        let edges = [
            ("a", "b", 0.9),
            ("b", "c", 0.8),
            ("x", "y", 0.95),
            ("p", "q", 0.5), // below threshold
        ];
        let dfs = service(store_with_edges(&edges), ClusterAlgorithm::BulkDfs)
            .discover()
            .unwrap()
            .0;
        let traversal = service(store_with_edges(&edges), ClusterAlgorithm::GraphTraversal)
            .discover()
            .unwrap()
            .0;
        assert_eq!(member_sets(&dfs), member_sets(&traversal));
        assert_eq!(dfs.len(), 2);
    }

    // === Invariant: cluster id is stable under member permutation ===

    #[test]
    fn cluster_id_ignores_member_order() {
        let forward = Cluster::id_for(&["r1".into(), "r2".into(), "r3".into()]);
        let shuffled = Cluster::id_for(&["r3".into(), "r1".into(), "r2".into()]);
        assert_eq!(forward, shuffled);
        let other = Cluster::id_for(&["r1".into(), "r2".into()]);
        assert_ne!(forward, other);
    }

    // === Scenario: triangle cluster has density 1.0 ===

    #[test]
    fn triangle_cluster_statistics() {
        let store = store_with_edges(&[("r1", "r2", 0.9), ("r1", "r3", 0.8), ("r2", "r3", 0.85)]);
        let (clusters, stats) = service(store, ClusterAlgorithm::BulkDfs).discover().unwrap();
        assert_eq!(stats.clusters_found, 1);
        let c = &clusters[0];
        assert_eq!(c.members, vec!["r1", "r2", "r3"]);
        assert_eq!(c.size, 3);
        assert_eq!(c.edge_count, 3);
        assert!((c.density - 1.0).abs() < 1e-9);
        assert!((c.min_similarity - 0.8).abs() < 1e-9);
        assert!((c.max_similarity - 0.9).abs() < 1e-9);
        assert!((c.avg_similarity - 0.85).abs() < 1e-9);
    }

    // === Subdivision: removing a bridge splits a cluster in two ===

    #[test]
    fn removing_a_bridge_edge_splits_components() {
        let with_bridge = store_with_edges(&[
            ("a", "b", 0.9),
            ("b", "c", 0.9), // bridge
            ("c", "d", 0.9),
        ]);
        let (clusters, _) = service(with_bridge, ClusterAlgorithm::BulkDfs)
            .discover()
            .unwrap();
        assert_eq!(clusters.len(), 1);

        let without_bridge = store_with_edges(&[("a", "b", 0.9), ("c", "d", 0.9)]);
        let (clusters, _) = service(without_bridge, ClusterAlgorithm::BulkDfs)
            .discover()
            .unwrap();
        assert_eq!(member_sets(&clusters), vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string(), "d".to_string()],
        ]);
    }

    // === Oversize clusters are rejected ===

    #[test]
    fn oversize_cluster_is_dropped() {
        let edges: Vec<(String, String, f64)> = (0..12)
            .map(|i| (format!("n{i:02}"), format!("n{:02}", i + 1), 0.9))
            .collect();
        let borrowed: Vec<(&str, &str, f64)> = edges
            .iter()
            .map(|(a, b, s)| (a.as_str(), b.as_str(), *s))
            .collect();
        let store = store_with_edges(&borrowed);
        let svc = ClusteringService::new(
            store,
            "similarTo",
            ClusteringConfig {
                max_cluster_size: 10,
                ..ClusteringConfig::default()
            },
        )
        .unwrap();
        let (clusters, stats) = svc.discover().unwrap();
        assert!(clusters.is_empty());
        assert_eq!(stats.oversize_clusters, 1);
    }

    // === Vertex prefixes strip to bare record ids ===

    #[test]
    fn vertex_collection_prefix_is_stripped() {
        let store = store_with_edges(&[("people/r1", "people/r2", 0.9)]);
        let svc = service(store, ClusterAlgorithm::BulkDfs)
            .with_vertex_collection("people")
            .unwrap();
        let (clusters, _) = svc.discover().unwrap();
        assert_eq!(clusters[0].members, vec!["r1", "r2"]);
    }

    // === Persistence truncates before writing ===

    #[test]
    fn persist_replaces_prior_clusters() {
        let store = store_with_edges(&[("a", "b", 0.9), ("c", "d", 0.9)]);
        let svc = service(store.clone(), ClusterAlgorithm::BulkDfs);
        let (clusters, _) = svc.discover().unwrap();
        assert_eq!(svc.persist(&clusters, "entity_clusters").unwrap(), 2);
        assert_eq!(store.count("entity_clusters").unwrap(), 2);

        // Shrink the graph and re-run: old cluster documents must not leak.
        store.truncate_collection("similarTo").unwrap();
        store
            .upsert_edge(
                "similarTo",
                &SimilarityEdge::new("a", "b", 0.9, true, "test"),
                false,
            )
            .unwrap();
        let (clusters, _) = svc.discover().unwrap();
        assert_eq!(svc.persist(&clusters, "entity_clusters").unwrap(), 1);
        assert_eq!(store.count("entity_clusters").unwrap(), 1);
    }
}
