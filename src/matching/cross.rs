//! Cross-collection matching
//!
//! Candidate pairs span two distinct collections: blocking keys are
//! evaluated per side, field weights name source fields and map onto
//! target fields, and edges land in a configurable edge collection with
//! `collection/id` endpoints on both sides.

use super::{MatchDecision, ScoredMatch};
use crate::edges::SimilarityEdge;
use crate::error::Result;
use crate::pipeline::CancellationToken;
use crate::record::Record;
use crate::similarity::FieldSimilarity;
use crate::storage::{EntityStore, KeyExpr};
use crate::validate::validate_collection_name;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Side-aware blocking: one key expression per collection.
#[derive(Debug, Clone)]
pub struct CrossBlocking {
    pub source_key: KeyExpr,
    pub target_key: KeyExpr,
    /// Blocks whose cross product exceeds this bound are dropped.
    pub max_block_size: usize,
}

/// Statistics for a cross-collection run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrossMatchStats {
    pub candidates: usize,
    pub oversize_blocks_dropped: usize,
    pub pairs_missing_side: usize,
    pub matches_out: usize,
    pub edges_created: usize,
    pub edges_merged: usize,
    pub elapsed_secs: f64,
}

/// Matches records of a source collection against a target collection.
pub struct CrossCollectionMatcher {
    store: Arc<dyn EntityStore>,
    source_collection: String,
    target_collection: String,
    edge_collection: String,
    /// Source field → target field.
    field_map: BTreeMap<String, String>,
    kernel: FieldSimilarity,
    threshold: f64,
    blocking: CrossBlocking,
}

impl CrossCollectionMatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EntityStore>,
        source_collection: impl Into<String>,
        target_collection: impl Into<String>,
        edge_collection: impl Into<String>,
        field_map: BTreeMap<String, String>,
        kernel: FieldSimilarity,
        threshold: f64,
        blocking: CrossBlocking,
    ) -> Result<Self> {
        let source_collection = source_collection.into();
        let target_collection = target_collection.into();
        let edge_collection = edge_collection.into();
        validate_collection_name(&source_collection)?;
        validate_collection_name(&target_collection)?;
        validate_collection_name(&edge_collection)?;
        Ok(Self {
            store,
            source_collection,
            target_collection,
            edge_collection,
            field_map,
            kernel,
            threshold,
            blocking,
        })
    }

    /// Project a target record into the source field namespace so the
    /// kernel can compare with source-side weights.
    fn remap_target(&self, target: &Record) -> Record {
        let mut fields = crate::record::Fields::new();
        for (source_field, target_field) in &self.field_map {
            if let Some(value) = target.get(target_field) {
                fields.insert(source_field.clone(), value.clone());
            }
        }
        Record::new(target.id.clone(), fields)
    }

    /// Block, score, and materialize cross-collection edges.
    pub fn run(&self, cancel: &CancellationToken) -> Result<(Vec<ScoredMatch>, CrossMatchStats)> {
        let started = Instant::now();
        let mut stats = CrossMatchStats::default();

        let sources = self.store.scan(&self.source_collection, None)?;
        let targets = self.store.scan(&self.target_collection, None)?;

        let mut target_blocks: HashMap<String, Vec<&Record>> = HashMap::new();
        for record in &targets {
            if let Some(key) = self.blocking.target_key.eval(record) {
                target_blocks.entry(key).or_default().push(record);
            }
        }

        let mut source_blocks: HashMap<String, Vec<&Record>> = HashMap::new();
        for record in &sources {
            if let Some(key) = self.blocking.source_key.eval(record) {
                source_blocks.entry(key).or_default().push(record);
            }
        }

        let mut matches = Vec::new();
        let mut block_keys: Vec<&String> = source_blocks.keys().collect();
        block_keys.sort();
        for key in block_keys {
            if cancel.is_cancelled() {
                break;
            }
            let source_side = &source_blocks[key];
            let Some(target_side) = target_blocks.get(key) else {
                continue;
            };
            if source_side.len() * target_side.len() > self.blocking.max_block_size {
                stats.oversize_blocks_dropped += 1;
                continue;
            }
            for source in source_side {
                for target in target_side {
                    stats.candidates += 1;
                    let shadow = self.remap_target(target);
                    let score = self.kernel.score(source, &shadow);
                    if score.confidence < self.threshold {
                        continue;
                    }
                    stats.matches_out += 1;
                    matches.push(ScoredMatch {
                        a: source.id.clone(),
                        b: target.id.clone(),
                        confidence: score.confidence,
                        decision: MatchDecision::Match,
                        field_scores: score.field_scores,
                    });
                }
            }
        }

        for m in &matches {
            let mut edge = SimilarityEdge::new(
                format!("{}/{}", self.source_collection, m.a),
                format!("{}/{}", self.target_collection, m.b),
                m.confidence,
                true,
                "cross_collection",
            );
            edge.field_scores = m.field_scores.clone();
            let outcome = self.store.upsert_edge(&self.edge_collection, &edge, false)?;
            if outcome.created {
                stats.edges_created += 1;
            } else {
                stats.edges_merged += 1;
            }
        }

        stats.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            source = %self.source_collection,
            target = %self.target_collection,
            candidates = stats.candidates,
            matches = stats.matches_out,
            "cross-collection matching complete"
        );
        Ok((matches, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::SimilarityAlgorithm;
    use crate::storage::{OpenStore, SqliteStore};
    use serde_json::json;

    fn seeded() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many(
                "customers",
                &[
                    Record::from_value("c1", json!({"name": "Acme Corp", "zip": "78701"})),
                    Record::from_value("c2", json!({"name": "Zenith LLC", "zip": "10001"})),
                ],
            )
            .unwrap();
        store
            .insert_many(
                "suppliers",
                &[
                    Record::from_value("s1", json!({"company_name": "Acme Corp", "postal": "78701"})),
                    Record::from_value("s2", json!({"company_name": "Bravo Inc", "postal": "78701"})),
                    Record::from_value("s3", json!({"company_name": "Zenith LLC", "postal": "99999"})),
                ],
            )
            .unwrap();
        Arc::new(store)
    }

    fn matcher(store: Arc<SqliteStore>) -> CrossCollectionMatcher {
        let kernel = FieldSimilarity::new(
            SimilarityAlgorithm::JaroWinkler,
            [("name".to_string(), 1.0)].into_iter().collect(),
        );
        CrossCollectionMatcher::new(
            store,
            "customers",
            "suppliers",
            "customer_supplier_links",
            [("name".to_string(), "company_name".to_string())]
                .into_iter()
                .collect(),
            kernel,
            0.9,
            CrossBlocking {
                source_key: KeyExpr::Field("zip".to_string()),
                target_key: KeyExpr::Field("postal".to_string()),
                max_block_size: 100,
            },
        )
        .unwrap()
    }

    // === Scenario: side-aware keys and field mapping pair across collections ===

    #[test]
    fn matches_across_collections_with_field_mapping() {
        let store = seeded();
        let (matches, stats) = matcher(store.clone()).run(&CancellationToken::new()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].a, "c1");
        assert_eq!(matches[0].b, "s1");
        // c2/s3 share a name but not a blocking key
        assert_eq!(stats.candidates, 2, "c1 blocks with s1 and s2 on 78701");
        assert_eq!(stats.edges_created, 1);

        let edges = store.fetch_edges_above("customer_supplier_links", 0.0).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from_id, "customers/c1");
        assert_eq!(edges[0].to_id, "suppliers/s1");
    }

    #[test]
    fn rerun_merges_instead_of_duplicating() {
        let store = seeded();
        let m = matcher(store.clone());
        m.run(&CancellationToken::new()).unwrap();
        let (_, stats) = m.run(&CancellationToken::new()).unwrap();
        assert_eq!(stats.edges_created, 0);
        assert_eq!(stats.edges_merged, 1);
        assert_eq!(store.count_edges("customer_supplier_links").unwrap(), 1);
    }
}
