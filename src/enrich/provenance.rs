//! Relationship-provenance sweep
//!
//! After clustering, pre-existing relationships still point at member
//! records. The sweeper rewrites their endpoints to the canonical
//! (cluster) id, stamps the original endpoint and a timestamp on every
//! rewritten edge so the mapping stays auditable, and removes edges
//! that became identical after rewriting.

use crate::clustering::Cluster;
use crate::error::Result;
use crate::storage::{EntityStore, Relation};
use crate::validate::validate_collection_name;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// Member id → canonical cluster id, for every clustered record.
pub fn canonical_mapping(clusters: &[Cluster]) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    for cluster in clusters {
        for member in &cluster.members {
            mapping.insert(member.clone(), cluster.cluster_id.clone());
        }
    }
    mapping
}

/// Statistics for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepStats {
    pub relations_examined: usize,
    pub endpoints_rewritten: usize,
    pub duplicates_removed: usize,
}

pub struct ProvenanceSweeper {
    store: Arc<dyn EntityStore>,
    relation_collection: String,
}

impl ProvenanceSweeper {
    pub fn new(store: Arc<dyn EntityStore>, relation_collection: impl Into<String>) -> Result<Self> {
        let relation_collection = relation_collection.into();
        validate_collection_name(&relation_collection)?;
        Ok(Self {
            store,
            relation_collection,
        })
    }

    /// Rewrite relation endpoints through the canonical mapping.
    pub fn sweep(&self, canonical: &HashMap<String, String>) -> Result<SweepStats> {
        let relations = self.store.fetch_relations(&self.relation_collection)?;
        let mut stats = SweepStats {
            relations_examined: relations.len(),
            ..SweepStats::default()
        };

        let swept_at = Utc::now().to_rfc3339();
        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        let mut rewritten: Vec<Relation> = Vec::with_capacity(relations.len());
        for mut relation in relations {
            let mut touched = false;
            if let Some(target) = canonical.get(&relation.from_id) {
                if *target != relation.from_id {
                    relation.properties.insert(
                        "original_from".to_string(),
                        Value::String(relation.from_id.clone()),
                    );
                    relation.from_id = target.clone();
                    touched = true;
                }
            }
            if let Some(target) = canonical.get(&relation.to_id) {
                if *target != relation.to_id {
                    relation.properties.insert(
                        "original_to".to_string(),
                        Value::String(relation.to_id.clone()),
                    );
                    relation.to_id = target.clone();
                    touched = true;
                }
            }
            if touched {
                relation
                    .properties
                    .insert("swept_at".to_string(), Value::String(swept_at.clone()));
                stats.endpoints_rewritten += 1;
            }

            let identity = (
                relation.from_id.clone(),
                relation.to_id.clone(),
                relation.relationship.clone(),
            );
            if seen.insert(identity) {
                rewritten.push(relation);
            } else {
                stats.duplicates_removed += 1;
            }
        }

        self.store
            .replace_relations(&self.relation_collection, &rewritten)?;
        info!(
            examined = stats.relations_examined,
            rewritten = stats.endpoints_rewritten,
            deduplicated = stats.duplicates_removed,
            "provenance sweep complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Fields;
    use crate::storage::{OpenStore, SqliteStore};

    fn relation(from: &str, to: &str, rel: &str) -> Relation {
        Relation {
            from_id: from.to_string(),
            to_id: to.to_string(),
            relationship: rel.to_string(),
            properties: Fields::new(),
        }
    }

    fn mapping(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(m, c)| (m.to_string(), c.to_string()))
            .collect()
    }

    // === Scenario: endpoints repoint to the canonical id with audit trail ===

    #[test]
    fn rewrites_endpoints_and_records_provenance() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_relation("prescribed", &relation("r1", "drug_9", "prescribed"))
            .unwrap();
        let sweeper = ProvenanceSweeper::new(store.clone(), "prescribed").unwrap();

        let stats = sweeper.sweep(&mapping(&[("r1", "cluster_abc")])).unwrap();
        assert_eq!(stats.endpoints_rewritten, 1);

        let swept = store.fetch_relations("prescribed").unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].from_id, "cluster_abc");
        assert_eq!(swept[0].properties["original_from"], "r1");
        assert!(swept[0].properties.contains_key("swept_at"));
    }

    // === Scenario: edges collapsing onto the same canonical pair dedupe ===

    #[test]
    fn deduplicates_identical_rewritten_edges() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        // Two cluster members sharing the same outgoing relation.
        store
            .insert_relation("prescribed", &relation("r1", "drug_9", "prescribed"))
            .unwrap();
        store
            .insert_relation("prescribed", &relation("r2", "drug_9", "prescribed"))
            .unwrap();
        let sweeper = ProvenanceSweeper::new(store.clone(), "prescribed").unwrap();

        let stats = sweeper
            .sweep(&mapping(&[("r1", "cluster_abc"), ("r2", "cluster_abc")]))
            .unwrap();
        assert_eq!(stats.endpoints_rewritten, 2);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(store.fetch_relations("prescribed").unwrap().len(), 1);
    }

    #[test]
    fn unmapped_endpoints_are_untouched() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_relation("knows", &relation("x", "y", "knows"))
            .unwrap();
        let sweeper = ProvenanceSweeper::new(store.clone(), "knows").unwrap();
        let stats = sweeper.sweep(&HashMap::new()).unwrap();
        assert_eq!(stats.endpoints_rewritten, 0);
        let all = store.fetch_relations("knows").unwrap();
        assert_eq!(all[0].from_id, "x");
        assert!(all[0].properties.is_empty());
    }

    #[test]
    fn canonical_mapping_covers_every_member() {
        let members: Vec<String> = vec!["a".into(), "b".into()];
        let cluster = Cluster {
            cluster_id: Cluster::id_for(&members),
            members: members.clone(),
            size: 2,
            edge_count: 1,
            min_similarity: 0.9,
            avg_similarity: 0.9,
            max_similarity: 0.9,
            density: 1.0,
            quality_score: 0.9,
            low_quality: false,
        };
        let mapping = canonical_mapping(std::slice::from_ref(&cluster));
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping["a"], cluster.cluster_id);
    }
}
