//! Address entity resolution
//!
//! Bundles the pieces postal addresses need: street-token
//! normalization (abbreviations, directionals), a full-text view over
//! the normalized street line, BM25 blocking with registered-agent
//! exclusion, weighted scoring, edge creation, and optional
//! clustering — behind a configurable field mapping.
//!
//! Registered-agent addresses (corporate filing services shared by
//! thousands of unrelated companies) are excluded from blocking;
//! left in, they snowball into spurious mega-clusters.

use crate::blocking::PairCollector;
use crate::clustering::{Cluster, ClusteringConfig, ClusteringService};
use crate::edges::EdgeMaterializer;
use crate::error::Result;
use crate::matching::{MatchDecision, ScoredMatch};
use crate::pipeline::CancellationToken;
use crate::record::{Fields, Record};
use crate::similarity::{FieldSimilarity, SimilarityAlgorithm};
use crate::storage::EntityStore;
use crate::validate::{collapse_whitespace, validate_collection_name};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Derived document field carrying the normalized street line.
const NORMALIZED_STREET_FIELD: &str = "_street_norm";

/// Street-token rewrites applied during normalization.
const STREET_TOKENS: &[(&str, &str)] = &[
    ("st", "street"),
    ("str", "street"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("rd", "road"),
    ("blvd", "boulevard"),
    ("dr", "drive"),
    ("ln", "lane"),
    ("ct", "court"),
    ("hwy", "highway"),
    ("pkwy", "parkway"),
    ("pl", "place"),
    ("sq", "square"),
    ("ste", "suite"),
    ("apt", "apartment"),
    ("fl", "floor"),
    ("n", "north"),
    ("s", "south"),
    ("e", "east"),
    ("w", "west"),
    ("ne", "northeast"),
    ("nw", "northwest"),
    ("se", "southeast"),
    ("sw", "southwest"),
];

/// Normalize a street line: lower-case, strip punctuation, expand
/// abbreviations and directional tokens, collapse whitespace.
/// Idempotent.
pub fn normalize_address(raw: &str) -> String {
    let stripped: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    collapse_whitespace(&stripped)
        .split(' ')
        .map(|token| {
            STREET_TOKENS
                .iter()
                .find(|(abbrev, _)| *abbrev == token)
                .map(|(_, full)| *full)
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Which record fields carry the address parts.
#[derive(Debug, Clone)]
pub struct AddressFields {
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

impl Default for AddressFields {
    fn default() -> Self {
        Self {
            street: "street".to_string(),
            city: "city".to_string(),
            state: "state".to_string(),
            postal_code: "postal_code".to_string(),
        }
    }
}

/// Report for one address ER run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AddressReport {
    pub records: usize,
    pub registered_agents_skipped: usize,
    pub candidates: usize,
    pub matches: usize,
    pub edges_created: usize,
    pub edges_merged: usize,
    pub clusters: usize,
    pub elapsed_secs: f64,
}

/// End-to-end entity resolution for postal addresses.
pub struct AddressResolver {
    store: Arc<dyn EntityStore>,
    collection: String,
    fields: AddressFields,
    edge_collection: String,
    view: String,
    bm25_threshold: f64,
    limit_per_entity: usize,
    similarity_threshold: f64,
    registered_agents: HashSet<String>,
    clustering: Option<ClusteringConfig>,
}

impl AddressResolver {
    pub fn new(store: Arc<dyn EntityStore>, collection: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        Ok(Self {
            store,
            collection,
            fields: AddressFields::default(),
            edge_collection: "address_similarTo".to_string(),
            view: "address_view".to_string(),
            bm25_threshold: 1e-6,
            limit_per_entity: 10,
            similarity_threshold: 0.85,
            registered_agents: HashSet::new(),
            clustering: None,
        })
    }

    pub fn with_fields(mut self, fields: AddressFields) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_edge_collection(mut self, edge_collection: impl Into<String>) -> Result<Self> {
        let edge_collection = edge_collection.into();
        validate_collection_name(&edge_collection)?;
        self.edge_collection = edge_collection;
        Ok(self)
    }

    /// Known registered-agent street lines, excluded from blocking.
    pub fn with_registered_agents(mut self, agents: impl IntoIterator<Item = String>) -> Self {
        self.registered_agents = agents
            .into_iter()
            .map(|a| normalize_address(&a))
            .collect();
        self
    }

    pub fn with_bm25_threshold(mut self, threshold: f64) -> Self {
        self.bm25_threshold = threshold;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Also discover clusters after edge creation.
    pub fn with_clustering(mut self, config: ClusteringConfig) -> Self {
        self.clustering = Some(config);
        self
    }

    fn is_registered_agent(&self, record: &Record) -> bool {
        record
            .get_str(NORMALIZED_STREET_FIELD)
            .map(|street| self.registered_agents.contains(street))
            .unwrap_or(false)
    }

    /// Attach the normalized street line to every record and (re)build
    /// the full-text view over it.
    pub fn setup(&self) -> Result<()> {
        let records = self.store.scan(&self.collection, None)?;
        for record in &records {
            let Some(street) = record.text(&self.fields.street) else {
                continue;
            };
            let normalized = normalize_address(&street);
            if record.get_str(NORMALIZED_STREET_FIELD) == Some(normalized.as_str()) {
                continue;
            }
            let mut patch = Fields::new();
            patch.insert(
                NORMALIZED_STREET_FIELD.to_string(),
                Value::String(normalized),
            );
            self.store
                .merge_fields(&self.collection, &record.id, &patch)?;
        }
        self.store.ensure_text_index(
            &self.view,
            &self.collection,
            &[
                NORMALIZED_STREET_FIELD.to_string(),
                self.fields.city.clone(),
                self.fields.postal_code.clone(),
            ],
        )?;
        Ok(())
    }

    /// Run setup, blocking, scoring, edges, and optional clustering.
    pub fn run(&self, cancel: &CancellationToken) -> Result<AddressReport> {
        let started = Instant::now();
        let mut report = AddressReport::default();
        self.setup()?;

        let records = self.store.scan(&self.collection, None)?;
        report.records = records.len();
        let by_id: std::collections::HashMap<&str, &Record> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();

        // BM25 blocking over the normalized street line, constrained by
        // state equality, excluding registered-agent addresses.
        let mut collector = PairCollector::new("address_bm25");
        let mut candidates = Vec::new();
        for record in &records {
            if cancel.is_cancelled() {
                break;
            }
            if self.is_registered_agent(record) {
                report.registered_agents_skipped += 1;
                continue;
            }
            let Some(street) = record.get_str(NORMALIZED_STREET_FIELD) else {
                continue;
            };
            let mut terms: Vec<&str> = street.split_whitespace().collect();
            terms.dedup();
            if terms.is_empty() {
                continue;
            }
            let query = terms
                .iter()
                .map(|t| format!("\"{}\"", t.replace('"', "")))
                .collect::<Vec<_>>()
                .join(" OR ");
            let hits = self
                .store
                .search_text(&self.view, &query, self.limit_per_entity + 1)?;
            for hit in hits {
                if hit.id == record.id || hit.score < self.bm25_threshold {
                    continue;
                }
                let Some(other) = by_id.get(hit.id.as_str()) else {
                    continue;
                };
                if self.is_registered_agent(other) {
                    continue;
                }
                if !same_text(record, other, &self.fields.state) {
                    continue;
                }
                if let Some(pair) = collector.push_pair(&record.id, &hit.id, &mut candidates) {
                    pair.bm25_score = Some(hit.score);
                }
            }
        }
        report.candidates = candidates.len();
        debug!(candidates = report.candidates, "address blocking complete");

        // Weighted scoring over normalized street, city, and ZIP.
        let weights: BTreeMap<String, f64> = [
            (NORMALIZED_STREET_FIELD.to_string(), 0.6),
            (self.fields.city.clone(), 0.2),
            (self.fields.postal_code.clone(), 0.2),
        ]
        .into_iter()
        .collect();
        let kernel = FieldSimilarity::new(SimilarityAlgorithm::JaroWinkler, weights);

        let mut matches = Vec::new();
        for pair in &candidates {
            let (Some(a), Some(b)) = (by_id.get(pair.a.as_str()), by_id.get(pair.b.as_str()))
            else {
                continue;
            };
            let score = kernel.score(a, b);
            if score.confidence < self.similarity_threshold {
                continue;
            }
            matches.push(ScoredMatch {
                a: pair.a.clone(),
                b: pair.b.clone(),
                confidence: score.confidence,
                decision: MatchDecision::Match,
                field_scores: score.field_scores,
            });
        }
        report.matches = matches.len();

        let materializer = EdgeMaterializer::new(
            self.store.clone(),
            self.edge_collection.clone(),
            self.collection.clone(),
            "address_er",
        )?;
        let edge_stats = materializer.create_edges(&matches, false, cancel)?;
        report.edges_created = edge_stats.created;
        report.edges_merged = edge_stats.merged;

        if let Some(cluster_config) = &self.clustering {
            let clusters = self.discover_clusters(cluster_config.clone())?;
            report.clusters = clusters.len();
        }

        report.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            records = report.records,
            candidates = report.candidates,
            matches = report.matches,
            "address resolution complete"
        );
        Ok(report)
    }

    fn discover_clusters(&self, config: ClusteringConfig) -> Result<Vec<Cluster>> {
        let service = ClusteringService::new(
            self.store.clone(),
            self.edge_collection.clone(),
            config,
        )?
        .with_vertex_collection(self.collection.clone())?;
        let (clusters, _) = service.discover()?;
        Ok(clusters)
    }
}

fn same_text(a: &Record, b: &Record, field: &str) -> bool {
    match (a.text(field), b.text(field)) {
        (Some(va), Some(vb)) => va.eq_ignore_ascii_case(&vb),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{OpenStore, SqliteStore};
    use serde_json::json;

    // === Normalization expands abbreviations and directionals ===

    #[test]
    fn normalization_expands_street_tokens() {
        assert_eq!(normalize_address("123 N. Main St."), "123 north main street");
        assert_eq!(
            normalize_address("500 W 5th Ave, Ste 200"),
            "500 west 5th avenue suite 200"
        );
        assert_eq!(normalize_address("1 SE Pkwy"), "1 southeast parkway");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_address("123 N. Main St.");
        assert_eq!(normalize_address(&once), once);
    }

    fn seeded() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many(
                "addresses",
                &[
                    Record::from_value("a1", json!({"street": "123 N Main St", "city": "Austin", "state": "TX", "postal_code": "78701"})),
                    Record::from_value("a2", json!({"street": "123 North Main Street", "city": "Austin", "state": "TX", "postal_code": "78701"})),
                    Record::from_value("a3", json!({"street": "999 Oak Blvd", "city": "Dallas", "state": "TX", "postal_code": "75201"})),
                    // Registered-agent address shared by unrelated companies
                    Record::from_value("a4", json!({"street": "251 Little Falls Dr", "city": "Wilmington", "state": "DE", "postal_code": "19808"})),
                    Record::from_value("a5", json!({"street": "251 Little Falls Drive", "city": "Wilmington", "state": "DE", "postal_code": "19808"})),
                ],
            )
            .unwrap();
        Arc::new(store)
    }

    // === Scenario: normalized street variants merge, agents stay out ===

    #[test]
    fn resolves_equivalent_addresses_and_skips_agents() {
        let store = seeded();
        let resolver = AddressResolver::new(store.clone(), "addresses")
            .unwrap()
            .with_registered_agents(["251 Little Falls Dr".to_string()])
            .with_clustering(ClusteringConfig::default());

        let report = resolver.run(&CancellationToken::new()).unwrap();
        assert_eq!(report.records, 5);
        assert_eq!(report.registered_agents_skipped, 2, "both agent rows skip");
        assert!(report.matches >= 1);
        assert_eq!(report.clusters, 1);

        let edges = store.fetch_edges_above("address_similarTo", 0.0).unwrap();
        assert!(edges
            .iter()
            .all(|e| !e.from_id.contains("a4") && !e.to_id.contains("a4")));
        assert!(edges
            .iter()
            .any(|e| e.from_id == "addresses/a1" && e.to_id == "addresses/a2"
                || e.from_id == "addresses/a2" && e.to_id == "addresses/a1"));
    }

    // === Setup attaches the derived normalized field ===

    #[test]
    fn setup_materializes_normalized_street() {
        let store = seeded();
        let resolver = AddressResolver::new(store.clone(), "addresses").unwrap();
        resolver.setup().unwrap();
        let a1 = store.get("addresses", "a1").unwrap().unwrap();
        assert_eq!(
            a1.get_str("_street_norm"),
            Some("123 north main street")
        );
        // Derived field is system-scoped, so golden records ignore it.
        assert!(crate::record::is_system_field("_street_norm"));
    }
}
