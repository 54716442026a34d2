//! BM25 fuzzy blocking
//!
//! For each record, issues a full-text query built from its own field
//! tokens and keeps the top hits whose BM25 score clears the threshold,
//! optionally constrained by equality on another blocking field.
//!
//! BM25 thresholds are backend-calibrated: the score scale depends on
//! the store's ranking implementation, not on this strategy.

use super::{BlockingStats, BlockingStrategy, CandidatePair, PairCollector};
use crate::enrich::AcronymExpander;
use crate::error::Result;
use crate::record::Record;
use crate::storage::EntityStore;
use crate::validate::{normalize_for_comparison, validate_collection_name, validate_field_name, validate_view_name};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub struct Bm25Strategy {
    store: Arc<dyn EntityStore>,
    collection: String,
    view: String,
    search_fields: Vec<String>,
    threshold: f64,
    limit_per_entity: usize,
    constraint_field: Option<String>,
    acronyms: Option<AcronymExpander>,
    collector: PairCollector,
}

impl Bm25Strategy {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collection: impl Into<String>,
        view: impl Into<String>,
        search_fields: Vec<String>,
    ) -> Result<Self> {
        let collection = collection.into();
        let view = view.into();
        validate_collection_name(&collection)?;
        validate_view_name(&view)?;
        for field in &search_fields {
            validate_field_name(field)?;
        }
        Ok(Self {
            store,
            collection,
            view,
            search_fields,
            threshold: 0.1,
            limit_per_entity: 10,
            constraint_field: None,
            acronyms: None,
            collector: PairCollector::new("bm25"),
        })
    }

    /// Minimum BM25 score for a hit to become a candidate.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Cap on hits kept per record.
    pub fn with_limit_per_entity(mut self, limit: usize) -> Self {
        self.limit_per_entity = limit.max(1);
        self
    }

    /// Require equality on another field (e.g. `state`) for every pair.
    pub fn with_constraint(mut self, field: impl Into<String>) -> Result<Self> {
        let field = field.into();
        validate_field_name(&field)?;
        self.constraint_field = Some(field);
        Ok(self)
    }

    /// Expand domain acronyms into the query term set.
    pub fn with_acronyms(mut self, acronyms: AcronymExpander) -> Self {
        self.acronyms = Some(acronyms);
        self
    }

    /// (Re)build the full-text view this strategy searches.
    pub fn ensure_view(&self) -> Result<()> {
        Ok(self
            .store
            .ensure_text_index(&self.view, &self.collection, &self.search_fields)?)
    }

    /// Query tokens for one record: normalized tokens of the search
    /// fields, acronym-expanded when a dictionary is configured.
    fn query_terms(&self, record: &Record) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for field in &self.search_fields {
            if let Some(text) = record.text(field) {
                for token in normalize_for_comparison(&text).split_whitespace() {
                    if !terms.iter().any(|t| t == token) {
                        terms.push(token.to_string());
                    }
                }
            }
        }
        match &self.acronyms {
            Some(expander) => expander.expand_terms(&terms),
            None => terms,
        }
    }

    fn constraint_matches(&self, a: &Record, b: &Record) -> bool {
        let Some(field) = &self.constraint_field else {
            return true;
        };
        match (a.text(field), b.text(field)) {
            (Some(va), Some(vb)) => {
                normalize_for_comparison(&va) == normalize_for_comparison(&vb)
            }
            _ => false,
        }
    }
}

/// Escape a token for a full-text MATCH expression.
fn fts_quote(token: &str) -> String {
    format!("\"{}\"", token.replace('"', ""))
}

impl BlockingStrategy for Bm25Strategy {
    fn name(&self) -> &str {
        "bm25"
    }

    fn generate_candidates(&mut self) -> Result<Vec<CandidatePair>> {
        let started = Instant::now();
        let records = self.store.scan(&self.collection, None)?;
        self.collector.stats_mut().records_scanned += records.len();
        let by_id: HashMap<&str, &Record> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut out = Vec::new();
        for record in &records {
            let terms = self.query_terms(record);
            if terms.is_empty() {
                continue;
            }
            let query = terms
                .iter()
                .map(|t| fts_quote(t))
                .collect::<Vec<_>>()
                .join(" OR ");
            // One extra hit to absorb the record matching itself.
            let hits = self
                .store
                .search_text(&self.view, &query, self.limit_per_entity + 1)?;

            for hit in hits {
                if hit.id == record.id || hit.score < self.threshold {
                    continue;
                }
                let Some(other) = by_id.get(hit.id.as_str()) else {
                    continue;
                };
                if !self.constraint_matches(record, other) {
                    continue;
                }
                if let Some(pair) = self.collector.push_pair(&record.id, &hit.id, &mut out) {
                    pair.bm25_score = Some(hit.score);
                }
            }
        }
        self.collector.stats_mut().elapsed_secs += started.elapsed().as_secs_f64();
        Ok(out)
    }

    fn statistics(&self) -> &BlockingStats {
        self.collector.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{OpenStore, SqliteStore};
    use serde_json::json;

    fn seeded() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many(
                "companies",
                &[
                    Record::from_value("rA", json!({"company": "Acme Corp", "state": "NY"})),
                    Record::from_value("rB", json!({"company": "Acme Corporation", "state": "NY"})),
                    Record::from_value("rC", json!({"company": "Acme Corp", "state": "TX"})),
                    Record::from_value("r1", json!({"company": "Zenith Widgets", "state": "CA"})),
                    Record::from_value("r2", json!({"company": "Globex Industrial", "state": "CA"})),
                    Record::from_value("r3", json!({"company": "Initech Software", "state": "WA"})),
                    Record::from_value("r4", json!({"company": "Umbrella Logistics", "state": "OR"})),
                ],
            )
            .unwrap();
        Arc::new(store)
    }

    fn strategy(store: Arc<SqliteStore>) -> Bm25Strategy {
        let s = Bm25Strategy::new(store, "companies", "company_view", vec!["company".to_string()])
            .unwrap()
            .with_threshold(1e-6)
            .with_limit_per_entity(5);
        s.ensure_view().unwrap();
        s
    }

    // === Scenario: state constraint rejects the cross-state pair ===

    #[test]
    fn state_constraint_rejects_cross_state_pairs() {
        let mut s = strategy(seeded()).with_constraint("state").unwrap();
        let pairs = s.generate_candidates().unwrap();
        let ids: Vec<(&str, &str)> = pairs.iter().map(CandidatePair::id_pair).collect();
        assert!(ids.contains(&("rA", "rB")), "same-state fuzzy pair kept: {ids:?}");
        assert!(!ids.contains(&("rA", "rC")), "cross-state pair rejected");
        assert!(!ids.contains(&("rB", "rC")), "cross-state pair rejected");
    }

    // === Invariant: no emitted pair scores below the threshold ===

    #[test]
    fn hits_below_threshold_are_dropped() {
        let mut s = strategy(seeded()).with_threshold(f64::MAX);
        let pairs = s.generate_candidates().unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn emitted_pairs_carry_their_bm25_score() {
        let mut s = strategy(seeded());
        let pairs = s.generate_candidates().unwrap();
        assert!(!pairs.is_empty());
        for pair in &pairs {
            let score = pair.bm25_score.expect("bm25 score recorded");
            assert!(score >= 1e-6);
            assert_eq!(pair.strategy, "bm25");
        }
    }

    #[test]
    fn fts_quote_strips_embedded_quotes() {
        assert_eq!(fts_quote("acme"), "\"acme\"");
        assert_eq!(fts_quote("ac\"me"), "\"acme\"");
    }
}
