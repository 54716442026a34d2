//! Hybrid blocking: BM25 recall, edit-distance precision
//!
//! Runs BM25 blocking for cheap recall, then verifies every candidate
//! with a Levenshtein similarity check on a chosen field. Orders of
//! magnitude faster than pairwise edit distance while keeping its
//! precision on the candidate set.

use super::{Bm25Strategy, BlockingStats, BlockingStrategy, CandidatePair, PairCollector};
use crate::error::Result;
use crate::similarity::levenshtein_similarity;
use crate::storage::EntityStore;
use crate::validate::{normalize_for_comparison, validate_field_name};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

pub struct HybridStrategy {
    store: Arc<dyn EntityStore>,
    collection: String,
    bm25: Bm25Strategy,
    verify_field: String,
    verify_threshold: f64,
    collector: PairCollector,
}

impl HybridStrategy {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collection: impl Into<String>,
        bm25: Bm25Strategy,
        verify_field: impl Into<String>,
    ) -> Result<Self> {
        let verify_field = verify_field.into();
        validate_field_name(&verify_field)?;
        Ok(Self {
            store,
            collection: collection.into(),
            bm25,
            verify_field,
            verify_threshold: 0.8,
            collector: PairCollector::new("hybrid"),
        })
    }

    /// Minimum Levenshtein similarity for a BM25 candidate to survive.
    pub fn with_verify_threshold(mut self, threshold: f64) -> Self {
        self.verify_threshold = threshold;
        self
    }

    /// (Re)build the underlying full-text view.
    pub fn ensure_view(&self) -> Result<()> {
        self.bm25.ensure_view()
    }
}

impl BlockingStrategy for HybridStrategy {
    fn name(&self) -> &str {
        "hybrid"
    }

    fn generate_candidates(&mut self) -> Result<Vec<CandidatePair>> {
        let started = Instant::now();
        let candidates = self.bm25.generate_candidates()?;

        let ids: Vec<String> = candidates
            .iter()
            .flat_map(|p| [p.a.clone(), p.b.clone()])
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let records = self.store.fetch_many(
            &self.collection,
            &ids,
            Some(&[self.verify_field.clone()]),
        )?;
        let values: HashMap<String, String> = records
            .iter()
            .filter_map(|r| {
                r.text(&self.verify_field)
                    .map(|v| (r.id.clone(), normalize_for_comparison(&v)))
            })
            .collect();

        let mut out = Vec::new();
        for candidate in candidates {
            let (Some(va), Some(vb)) = (values.get(&candidate.a), values.get(&candidate.b))
            else {
                continue;
            };
            if levenshtein_similarity(va, vb) < self.verify_threshold {
                continue;
            }
            if let Some(pair) = self
                .collector
                .push_pair(&candidate.a, &candidate.b, &mut out)
            {
                pair.bm25_score = candidate.bm25_score;
            }
        }
        self.collector.stats_mut().records_scanned += ids.len();
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
    use crate::record::Record;
    use crate::storage::{OpenStore, SqliteStore};
    use serde_json::json;

    fn seeded() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many(
                "companies",
                &[
                    Record::from_value("rA", json!({"company": "Acme Corp"})),
                    Record::from_value("rB", json!({"company": "Acme Corpp"})),
                    // Shares the "acme" token but is not an edit-distance match
                    Record::from_value("rC", json!({"company": "Acme Holdings International Group"})),
                    Record::from_value("r1", json!({"company": "Zenith Widgets"})),
                    Record::from_value("r2", json!({"company": "Globex Industrial"})),
                ],
            )
            .unwrap();
        Arc::new(store)
    }

    // === Scenario: edit-distance verification prunes fuzzy BM25 hits ===

    #[test]
    fn verification_prunes_low_similarity_candidates() {
        let store = seeded();
        let bm25 = Bm25Strategy::new(
            store.clone(),
            "companies",
            "company_view",
            vec!["company".to_string()],
        )
        .unwrap()
        .with_threshold(1e-6);
        let mut hybrid = HybridStrategy::new(store, "companies", bm25, "company")
            .unwrap()
            .with_verify_threshold(0.8);
        hybrid.ensure_view().unwrap();

        let pairs = hybrid.generate_candidates().unwrap();
        let ids: Vec<(&str, &str)> = pairs.iter().map(CandidatePair::id_pair).collect();
        assert!(ids.contains(&("rA", "rB")), "{ids:?}");
        assert!(!ids.contains(&("rA", "rC")), "long mismatch pruned: {ids:?}");
        for pair in &pairs {
            assert_eq!(pair.strategy, "hybrid");
        }
    }
}
