//! Batch similarity service
//!
//! Fetches only the fields being scored, in batches, then scores every
//! candidate pair through the field similarity kernel. Pairs whose
//! records have disappeared since blocking are counted and skipped;
//! batch-fetch failures are fatal.

use super::{MatchDecision, ScoredMatch};
use crate::blocking::CandidatePair;
use crate::error::Result;
use crate::pipeline::CancellationToken;
use crate::record::Record;
use crate::similarity::{FieldSimilarity, NullMode, SimilarityAlgorithm};
use crate::storage::EntityStore;
use crate::validate::{validate_collection_name, validate_field_name, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Similarity configuration shared by the scoring services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    #[serde(default)]
    pub algorithm: SimilarityAlgorithm,
    pub field_weights: BTreeMap<String, f64>,
    /// Minimum confidence for a definite match; pairs below every
    /// threshold are dropped.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Optional lower bound for possible matches.
    #[serde(default)]
    pub possible_threshold: Option<f64>,
    #[serde(default)]
    pub null_mode: NullMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fields to bulk-fetch; defaults to the weighted fields.
    #[serde(default)]
    pub fields_to_fetch: Option<Vec<String>>,
}

fn default_threshold() -> f64 {
    0.85
}

fn default_batch_size() -> usize {
    5000
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            algorithm: SimilarityAlgorithm::default(),
            field_weights: BTreeMap::new(),
            threshold: default_threshold(),
            possible_threshold: None,
            null_mode: NullMode::default(),
            batch_size: default_batch_size(),
            fields_to_fetch: None,
        }
    }
}

impl SimilarityConfig {
    /// The kernel configured by this section.
    pub fn kernel(&self) -> Result<FieldSimilarity> {
        if self.field_weights.is_empty() {
            return Err(
                ValidationError::Config("similarity requires field_weights".into()).into(),
            );
        }
        for field in self.field_weights.keys() {
            validate_field_name(field)?;
        }
        Ok(
            FieldSimilarity::new(self.algorithm, self.field_weights.clone())
                .with_null_mode(self.null_mode),
        )
    }

    /// Fields the scorer needs from the store.
    pub fn fetch_fields(&self) -> Vec<String> {
        match &self.fields_to_fetch {
            Some(fields) => fields.clone(),
            None => self.field_weights.keys().cloned().collect(),
        }
    }

    /// Classify a confidence value.
    pub fn decide(&self, confidence: f64) -> MatchDecision {
        if confidence >= self.threshold {
            MatchDecision::Match
        } else if self
            .possible_threshold
            .is_some_and(|p| confidence >= p)
        {
            MatchDecision::PossibleMatch
        } else {
            MatchDecision::NonMatch
        }
    }
}

/// Statistics for one scoring run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoringStats {
    pub pairs_in: usize,
    pub pairs_missing_side: usize,
    pub matches_out: usize,
    pub possible_out: usize,
    pub elapsed_secs: f64,
    pub pairs_per_sec: f64,
}

/// Scores candidate pairs within one collection.
pub struct BatchScorer {
    store: Arc<dyn EntityStore>,
    collection: String,
    config: SimilarityConfig,
    kernel: FieldSimilarity,
}

impl BatchScorer {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collection: impl Into<String>,
        config: SimilarityConfig,
    ) -> Result<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        let kernel = config.kernel()?;
        Ok(Self {
            store,
            collection,
            config,
            kernel,
        })
    }

    /// Score every pair; emit those at or above the thresholds.
    pub fn score_pairs(
        &self,
        pairs: &[CandidatePair],
        cancel: &CancellationToken,
    ) -> Result<(Vec<ScoredMatch>, ScoringStats)> {
        let started = Instant::now();
        let mut stats = ScoringStats {
            pairs_in: pairs.len(),
            ..ScoringStats::default()
        };

        let ids: Vec<String> = pairs
            .iter()
            .flat_map(|p| [p.a.clone(), p.b.clone()])
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let fetch_fields = self.config.fetch_fields();

        let mut records: HashMap<String, Record> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                break;
            }
            let fetched = self
                .store
                .fetch_many(&self.collection, chunk, Some(&fetch_fields))?;
            debug!(batch = chunk.len(), fetched = fetched.len(), "scoring fetch batch");
            for record in fetched {
                records.insert(record.id.clone(), record);
            }
        }

        let mut matches = Vec::new();
        for pair in pairs {
            if cancel.is_cancelled() {
                break;
            }
            let (Some(a), Some(b)) = (records.get(&pair.a), records.get(&pair.b)) else {
                stats.pairs_missing_side += 1;
                continue;
            };
            let score = self.kernel.score(a, b);
            let decision = self.config.decide(score.confidence);
            match decision {
                MatchDecision::Match => stats.matches_out += 1,
                MatchDecision::PossibleMatch => stats.possible_out += 1,
                MatchDecision::NonMatch => continue,
            }
            matches.push(ScoredMatch {
                a: pair.a.clone(),
                b: pair.b.clone(),
                confidence: score.confidence,
                decision,
                field_scores: score.field_scores,
            });
        }

        stats.elapsed_secs = started.elapsed().as_secs_f64();
        stats.pairs_per_sec = if stats.elapsed_secs > 0.0 {
            stats.pairs_in as f64 / stats.elapsed_secs
        } else {
            0.0
        };
        info!(
            pairs = stats.pairs_in,
            matches = stats.matches_out,
            possible = stats.possible_out,
            missing = stats.pairs_missing_side,
            "similarity scoring complete"
        );
        Ok((matches, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{OpenStore, SqliteStore};
    use serde_json::json;

    fn config(threshold: f64) -> SimilarityConfig {
        SimilarityConfig {
            field_weights: [("name".to_string(), 1.0)].into_iter().collect(),
            threshold,
            ..SimilarityConfig::default()
        }
    }

    fn seeded() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many(
                "people",
                &[
                    Record::from_value("r1", json!({"name": "John Smith", "state": "CA"})),
                    Record::from_value("r2", json!({"name": "Jon Smith", "state": "CA"})),
                    Record::from_value("r3", json!({"name": "Entirely Different", "state": "CA"})),
                ],
            )
            .unwrap();
        Arc::new(store)
    }

    fn pairs(specs: &[(&str, &str)]) -> Vec<CandidatePair> {
        specs
            .iter()
            .map(|(a, b)| CandidatePair::new(*a, *b, "collect"))
            .collect()
    }

    // === Scenario: close names match, distant names drop ===

    #[test]
    fn scores_and_filters_by_threshold() {
        let scorer = BatchScorer::new(seeded(), "people", config(0.75)).unwrap();
        let (matches, stats) = scorer
            .score_pairs(
                &pairs(&[("r1", "r2"), ("r1", "r3"), ("r2", "r3")]),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].a.as_str(), matches[0].b.as_str()), ("r1", "r2"));
        assert!(matches[0].confidence > 0.8);
        assert_eq!(matches[0].decision, MatchDecision::Match);
        assert!(matches[0].field_scores.contains_key("name"));
        assert_eq!(stats.pairs_in, 3);
        assert_eq!(stats.matches_out, 1);
    }

    // === Scenario: a vanished record is counted, not fatal ===

    #[test]
    fn missing_side_is_counted_and_skipped() {
        let scorer = BatchScorer::new(seeded(), "people", config(0.5)).unwrap();
        let (matches, stats) = scorer
            .score_pairs(&pairs(&[("r1", "ghost")]), &CancellationToken::new())
            .unwrap();
        assert!(matches.is_empty());
        assert_eq!(stats.pairs_missing_side, 1);
    }

    // === Scenario: possible-match band ===

    #[test]
    fn possible_threshold_emits_middle_band() {
        let mut cfg = config(0.99);
        cfg.possible_threshold = Some(0.75);
        let scorer = BatchScorer::new(seeded(), "people", cfg).unwrap();
        let (matches, stats) = scorer
            .score_pairs(&pairs(&[("r1", "r2")]), &CancellationToken::new())
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].decision, MatchDecision::PossibleMatch);
        assert_eq!(stats.possible_out, 1);
        assert_eq!(stats.matches_out, 0);
    }

    #[test]
    fn empty_weights_is_a_configuration_error() {
        let cfg = SimilarityConfig::default();
        assert!(BatchScorer::new(seeded(), "people", cfg).is_err());
    }

    #[test]
    fn cancellation_stops_scoring() {
        let scorer = BatchScorer::new(seeded(), "people", config(0.5)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (matches, _) = scorer
            .score_pairs(&pairs(&[("r1", "r2")]), &cancel)
            .unwrap();
        assert!(matches.is_empty());
    }
}
