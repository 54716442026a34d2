//! Similarity scoring over candidate pairs
//!
//! The batch scorer (same-collection) and the cross-collection matcher
//! both reduce to: fetch the fields being scored in bulk, run the field
//! similarity kernel, and keep pairs that clear the confidence
//! threshold.

mod cross;
mod scorer;

pub use cross::{CrossBlocking, CrossCollectionMatcher, CrossMatchStats};
pub use scorer::{BatchScorer, ScoringStats, SimilarityConfig};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Three-way match decision in the Fellegi–Sunter style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Match,
    PossibleMatch,
    NonMatch,
}

/// A candidate pair that cleared the scoring threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMatch {
    pub a: String,
    pub b: String,
    /// Weighted confidence in `[0, 1]`.
    pub confidence: f64,
    pub decision: MatchDecision,
    pub field_scores: BTreeMap<String, f64>,
}
