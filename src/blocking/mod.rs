//! Blocking strategy family
//!
//! Every strategy produces candidate pairs behind the same trait:
//! canonical pair order (`a < b`), deduplication across invocations,
//! and block-size bounds are enforced centrally by `PairCollector`.
//! The orchestrator unions strategy outputs as a set.

mod bm25;
mod composite;
mod geographic;
mod hybrid;
mod lsh;
mod traversal;
mod vector;

pub use bm25::Bm25Strategy;
pub use composite::CompositeKeyStrategy;
pub use geographic::{GeographicFields, GeographicStrategy, RadiusCheck};
pub use hybrid::HybridStrategy;
pub use lsh::LshStrategy;
pub use traversal::GraphTraversalStrategy;
pub use vector::VectorStrategy;

use crate::error::Result;
use crate::record::Fields;
use serde::Serialize;
use std::collections::HashSet;
use tracing::warn;

/// A record pair worth scoring, held in memory between blocking and
/// similarity. `a < b` lexicographically, always.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePair {
    pub a: String,
    pub b: String,
    /// The blocking strategy that emitted the pair (or `union`).
    pub strategy: String,
    /// Opaque blocking-key provenance, when the strategy has one.
    pub blocking_keys: Option<Fields>,
    pub bm25_score: Option<f64>,
    pub vector_score: Option<f64>,
}

impl CandidatePair {
    /// Build a pair in canonical order. The two ids must differ.
    pub fn new(x: impl Into<String>, y: impl Into<String>, strategy: impl Into<String>) -> Self {
        let (x, y) = (x.into(), y.into());
        let (a, b) = if x < y { (x, y) } else { (y, x) };
        Self {
            a,
            b,
            strategy: strategy.into(),
            blocking_keys: None,
            bm25_score: None,
            vector_score: None,
        }
    }

    /// The canonical `(a, b)` identity used for set semantics.
    pub fn id_pair(&self) -> (&str, &str) {
        (&self.a, &self.b)
    }
}

/// Per-strategy statistics, surfaced in phase reports.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockingStats {
    pub pairs_emitted: usize,
    pub blocks_processed: usize,
    pub undersize_blocks_skipped: usize,
    pub oversize_blocks_dropped: usize,
    pub duplicates_suppressed: usize,
    pub records_scanned: usize,
    pub elapsed_secs: f64,
}

/// The polymorphic blocking interface.
pub trait BlockingStrategy {
    /// Strategy name, used as the pair tag and in configuration.
    fn name(&self) -> &str;

    /// Produce candidate pairs. Pairs already emitted by this strategy
    /// instance are suppressed on later invocations.
    fn generate_candidates(&mut self) -> Result<Vec<CandidatePair>>;

    /// Statistics accumulated so far.
    fn statistics(&self) -> &BlockingStats;
}

/// Shared pair bookkeeping for strategy implementations: canonical
/// order, cross-invocation dedup, block-size bounds.
pub(crate) struct PairCollector {
    strategy: String,
    seen: HashSet<(String, String)>,
    stats: BlockingStats,
    min_block_size: usize,
    max_block_size: usize,
}

impl PairCollector {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            seen: HashSet::new(),
            stats: BlockingStats::default(),
            min_block_size: 2,
            max_block_size: 100,
        }
    }

    pub fn set_block_bounds(&mut self, min: usize, max: usize) {
        self.min_block_size = min.max(2);
        self.max_block_size = max.max(self.min_block_size);
    }

    pub fn stats(&self) -> &BlockingStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut BlockingStats {
        &mut self.stats
    }

    /// Emit one pair unless it is degenerate or already seen.
    /// Returns a mutable handle for decoration when the pair was kept.
    pub fn push_pair<'a>(
        &mut self,
        x: &str,
        y: &str,
        out: &'a mut Vec<CandidatePair>,
    ) -> Option<&'a mut CandidatePair> {
        if x == y {
            return None;
        }
        let pair = CandidatePair::new(x, y, self.strategy.clone());
        let key = (pair.a.clone(), pair.b.clone());
        if !self.seen.insert(key) {
            self.stats.duplicates_suppressed += 1;
            return None;
        }
        self.stats.pairs_emitted += 1;
        out.push(pair);
        out.last_mut()
    }

    /// Emit all intra-block pairs, enforcing block-size bounds. An
    /// oversize block signals an under-specific key and is dropped
    /// whole.
    pub fn push_block(
        &mut self,
        blocking_keys: Option<&Fields>,
        members: &[String],
        out: &mut Vec<CandidatePair>,
    ) {
        self.stats.blocks_processed += 1;
        if members.len() < self.min_block_size {
            self.stats.undersize_blocks_skipped += 1;
            return;
        }
        if members.len() > self.max_block_size {
            warn!(
                strategy = %self.strategy,
                size = members.len(),
                max = self.max_block_size,
                "oversize block dropped"
            );
            self.stats.oversize_blocks_dropped += 1;
            return;
        }
        for (i, x) in members.iter().enumerate() {
            for y in &members[i + 1..] {
                if let Some(pair) = self.push_pair(x, y, out) {
                    pair.blocking_keys = blocking_keys.cloned();
                }
            }
        }
    }
}

/// Deduplicated set-union of several strategies' outputs.
///
/// The first occurrence of a pair is kept; a pair produced by more than
/// one strategy is re-tagged `union`.
pub fn union_candidates(outputs: Vec<Vec<CandidatePair>>) -> Vec<CandidatePair> {
    let mut seen: std::collections::HashMap<(String, String), usize> =
        std::collections::HashMap::new();
    let mut merged: Vec<CandidatePair> = Vec::new();
    for pairs in outputs {
        for pair in pairs {
            let key = (pair.a.clone(), pair.b.clone());
            match seen.get(&key) {
                Some(&idx) => merged[idx].strategy = "union".to_string(),
                None => {
                    seen.insert(key, merged.len());
                    merged.push(pair);
                }
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(pairs: &[CandidatePair]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|p| (p.a.clone(), p.b.clone()))
            .collect()
    }

    // === Invariant: symmetry-freedom ===

    #[test]
    fn pairs_are_canonically_ordered() {
        let pair = CandidatePair::new("r9", "r2", "collect");
        assert_eq!(pair.id_pair(), ("r2", "r9"));
    }

    #[test]
    fn collector_suppresses_duplicates_and_self_pairs() {
        let mut collector = PairCollector::new("collect");
        let mut out = Vec::new();
        assert!(collector.push_pair("a", "b", &mut out).is_some());
        assert!(collector.push_pair("b", "a", &mut out).is_none(), "reversed duplicate");
        assert!(collector.push_pair("a", "a", &mut out).is_none(), "self pair");
        assert_eq!(out.len(), 1);
        assert_eq!(collector.stats().duplicates_suppressed, 1);
    }

    // === Scenario: oversize block is dropped whole ===

    #[test]
    fn oversize_block_dropped() {
        let mut collector = PairCollector::new("collect");
        collector.set_block_bounds(2, 100);
        let members: Vec<String> = (0..200).map(|i| format!("r{i:03}")).collect();
        let mut out = Vec::new();
        collector.push_block(None, &members, &mut out);
        assert!(out.is_empty());
        assert_eq!(collector.stats().oversize_blocks_dropped, 1);
        assert_eq!(collector.stats().pairs_emitted, 0);
    }

    #[test]
    fn undersize_block_skipped() {
        let mut collector = PairCollector::new("collect");
        let mut out = Vec::new();
        collector.push_block(None, &["only".to_string()], &mut out);
        assert!(out.is_empty());
        assert_eq!(collector.stats().undersize_blocks_skipped, 1);
    }

    #[test]
    fn block_emits_all_intra_block_pairs() {
        let mut collector = PairCollector::new("collect");
        let members = vec!["r1".to_string(), "r2".to_string(), "r3".to_string()];
        let mut out = Vec::new();
        collector.push_block(None, &members, &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(collector.stats().pairs_emitted, 3);
    }

    // === Invariant: union monotonicity ===

    #[test]
    fn union_is_a_deduplicated_set_union() {
        let left = vec![
            CandidatePair::new("r1", "r2", "collect"),
            CandidatePair::new("r2", "r3", "collect"),
        ];
        let right = vec![
            CandidatePair::new("r2", "r1", "bm25"),
            CandidatePair::new("r3", "r4", "bm25"),
        ];
        let merged = union_candidates(vec![left.clone(), right.clone()]);
        assert_eq!(merged.len(), 3);

        let mut expected: Vec<(String, String)> = ids(&left)
            .into_iter()
            .chain(ids(&right))
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        expected.sort();
        let mut got = ids(&merged);
        got.sort();
        assert_eq!(got, expected);

        // Shared pair carries the union tag
        let shared = merged
            .iter()
            .find(|p| p.a == "r1" && p.b == "r2")
            .unwrap();
        assert_eq!(shared.strategy, "union");
    }
}
