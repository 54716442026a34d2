//! Locality-sensitive hashing via random hyperplane projections
//!
//! Each table hashes a vector to the sign pattern of its dot products
//! with that table's hyperplanes. Vectors colliding in any table are
//! candidates; exact cosine similarity ranks them.
//!
//! Hyperplanes are drawn from `StdRng` seeded with the configured seed,
//! so signatures are stable across runs for a pinned rand version.

use super::{cosine_similarity, sort_hits};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// LSH tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LshConfig {
    pub num_tables: usize,
    pub num_hyperplanes: usize,
    pub seed: u64,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            num_tables: 4,
            num_hyperplanes: 12,
            seed: 42,
        }
    }
}

/// An in-memory LSH index over `(id, vector)` entries.
pub struct LshIndex {
    config: LshConfig,
    /// `[table][hyperplane][component]`
    hyperplanes: Vec<Vec<Vec<f32>>>,
    /// Signature → entry indices, per table.
    tables: Vec<HashMap<u64, Vec<usize>>>,
    entries: Vec<(String, Vec<f32>)>,
}

impl LshIndex {
    /// Build the index. Hyperplane sampling order is fixed, so the same
    /// entries, config, and seed produce the same buckets.
    pub fn build(entries: Vec<(String, Vec<f32>)>, config: LshConfig) -> Self {
        let dim = entries.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let hyperplanes: Vec<Vec<Vec<f32>>> = (0..config.num_tables)
            .map(|_| {
                (0..config.num_hyperplanes)
                    .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
                    .collect()
            })
            .collect();

        let mut tables: Vec<HashMap<u64, Vec<usize>>> = vec![HashMap::new(); config.num_tables];
        for (entry_idx, (_, vector)) in entries.iter().enumerate() {
            for (table_idx, table) in tables.iter_mut().enumerate() {
                let sig = signature(&hyperplanes[table_idx], vector);
                table.entry(sig).or_default().push(entry_idx);
            }
        }

        Self {
            config,
            hyperplanes,
            tables,
            entries,
        }
    }

    pub fn config(&self) -> &LshConfig {
        &self.config
    }

    pub fn entries(&self) -> &[(String, Vec<f32>)] {
        &self.entries
    }

    /// Entry indices colliding with `query` in any table, ascending.
    pub fn candidates(&self, query: &[f32]) -> Vec<usize> {
        let mut seen = HashSet::new();
        for (table_idx, table) in self.tables.iter().enumerate() {
            let sig = signature(&self.hyperplanes[table_idx], query);
            if let Some(bucket) = table.get(&sig) {
                seen.extend(bucket.iter().copied());
            }
        }
        let mut out: Vec<usize> = seen.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// Nearest neighbours among colliding candidates, ranked by exact
    /// cosine similarity.
    pub fn nearest(&self, query: &[f32], k: usize, min_similarity: f32) -> Vec<(String, f32)> {
        let mut hits: Vec<(String, f32)> = self
            .candidates(query)
            .into_iter()
            .map(|idx| {
                let (id, vector) = &self.entries[idx];
                (id.clone(), cosine_similarity(query, vector))
            })
            .filter(|(_, s)| *s >= min_similarity)
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    /// All entry-index pairs that collide in at least one table,
    /// canonically ordered and deduplicated. Used as a fast blocking
    /// pre-filter.
    pub fn colliding_pairs(&self) -> Vec<(usize, usize)> {
        let mut pairs = HashSet::new();
        for table in &self.tables {
            for bucket in table.values() {
                for (i, &a) in bucket.iter().enumerate() {
                    for &b in &bucket[i + 1..] {
                        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
                        pairs.insert((lo, hi));
                    }
                }
            }
        }
        let mut out: Vec<(usize, usize)> = pairs.into_iter().collect();
        out.sort_unstable();
        out
    }
}

fn signature(hyperplanes: &[Vec<f32>], vector: &[f32]) -> u64 {
    let mut sig = 0u64;
    for (bit, plane) in hyperplanes.iter().enumerate() {
        let dot: f32 = plane.iter().zip(vector.iter()).map(|(p, v)| p * v).sum();
        if dot >= 0.0 {
            sig |= 1 << (bit % 64);
        }
    }
    sig
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<(String, Vec<f32>)> {
        vec![
            ("a".to_string(), vec![1.0, 0.0, 0.0]),
            ("b".to_string(), vec![0.98, 0.02, 0.0]),
            ("c".to_string(), vec![-1.0, 0.0, 0.0]),
            ("d".to_string(), vec![0.0, 1.0, 0.0]),
        ]
    }

    // === Determinism under a fixed seed ===

    #[test]
    fn same_seed_same_buckets() {
        let config = LshConfig {
            num_tables: 4,
            num_hyperplanes: 8,
            seed: 123,
        };
        let first = LshIndex::build(entries(), config);
        let second = LshIndex::build(entries(), config);
        assert_eq!(first.colliding_pairs(), second.colliding_pairs());
        assert_eq!(
            first.candidates(&[1.0, 0.0, 0.0]),
            second.candidates(&[1.0, 0.0, 0.0])
        );
    }

    #[test]
    fn different_seed_may_change_buckets() {
        // Not guaranteed to differ for every seed pair; just assert both run.
        let a = LshIndex::build(entries(), LshConfig { seed: 1, ..LshConfig::default() });
        let b = LshIndex::build(entries(), LshConfig { seed: 2, ..LshConfig::default() });
        a.colliding_pairs();
        b.colliding_pairs();
    }

    // === Nearly-parallel vectors collide; opposite vectors do not ===

    #[test]
    fn parallel_vectors_collide() {
        let index = LshIndex::build(
            entries(),
            LshConfig {
                num_tables: 8,
                num_hyperplanes: 6,
                seed: 5,
            },
        );
        let pairs = index.colliding_pairs();
        // a (idx 0) and b (idx 1) are nearly identical directions
        assert!(
            pairs.contains(&(0, 1)),
            "near-parallel vectors should share a bucket: {pairs:?}"
        );
        let hits = index.nearest(&[1.0, 0.0, 0.0], 10, 0.9);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"a") && ids.contains(&"b"));
        assert!(!ids.contains(&"c"));
    }

    #[test]
    fn empty_index_yields_nothing() {
        let index = LshIndex::build(Vec::new(), LshConfig::default());
        assert!(index.candidates(&[1.0, 0.0]).is_empty());
        assert!(index.nearest(&[1.0, 0.0], 5, 0.0).is_empty());
        assert!(index.colliding_pairs().is_empty());
    }
}
