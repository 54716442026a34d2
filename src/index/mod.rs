//! Approximate nearest-neighbour adapter
//!
//! One `nearest()` surface over three backends, chosen once at
//! construction and invisible to callers:
//!
//! 1. native vector search, when the store supports it;
//! 2. an LSH index probed by random-hyperplane signatures;
//! 3. brute-force cosine over all embedded records.

mod lsh;

pub use lsh::{LshConfig, LshIndex};

use crate::storage::{EntityStore, StorageResult};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Sort hits by descending similarity, ties broken by id for
/// deterministic output.
fn sort_hits(hits: &mut Vec<(String, f32)>) {
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

enum Backend {
    Native,
    Lsh(LshIndex),
    Brute(Vec<(String, Vec<f32>)>),
}

/// Nearest-neighbour index over one collection's embeddings.
pub struct NeighborIndex {
    store: Arc<dyn EntityStore>,
    collection: String,
    field: String,
    backend: Backend,
}

impl NeighborIndex {
    /// Build the index, selecting the backend once: native vector
    /// search if the store offers it, LSH when configured, brute-force
    /// cosine otherwise.
    pub fn build(
        store: Arc<dyn EntityStore>,
        collection: impl Into<String>,
        field: impl Into<String>,
        lsh: Option<LshConfig>,
    ) -> StorageResult<Self> {
        let collection = collection.into();
        let field = field.into();
        let backend = if store.supports_native_vector() {
            debug!(%collection, "neighbour index: native vector search");
            Backend::Native
        } else if let Some(config) = lsh {
            let entries = store.fetch_embeddings(&collection, &field)?;
            debug!(%collection, entries = entries.len(), "neighbour index: LSH");
            Backend::Lsh(LshIndex::build(entries, config))
        } else {
            let entries = store.fetch_embeddings(&collection, &field)?;
            debug!(%collection, entries = entries.len(), "neighbour index: brute force");
            Backend::Brute(entries)
        };
        Ok(Self {
            store,
            collection,
            field,
            backend,
        })
    }

    /// Neighbours of `query` with cosine similarity at or above
    /// `min_similarity`, best first, at most `k`.
    pub fn nearest(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> StorageResult<Vec<(String, f32)>> {
        match &self.backend {
            Backend::Native => {
                self.store
                    .nearest_native(&self.collection, &self.field, query, k, min_similarity)
            }
            Backend::Lsh(index) => Ok(index.nearest(query, k, min_similarity)),
            Backend::Brute(entries) => {
                let mut hits: Vec<(String, f32)> = entries
                    .iter()
                    .map(|(id, v)| (id.clone(), cosine_similarity(query, v)))
                    .filter(|(_, s)| *s >= min_similarity)
                    .collect();
                sort_hits(&mut hits);
                hits.truncate(k);
                Ok(hits)
            }
        }
    }
}
