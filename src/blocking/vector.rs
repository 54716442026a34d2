//! Vector / ANN blocking
//!
//! For each embedded record, emits its nearest neighbours by cosine
//! similarity. Delegates search to the neighbour index, which picks the
//! native / LSH / brute-force backend once at construction.

use super::{BlockingStats, BlockingStrategy, CandidatePair, PairCollector};
use crate::error::Result;
use crate::index::{LshConfig, NeighborIndex};
use crate::storage::EntityStore;
use crate::validate::{validate_collection_name, validate_field_name};
use std::sync::Arc;
use std::time::Instant;

pub struct VectorStrategy {
    store: Arc<dyn EntityStore>,
    collection: String,
    field: String,
    min_similarity: f32,
    top_k: usize,
    lsh: Option<LshConfig>,
    collector: PairCollector,
}

impl VectorStrategy {
    pub fn new(store: Arc<dyn EntityStore>, collection: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        Ok(Self {
            store,
            collection,
            field: "embedding".to_string(),
            min_similarity: 0.8,
            top_k: 10,
            lsh: None,
            collector: PairCollector::new("vector"),
        })
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Result<Self> {
        let field = field.into();
        validate_field_name(&field)?;
        self.field = field;
        Ok(self)
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Pre-filter neighbour search through an LSH index.
    pub fn with_lsh(mut self, config: LshConfig) -> Self {
        self.lsh = Some(config);
        self
    }
}

impl BlockingStrategy for VectorStrategy {
    fn name(&self) -> &str {
        "vector"
    }

    fn generate_candidates(&mut self) -> Result<Vec<CandidatePair>> {
        let started = Instant::now();
        let index = NeighborIndex::build(
            self.store.clone(),
            self.collection.clone(),
            self.field.clone(),
            self.lsh,
        )?;
        let embedded = self.store.fetch_embeddings(&self.collection, &self.field)?;
        self.collector.stats_mut().records_scanned += embedded.len();

        let mut out = Vec::new();
        for (id, vector) in &embedded {
            // One extra to absorb the self-hit.
            let hits = index.nearest(vector, self.top_k + 1, self.min_similarity)?;
            for (other, score) in hits {
                if other == *id {
                    continue;
                }
                if let Some(pair) = self.collector.push_pair(id, &other, &mut out) {
                    pair.vector_score = Some(score as f64);
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
