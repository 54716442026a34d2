//! Graph-traversal blocking
//!
//! Seeds from each record and walks an existing relationship graph
//! (shared phone, shared address, …) up to a hop limit; every pair of
//! visited vertices becomes a candidate. The visited set is treated as
//! a block, so the usual block-size bounds apply.

use super::{BlockingStats, BlockingStrategy, CandidatePair, PairCollector};
use crate::error::Result;
use crate::record::Fields;
use crate::storage::EntityStore;
use crate::validate::validate_collection_name;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

pub struct GraphTraversalStrategy {
    store: Arc<dyn EntityStore>,
    collection: String,
    relation_collection: String,
    max_hops: usize,
    collector: PairCollector,
}

impl GraphTraversalStrategy {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collection: impl Into<String>,
        relation_collection: impl Into<String>,
    ) -> Result<Self> {
        let collection = collection.into();
        let relation_collection = relation_collection.into();
        validate_collection_name(&collection)?;
        validate_collection_name(&relation_collection)?;
        Ok(Self {
            store,
            collection,
            relation_collection,
            max_hops: 2,
            collector: PairCollector::new("graph_traversal"),
        })
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops.max(1);
        self
    }

    pub fn with_block_bounds(mut self, min: usize, max: usize) -> Self {
        self.collector.set_block_bounds(min, max);
        self
    }
}

impl BlockingStrategy for GraphTraversalStrategy {
    fn name(&self) -> &str {
        "graph_traversal"
    }

    fn generate_candidates(&mut self) -> Result<Vec<CandidatePair>> {
        let started = Instant::now();
        let ids = self.store.list_ids(&self.collection, None)?;
        self.collector.stats_mut().records_scanned += ids.len();
        let known: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let mut out = Vec::new();
        for seed in &ids {
            let visited =
                self.store
                    .neighbors_within(&self.relation_collection, seed, self.max_hops)?;
            // Only vertices that are records of this collection block together.
            let members: Vec<String> = visited
                .into_iter()
                .filter(|v| known.contains(v.as_str()))
                .collect();
            let keys: Fields = [("seed".to_string(), Value::String(seed.clone()))]
                .into_iter()
                .collect();
            self.collector.push_block(Some(&keys), &members, &mut out);
        }
        self.collector.stats_mut().elapsed_secs += started.elapsed().as_secs_f64();
        Ok(out)
    }

    fn statistics(&self) -> &BlockingStats {
        self.collector.stats()
    }
}
