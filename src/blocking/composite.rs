//! Exact composite-key blocking
//!
//! Groups records by a tuple of blocking keys evaluated store-side
//! (including computed keys like `digits_only(phone)`), then emits all
//! intra-block pairs.

use super::{BlockingStats, BlockingStrategy, CandidatePair, PairCollector};
use crate::error::Result;
use crate::record::Fields;
use crate::storage::{EntityStore, FieldFilter, KeyExpr};
use crate::validate::validate_collection_name;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

pub struct CompositeKeyStrategy {
    store: Arc<dyn EntityStore>,
    collection: String,
    keys: Vec<KeyExpr>,
    filters: Vec<FieldFilter>,
    collector: PairCollector,
}

impl CompositeKeyStrategy {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collection: impl Into<String>,
        keys: Vec<KeyExpr>,
        filters: Vec<FieldFilter>,
    ) -> Result<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        Ok(Self {
            store,
            collection,
            keys,
            filters,
            collector: PairCollector::new("collect"),
        })
    }

    pub fn with_block_bounds(mut self, min: usize, max: usize) -> Self {
        self.collector.set_block_bounds(min, max);
        self
    }

    /// Blocking-key provenance for one block.
    fn key_fields(&self, components: &[String]) -> Fields {
        self.keys
            .iter()
            .zip(components.iter())
            .map(|(expr, value)| (expr.field().to_string(), Value::String(value.clone())))
            .collect()
    }
}

impl BlockingStrategy for CompositeKeyStrategy {
    fn name(&self) -> &str {
        "collect"
    }

    fn generate_candidates(&mut self) -> Result<Vec<CandidatePair>> {
        let started = Instant::now();
        let blocks = self
            .store
            .group_blocks(&self.collection, &self.keys, &self.filters)?;

        let mut out = Vec::new();
        for block in &blocks {
            self.collector.stats_mut().records_scanned += block.members.len();
            let keys = self.key_fields(&block.key);
            self.collector.push_block(Some(&keys), &block.members, &mut out);
        }
        self.collector.stats_mut().elapsed_secs += started.elapsed().as_secs_f64();
        Ok(out)
    }

    fn statistics(&self) -> &BlockingStats {
        self.collector.stats()
    }
}
