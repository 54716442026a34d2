//! Similarity-edge materialization
//!
//! Scored matches become persisted edges keyed deterministically by the
//! unordered endpoint pair, so replaying the same matches is safe. A
//! re-inserted edge merges instead of duplicating: the score becomes the
//! mean of old and new, `is_match` is OR-ed, and `update_count` grows by
//! one. With `force_update` the scalar fields are overwritten instead.

use crate::error::Result;
use crate::matching::{MatchDecision, ScoredMatch};
use crate::pipeline::CancellationToken;
use crate::record::Fields;
use crate::storage::EntityStore;
use crate::validate::validate_collection_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Attempts per edge before a transient storage failure is given up on.
const UPSERT_ATTEMPTS: u32 = 3;

/// A persisted similarity edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    /// Deterministic key derived from the unordered endpoint pair.
    pub key: String,
    pub from_id: String,
    pub to_id: String,
    pub similarity_score: f64,
    pub field_scores: BTreeMap<String, f64>,
    pub is_match: bool,
    /// The algorithm or pipeline that produced the edge.
    pub algorithm: String,
    /// Caller-supplied provenance carried on the edge document.
    #[serde(default)]
    pub metadata: Fields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub update_count: u32,
}

impl SimilarityEdge {
    /// Deterministic edge key for an unordered endpoint pair.
    pub fn pair_key(a: &str, b: &str) -> String {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{lo}\u{1f}{hi}").as_bytes()).to_string()
    }

    /// Build an edge from endpoints and a score.
    pub fn new(
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        similarity_score: f64,
        is_match: bool,
        algorithm: impl Into<String>,
    ) -> Self {
        let from_id = from_id.into();
        let to_id = to_id.into();
        let now = Utc::now();
        Self {
            key: Self::pair_key(&from_id, &to_id),
            from_id,
            to_id,
            similarity_score,
            field_scores: BTreeMap::new(),
            is_match,
            algorithm: algorithm.into(),
            metadata: Fields::new(),
            created_at: now,
            updated_at: now,
            update_count: 1,
        }
    }

    /// Merge a re-inserted edge into this stored one.
    ///
    /// `force_update = false`: score becomes `mean(old, new)`, `is_match`
    /// is OR-ed. `force_update = true`: incoming scalar fields overwrite.
    /// Either way `update_count` grows by one and `created_at` is kept.
    pub fn merge_from(&mut self, incoming: &SimilarityEdge, force_update: bool) {
        if force_update {
            self.similarity_score = incoming.similarity_score;
            self.is_match = incoming.is_match;
            self.algorithm = incoming.algorithm.clone();
            self.metadata = incoming.metadata.clone();
        } else {
            self.similarity_score = (self.similarity_score + incoming.similarity_score) / 2.0;
            self.is_match = self.is_match || incoming.is_match;
        }
        self.field_scores = incoming.field_scores.clone();
        self.updated_at = incoming.updated_at;
        self.update_count += 1;
    }
}

/// Statistics for one `create_edges` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EdgeStats {
    pub matches_in: usize,
    pub created: usize,
    pub merged: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
}

/// Writes scored matches into an edge collection.
///
/// Endpoints are formatted as `collection/record_id` with the vertex
/// collection fixed at construction.
pub struct EdgeMaterializer {
    store: Arc<dyn EntityStore>,
    edge_collection: String,
    vertex_collection: String,
    algorithm: String,
    metadata: Fields,
    batch_size: usize,
}

impl EdgeMaterializer {
    pub fn new(
        store: Arc<dyn EntityStore>,
        edge_collection: impl Into<String>,
        vertex_collection: impl Into<String>,
        algorithm: impl Into<String>,
    ) -> Result<Self> {
        let edge_collection = edge_collection.into();
        let vertex_collection = vertex_collection.into();
        validate_collection_name(&edge_collection)?;
        validate_collection_name(&vertex_collection)?;
        Ok(Self {
            store,
            edge_collection,
            vertex_collection,
            algorithm: algorithm.into(),
            metadata: Fields::new(),
            batch_size: 1000,
        })
    }

    /// Attach provenance metadata to every edge written.
    pub fn with_metadata(mut self, metadata: Fields) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the upsert batch size (cancellation is checked between batches).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Full vertex identifier for a record id.
    pub fn vertex_id(&self, record_id: &str) -> String {
        format!("{}/{}", self.vertex_collection, record_id)
    }

    /// Upsert one edge per match. Per-edge failures are logged and
    /// skipped after a bounded retry; the batch continues.
    pub fn create_edges(
        &self,
        matches: &[ScoredMatch],
        force_update: bool,
        cancel: &CancellationToken,
    ) -> Result<EdgeStats> {
        let started = Instant::now();
        let mut stats = EdgeStats {
            matches_in: matches.len(),
            ..EdgeStats::default()
        };

        for batch in matches.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                break;
            }
            for m in batch {
                let mut edge = SimilarityEdge::new(
                    self.vertex_id(&m.a),
                    self.vertex_id(&m.b),
                    m.confidence,
                    m.decision == MatchDecision::Match,
                    self.algorithm.clone(),
                );
                edge.field_scores = m.field_scores.clone();
                edge.metadata = self.metadata.clone();

                match self.upsert_with_retry(&edge, force_update) {
                    Ok(outcome) => {
                        if outcome.created {
                            stats.created += 1;
                        } else {
                            stats.merged += 1;
                        }
                    }
                    Err(e) => {
                        warn!(from = %edge.from_id, to = %edge.to_id, error = %e, "edge upsert failed, skipping");
                        stats.failed += 1;
                    }
                }
            }
            debug!(
                collection = %self.edge_collection,
                created = stats.created,
                merged = stats.merged,
                "edge batch committed"
            );
        }

        stats.elapsed_secs = started.elapsed().as_secs_f64();
        Ok(stats)
    }

    fn upsert_with_retry(
        &self,
        edge: &SimilarityEdge,
        force_update: bool,
    ) -> crate::storage::StorageResult<crate::storage::EdgeUpsert> {
        let mut attempt = 0;
        loop {
            match self.store.upsert_edge(&self.edge_collection, edge, force_update) {
                Err(e) if e.is_transient() && attempt + 1 < UPSERT_ATTEMPTS => {
                    attempt += 1;
                    debug!(key = %edge.key, attempt, "transient edge failure, retrying");
                }
                other => return other,
            }
        }
    }

    /// Delete every edge this materializer's algorithm produced.
    pub fn delete_by_algorithm(&self) -> Result<usize> {
        Ok(self
            .store
            .delete_edges_by_algorithm(&self.edge_collection, &self.algorithm)?)
    }

    /// Drop all edges in the collection.
    pub fn truncate(&self) -> Result<()> {
        Ok(self.store.truncate_collection(&self.edge_collection)?)
    }
}
