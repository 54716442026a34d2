//! Pipeline orchestrator
//!
//! Drives the whole sequence from declarative configuration:
//! setup → (embedding) → blocking → type filter → similarity → edges →
//! clustering → golden records → provenance sweep. Every phase reports
//! its own statistics; edge and cluster writes are idempotent, so a
//! crashed or cancelled run can be re-invoked without duplicating
//! state.

mod cancel;
mod config;

pub use cancel::CancellationToken;
pub use config::{
    EdgeConfig, EnrichmentConfig, FilterConfig, GoldenConfig, HierarchicalContextConfig,
    PipelineConfig, ProvenanceSweepConfig, StrategyConfig, TypeFilterConfig,
};

use crate::blocking::{
    union_candidates, BlockingStrategy, Bm25Strategy, CandidatePair, CompositeKeyStrategy,
    GeographicFields, GeographicStrategy, GraphTraversalStrategy, HybridStrategy, LshStrategy,
    VectorStrategy,
};
use crate::clustering::{Cluster, ClusteringService};
use crate::edges::EdgeMaterializer;
use crate::embedding::{EmbeddingService, Encoder};
use crate::enrich::{canonical_mapping, AcronymExpander, ProvenanceSweeper, TypeFilter};
use crate::error::Result;
use crate::golden::GoldenRecordService;
use crate::index::LshConfig;
use crate::matching::BatchScorer;
use crate::serializer::TupleSerializer;
use crate::storage::EntityStore;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Outcome of one pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Skipped,
}

/// Statistics and status for one phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: String,
    pub status: PhaseStatus,
    pub statistics: Value,
    pub elapsed_secs: f64,
}

/// The structured result of a pipeline run. Returned even on partial
/// failure; inspect `errors` before trusting downstream outputs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub phases: Vec<PhaseReport>,
    pub errors: Vec<String>,
    pub candidates: usize,
    pub matches: usize,
    pub clusters: usize,
    pub golden_records: usize,
    pub elapsed_secs: f64,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, phase: &str, status: PhaseStatus, statistics: Value, started: Instant) {
        self.phases.push(PhaseReport {
            phase: phase.to_string(),
            status,
            statistics,
            elapsed_secs: started.elapsed().as_secs_f64(),
        });
    }

    fn fail(&mut self, phase: &str, error: impl std::fmt::Display, started: Instant) {
        warn!(%phase, error = %error, "pipeline phase failed");
        self.errors.push(format!("{phase}: {error}"));
        self.push(phase, PhaseStatus::Failed, Value::Null, started);
    }
}

/// The single top-level entry point for end-to-end runs.
pub struct Pipeline {
    store: Arc<dyn EntityStore>,
    config: PipelineConfig,
    cancel: CancellationToken,
    encoder: Option<Arc<dyn Encoder>>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn EntityStore>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            cancel: CancellationToken::new(),
            encoder: None,
        })
    }

    /// Attach an encoder so the pipeline can run an embedding phase
    /// ahead of vector-based blocking.
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// A clone of the run's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the configured pipeline end to end.
    pub async fn run(&self) -> Result<PipelineReport> {
        let run_started = Instant::now();
        let mut report = PipelineReport::default();

        // --- setup ---
        let started = Instant::now();
        let mut strategies = match self.setup() {
            Ok(strategies) => {
                report.push(
                    "setup",
                    PhaseStatus::Completed,
                    json!({ "strategies": strategies.len() }),
                    started,
                );
                strategies
            }
            Err(e) => {
                report.fail("setup", e, started);
                report.elapsed_secs = run_started.elapsed().as_secs_f64();
                return Ok(report);
            }
        };

        // --- embedding ---
        let started = Instant::now();
        match &self.encoder {
            None => report.push("embedding", PhaseStatus::Skipped, Value::Null, started),
            Some(encoder) => {
                let service = EmbeddingService::new(
                    self.store.clone(),
                    encoder.clone(),
                    TupleSerializer::new(),
                    self.config.collection_name.clone(),
                )?;
                match service.embed_records(None).await {
                    Ok(embedded) => report.push(
                        "embedding",
                        PhaseStatus::Completed,
                        json!({ "embedded": embedded }),
                        started,
                    ),
                    Err(e) => {
                        report.fail("embedding", e, started);
                        report.elapsed_secs = run_started.elapsed().as_secs_f64();
                        return Ok(report);
                    }
                }
            }
        }

        // --- blocking ---
        let started = Instant::now();
        let mut outputs: Vec<Vec<CandidatePair>> = Vec::new();
        let mut strategy_stats: Vec<Value> = Vec::new();
        let mut blocking_failed = false;
        for strategy in strategies.iter_mut() {
            if self.cancel.is_cancelled() {
                break;
            }
            match strategy.generate_candidates() {
                Ok(pairs) => {
                    strategy_stats.push(json!({
                        "name": strategy.name(),
                        "stats": serde_json::to_value(strategy.statistics())
                            .unwrap_or(Value::Null),
                    }));
                    outputs.push(pairs);
                }
                Err(e) => {
                    report.fail("blocking", format!("{}: {e}", strategy.name()), started);
                    blocking_failed = true;
                    break;
                }
            }
        }
        if blocking_failed {
            report.elapsed_secs = run_started.elapsed().as_secs_f64();
            return Ok(report);
        }
        let mut candidates = union_candidates(outputs);
        report.candidates = candidates.len();
        report.push(
            "blocking",
            PhaseStatus::Completed,
            json!({ "candidates": candidates.len(), "strategies": strategy_stats }),
            started,
        );

        // --- type filter ---
        let started = Instant::now();
        match &self.config.enrichments.type_filter {
            None => report.push("type_filter", PhaseStatus::Skipped, Value::Null, started),
            Some(tf_config) => match self.apply_type_filter(tf_config, candidates) {
                Ok((kept, rejected)) => {
                    candidates = kept;
                    report.candidates = candidates.len();
                    report.push(
                        "type_filter",
                        PhaseStatus::Completed,
                        json!({ "type_filter_rejected": rejected, "candidates": candidates.len() }),
                        started,
                    );
                }
                Err(e) => {
                    report.fail("type_filter", e, started);
                    report.elapsed_secs = run_started.elapsed().as_secs_f64();
                    return Ok(report);
                }
            },
        }

        // --- similarity ---
        let started = Instant::now();
        let scorer = match BatchScorer::new(
            self.store.clone(),
            self.config.collection_name.clone(),
            self.config.similarity.clone(),
        ) {
            Ok(scorer) => scorer,
            Err(e) => {
                report.fail("similarity", e, started);
                report.elapsed_secs = run_started.elapsed().as_secs_f64();
                return Ok(report);
            }
        };
        let matches = match scorer.score_pairs(&candidates, &self.cancel) {
            Ok((matches, stats)) => {
                report.matches = matches.len();
                report.push(
                    "similarity",
                    PhaseStatus::Completed,
                    serde_json::to_value(&stats).unwrap_or(Value::Null),
                    started,
                );
                matches
            }
            Err(e) => {
                report.fail("similarity", e, started);
                report.elapsed_secs = run_started.elapsed().as_secs_f64();
                return Ok(report);
            }
        };

        // --- edges ---
        let started = Instant::now();
        let materializer = EdgeMaterializer::new(
            self.store.clone(),
            self.config.edge_collection.clone(),
            self.config.collection_name.clone(),
            "er_pipeline",
        )?
        .with_metadata(self.config.edges.metadata.clone())
        .with_batch_size(self.config.edges.batch_size);
        match materializer.create_edges(&matches, self.config.edges.force_update, &self.cancel) {
            Ok(stats) => report.push(
                "edges",
                PhaseStatus::Completed,
                serde_json::to_value(&stats).unwrap_or(Value::Null),
                started,
            ),
            Err(e) => {
                report.fail("edges", e, started);
                report.elapsed_secs = run_started.elapsed().as_secs_f64();
                return Ok(report);
            }
        }

        // --- clustering ---
        let started = Instant::now();
        let clusters: Vec<Cluster> = match self.run_clustering() {
            Ok((clusters, stats)) => {
                report.clusters = clusters.len();
                report.push(
                    "clustering",
                    PhaseStatus::Completed,
                    serde_json::to_value(&stats).unwrap_or(Value::Null),
                    started,
                );
                clusters
            }
            Err(e) => {
                report.fail("clustering", e, started);
                report.elapsed_secs = run_started.elapsed().as_secs_f64();
                return Ok(report);
            }
        };

        // --- golden records ---
        let started = Instant::now();
        if self.config.golden_record.enabled {
            match self.run_golden(&clusters) {
                Ok(stats) => {
                    report.golden_records = stats.records_built;
                    report.push(
                        "golden_records",
                        PhaseStatus::Completed,
                        serde_json::to_value(&stats).unwrap_or(Value::Null),
                        started,
                    );
                }
                Err(e) => {
                    report.fail("golden_records", e, started);
                    report.elapsed_secs = run_started.elapsed().as_secs_f64();
                    return Ok(report);
                }
            }
        } else {
            report.push("golden_records", PhaseStatus::Skipped, Value::Null, started);
        }

        // --- provenance sweep ---
        let started = Instant::now();
        match &self.config.enrichments.provenance_sweep {
            None => report.push("provenance_sweep", PhaseStatus::Skipped, Value::Null, started),
            Some(sweep_config) => {
                let result = ProvenanceSweeper::new(
                    self.store.clone(),
                    sweep_config.relation_collection.clone(),
                )
                .and_then(|sweeper| sweeper.sweep(&canonical_mapping(&clusters)));
                match result {
                    Ok(stats) => report.push(
                        "provenance_sweep",
                        PhaseStatus::Completed,
                        serde_json::to_value(&stats).unwrap_or(Value::Null),
                        started,
                    ),
                    Err(e) => report.fail("provenance_sweep", e, started),
                }
            }
        }

        report.elapsed_secs = run_started.elapsed().as_secs_f64();
        info!(
            candidates = report.candidates,
            matches = report.matches,
            clusters = report.clusters,
            golden = report.golden_records,
            errors = report.errors.len(),
            "pipeline run complete"
        );
        Ok(report)
    }

    /// Ensure collections exist and build the configured strategies
    /// (rebuilding full-text views where needed).
    fn setup(&self) -> Result<Vec<Box<dyn BlockingStrategy>>> {
        self.store.ensure_collection(&self.config.collection_name)?;
        self.store.ensure_collection(&self.config.edge_collection)?;
        self.store.ensure_collection(&self.config.cluster_collection)?;
        self.store.ensure_collection(&self.config.golden_collection)?;

        let acronyms = self.config.enrichments.acronyms.as_ref().map(|dict| {
            AcronymExpander::new(dict.iter().map(|(k, v)| (k.clone(), v.clone())))
        });

        let collection = &self.config.collection_name;
        let mut strategies: Vec<Box<dyn BlockingStrategy>> = Vec::new();
        for spec in &self.config.blocking {
            let strategy: Box<dyn BlockingStrategy> = match spec {
                StrategyConfig::Collect {
                    fields,
                    computed_fields,
                    filters,
                    min_block_size,
                    max_block_size,
                } => {
                    let keys = StrategyConfig::collect_keys(fields, computed_fields)?;
                    let filters = filters
                        .iter()
                        .map(FilterConfig::to_filter)
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Box::new(
                        CompositeKeyStrategy::new(
                            self.store.clone(),
                            collection.clone(),
                            keys,
                            filters,
                        )?
                        .with_block_bounds(*min_block_size, *max_block_size),
                    )
                }
                StrategyConfig::Bm25 {
                    fields,
                    search_view,
                    bm25_threshold,
                    limit_per_entity,
                    constraint_field,
                } => {
                    let mut strategy = Bm25Strategy::new(
                        self.store.clone(),
                        collection.clone(),
                        search_view.clone(),
                        fields.clone(),
                    )?
                    .with_threshold(*bm25_threshold)
                    .with_limit_per_entity(*limit_per_entity);
                    if let Some(field) = constraint_field {
                        strategy = strategy.with_constraint(field.clone())?;
                    }
                    if let Some(expander) = &acronyms {
                        strategy = strategy.with_acronyms(expander.clone());
                    }
                    strategy.ensure_view()?;
                    Box::new(strategy)
                }
                StrategyConfig::Vector {
                    min_similarity,
                    top_k,
                    embedding_field,
                } => {
                    let mut strategy = VectorStrategy::new(self.store.clone(), collection.clone())?
                        .with_min_similarity(*min_similarity)
                        .with_top_k(*top_k);
                    if let Some(field) = embedding_field {
                        strategy = strategy.with_field(field.clone())?;
                    }
                    Box::new(strategy)
                }
                StrategyConfig::Lsh {
                    num_tables,
                    num_hyperplanes,
                    seed,
                } => Box::new(LshStrategy::new(
                    self.store.clone(),
                    collection.clone(),
                    LshConfig {
                        num_tables: *num_tables,
                        num_hyperplanes: *num_hyperplanes,
                        seed: *seed,
                    },
                )?),
                StrategyConfig::Geographic {
                    state_field,
                    city_field,
                    postal_field,
                    postal_prefix,
                } => Box::new(GeographicStrategy::new(
                    self.store.clone(),
                    collection.clone(),
                    GeographicFields {
                        state: state_field.clone(),
                        city: city_field.clone(),
                        postal_code: postal_field.clone(),
                        postal_prefix: *postal_prefix,
                    },
                )?),
                StrategyConfig::GraphTraversal {
                    relation_collection,
                    max_hops,
                } => Box::new(
                    GraphTraversalStrategy::new(
                        self.store.clone(),
                        collection.clone(),
                        relation_collection.clone(),
                    )?
                    .with_max_hops(*max_hops),
                ),
                StrategyConfig::Hybrid {
                    fields,
                    search_view,
                    bm25_threshold,
                    limit_per_entity,
                    verify_field,
                    verify_threshold,
                } => {
                    let mut bm25 = Bm25Strategy::new(
                        self.store.clone(),
                        collection.clone(),
                        search_view.clone(),
                        fields.clone(),
                    )?
                    .with_threshold(*bm25_threshold)
                    .with_limit_per_entity(*limit_per_entity);
                    if let Some(expander) = &acronyms {
                        bm25 = bm25.with_acronyms(expander.clone());
                    }
                    let strategy = HybridStrategy::new(
                        self.store.clone(),
                        collection.clone(),
                        bm25,
                        verify_field.clone(),
                    )?
                    .with_verify_threshold(*verify_threshold);
                    strategy.ensure_view()?;
                    Box::new(strategy)
                }
            };
            strategies.push(strategy);
        }
        Ok(strategies)
    }

    fn apply_type_filter(
        &self,
        config: &TypeFilterConfig,
        candidates: Vec<CandidatePair>,
    ) -> Result<(Vec<CandidatePair>, usize)> {
        let filter = TypeFilter::new(
            config.type_field.clone(),
            config.matrix.iter().map(|(k, v)| (k.clone(), v.clone())),
        );
        let ids: Vec<String> = candidates
            .iter()
            .flat_map(|p| [p.a.clone(), p.b.clone()])
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        let records = self.store.fetch_many(
            &self.config.collection_name,
            &ids,
            Some(&[config.type_field.clone()]),
        )?;
        let types: HashMap<String, String> = records
            .iter()
            .filter_map(|r| r.text(&config.type_field).map(|t| (r.id.clone(), t)))
            .collect();
        Ok(filter.filter_pairs(candidates, &types))
    }

    fn run_clustering(&self) -> Result<(Vec<Cluster>, crate::clustering::ClusterStats)> {
        let service = ClusteringService::new(
            self.store.clone(),
            self.config.edge_collection.clone(),
            self.config.clustering.clone(),
        )?
        .with_vertex_collection(self.config.collection_name.clone())?;
        let (clusters, stats) = service.discover()?;
        service.persist(&clusters, &self.config.cluster_collection)?;
        Ok((clusters, stats))
    }

    fn run_golden(&self, clusters: &[Cluster]) -> Result<crate::golden::GoldenStats> {
        let service = GoldenRecordService::new(
            self.store.clone(),
            self.config.collection_name.clone(),
        )?
        .with_field_strategies(self.config.golden_record.field_strategies.clone())
        .with_field_validators(self.config.golden_record.validators.clone());
        let (_, stats) = service.synthesize_all(clusters, &self.config.golden_collection)?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::storage::{OpenStore, SqliteStore};
    use serde_json::json;

    fn scenario_store() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many(
                "customers",
                &[
                    Record::from_value("r1", json!({"name": "John Smith", "phone": "555-123-4567", "state": "CA"})),
                    Record::from_value("r2", json!({"name": "Jon Smith", "phone": "5551234567", "state": "CA"})),
                    Record::from_value("r3", json!({"name": "J. Smith", "phone": "(555) 123-4567", "state": "CA"})),
                    Record::from_value("r4", json!({"name": "Unrelated Person", "phone": "2025550000", "state": "NY"})),
                ],
            )
            .unwrap();
        Arc::new(store)
    }

    fn scenario_config() -> PipelineConfig {
        PipelineConfig::from_yaml(
            r#"
collection_name: customers
blocking:
  - name: collect
    computed_fields: ["digits_only(phone)"]
    fields: [state]
similarity:
  algorithm: jaro_winkler
  field_weights:
    name: 1.0
  threshold: 0.75
clustering:
  algorithm: bulk_dfs
  min_similarity: 0.75
"#,
        )
        .unwrap()
    }

    // === Scenario: three spellings of one person collapse to one cluster ===

    #[tokio::test]
    async fn end_to_end_composite_key_pipeline() {
        let store = scenario_store();
        let pipeline = Pipeline::new(store.clone(), scenario_config()).unwrap();
        let report = pipeline.run().await.unwrap();

        assert!(report.succeeded(), "errors: {:?}", report.errors);
        assert_eq!(report.candidates, 3);
        assert_eq!(report.matches, 3);
        assert_eq!(report.clusters, 1);
        assert_eq!(report.golden_records, 1);

        assert_eq!(store.count_edges("similarTo").unwrap(), 3);
        assert_eq!(store.count("entity_clusters").unwrap(), 1);
        let clusters = store.scan("entity_clusters", None).unwrap();
        let members = clusters[0].get("members").unwrap().as_array().unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(clusters[0].get("density").unwrap().as_f64().unwrap(), 1.0);
    }

    // === Re-running the pipeline converges instead of duplicating ===

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let store = scenario_store();
        let pipeline = Pipeline::new(store.clone(), scenario_config()).unwrap();
        pipeline.run().await.unwrap();
        let report = pipeline.run().await.unwrap();
        assert!(report.succeeded());
        assert_eq!(store.count_edges("similarTo").unwrap(), 3);
        assert_eq!(store.count("entity_clusters").unwrap(), 1);
        // Each edge was presented twice.
        let edges = store.fetch_edges_above("similarTo", 0.0).unwrap();
        for edge in edges {
            let key = crate::edges::SimilarityEdge::pair_key(&edge.from_id, &edge.to_id);
            let stored = store.get_edge("similarTo", &key).unwrap().unwrap();
            assert_eq!(stored.update_count, 2);
        }
    }

    // === Phase reports cover the full sequence ===

    #[tokio::test]
    async fn report_lists_every_phase() {
        let pipeline = Pipeline::new(scenario_store(), scenario_config()).unwrap();
        let report = pipeline.run().await.unwrap();
        let phases: Vec<&str> = report.phases.iter().map(|p| p.phase.as_str()).collect();
        assert_eq!(
            phases,
            vec![
                "setup",
                "embedding",
                "blocking",
                "type_filter",
                "similarity",
                "edges",
                "clustering",
                "golden_records",
                "provenance_sweep",
            ]
        );
        // No encoder, no type filter, no sweep configured.
        assert_eq!(report.phases[1].status, PhaseStatus::Skipped);
        assert_eq!(report.phases[3].status, PhaseStatus::Skipped);
        assert_eq!(report.phases[8].status, PhaseStatus::Skipped);
    }

    // === A bad similarity section fails the run but returns a report ===

    #[tokio::test]
    async fn failed_phase_surfaces_in_errors() {
        let mut config = scenario_config();
        config.similarity.field_weights.clear();
        let pipeline = Pipeline::new(scenario_store(), config).unwrap();
        let report = pipeline.run().await.unwrap();
        assert!(!report.succeeded());
        assert!(report.errors[0].starts_with("similarity:"));
        let failed = report
            .phases
            .iter()
            .find(|p| p.phase == "similarity")
            .unwrap();
        assert_eq!(failed.status, PhaseStatus::Failed);
    }
}
