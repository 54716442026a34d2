//! Coalesce: entity resolution for multi-model record stores
//!
//! Deduplicates and links records that describe the same real-world
//! entity. The pipeline runs blocking (candidate generation), weighted
//! field similarity, idempotent edge materialization, connected-
//! component clustering, and golden-record synthesis over any store
//! that implements the `EntityStore` contract.
//!
//! # Core Concepts
//!
//! - **Candidate pairs**: the blocking strategies cut the O(n²)
//!   comparison space down to pairs worth scoring
//! - **Similarity edges**: persisted scored links with merge-on-reinsert
//!   semantics, so re-runs converge instead of duplicating
//! - **Clusters**: weakly-connected components of the similarity graph,
//!   each interpreted as one entity
//! - **Golden records**: per-field conflict resolution across a cluster
//!
//! # Example
//!
//! ```no_run
//! use coalesce::{Pipeline, PipelineConfig, SqliteStore, OpenStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> coalesce::Result<()> {
//! let store = Arc::new(SqliteStore::open("er.db")?);
//! let config = PipelineConfig::from_yaml(r#"
//! collection_name: customers
//! blocking:
//!   - name: collect
//!     computed_fields: ["digits_only(phone)"]
//! similarity:
//!   field_weights: { name: 1.0 }
//!   threshold: 0.8
//! "#)?;
//! let report = Pipeline::new(store, config)?.run().await?;
//! assert!(report.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod blocking;
pub mod clustering;
pub mod edges;
pub mod embedding;
pub mod enrich;
mod error;
pub mod eval;
pub mod golden;
pub mod index;
pub mod matching;
pub mod pipeline;
mod record;
pub mod serializer;
pub mod similarity;
pub mod storage;
pub mod validate;

pub use address::{normalize_address, AddressFields, AddressReport, AddressResolver};
pub use blocking::{
    union_candidates, BlockingStats, BlockingStrategy, Bm25Strategy, CandidatePair,
    CompositeKeyStrategy, GeographicFields, GeographicStrategy, GraphTraversalStrategy,
    HybridStrategy, LshStrategy, RadiusCheck, VectorStrategy,
};
pub use clustering::{
    Cluster, ClusterAlgorithm, ClusterStats, ClusteringConfig, ClusteringService,
};
pub use edges::{EdgeMaterializer, EdgeStats, SimilarityEdge};
pub use embedding::{
    CoverageStats, EmbeddingMeta, EmbeddingService, Encoder, EncoderError,
    MultiResolutionEmbedder,
};
pub use enrich::{
    canonical_mapping, AcronymExpander, HierarchicalContext, ProvenanceSweeper, SweepStats,
    TypeFilter,
};
pub use error::{Error, Result};
pub use eval::{AbHarness, AbReport, GroundTruthPair, MetricDelta, StrategyMetrics};
pub use golden::{
    EmailValidator, FieldValidator, GoldenRecord, GoldenRecordService, GoldenStats,
    PhoneValidator, ResolutionStrategy, StateValidator, ZipValidator,
};
pub use index::{cosine_similarity, LshConfig, LshIndex, NeighborIndex};
pub use matching::{
    BatchScorer, CrossBlocking, CrossCollectionMatcher, CrossMatchStats, MatchDecision,
    ScoredMatch, ScoringStats, SimilarityConfig,
};
pub use pipeline::{
    CancellationToken, PhaseReport, PhaseStatus, Pipeline, PipelineConfig, PipelineReport,
    StrategyConfig,
};
pub use record::{is_system_field, Fields, Record};
pub use serializer::{MissingField, TupleSerializer};
pub use similarity::{
    jaro_winkler, levenshtein_similarity, soundex, token_jaccard, FieldScore, FieldSimilarity,
    NullMode, SimilarityAlgorithm, TextNormalize,
};
pub use storage::{
    Credentials, EntityStore, KeyExpr, OpenStore, SqliteStore, StorageError, StorageResult,
};

#[cfg(feature = "embeddings")]
pub use embedding::FastEmbedEncoder;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
