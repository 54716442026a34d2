//! Declarative pipeline configuration
//!
//! Deserializes from YAML or JSON. Every name the configuration can
//! inject into a query — collections, views, fields — is validated
//! before the pipeline touches the store. Database credentials are NOT
//! part of this file; they come from the environment only.

use crate::clustering::ClusteringConfig;
use crate::golden::ResolutionStrategy;
use crate::matching::SimilarityConfig;
use crate::record::Fields;
use crate::storage::{FieldFilter, FilterPredicate, KeyExpr};
use crate::validate::{
    validate_collection_name, validate_field_name, validate_view_name, ValidationError,
};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Source collection.
    pub collection_name: String,
    #[serde(default = "default_edge_collection")]
    pub edge_collection: String,
    #[serde(default = "default_cluster_collection")]
    pub cluster_collection: String,
    #[serde(default = "default_golden_collection")]
    pub golden_collection: String,
    /// Ordered strategy specs; outputs are unioned as a set.
    #[serde(default)]
    pub blocking: Vec<StrategyConfig>,
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub edges: EdgeConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub golden_record: GoldenConfig,
    #[serde(default)]
    pub enrichments: EnrichmentConfig,
}

fn default_edge_collection() -> String {
    "similarTo".to_string()
}
fn default_cluster_collection() -> String {
    "entity_clusters".to_string()
}
fn default_golden_collection() -> String {
    "golden_records".to_string()
}

/// One blocking strategy spec, tagged by name.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum StrategyConfig {
    Collect {
        #[serde(default)]
        fields: Vec<String>,
        /// Server-side expressions: `digits_only(phone)`, `left(zip, 5)`,
        /// `lower(state)`.
        #[serde(default)]
        computed_fields: Vec<String>,
        #[serde(default)]
        filters: Vec<FilterConfig>,
        #[serde(default = "default_min_block_size")]
        min_block_size: usize,
        #[serde(default = "default_max_block_size")]
        max_block_size: usize,
    },
    Bm25 {
        fields: Vec<String>,
        search_view: String,
        #[serde(default = "default_bm25_threshold")]
        bm25_threshold: f64,
        #[serde(default = "default_limit_per_entity")]
        limit_per_entity: usize,
        #[serde(default)]
        constraint_field: Option<String>,
    },
    Vector {
        #[serde(default = "default_min_similarity")]
        min_similarity: f32,
        #[serde(default = "default_top_k")]
        top_k: usize,
        #[serde(default)]
        embedding_field: Option<String>,
    },
    Lsh {
        #[serde(default = "default_num_tables")]
        num_tables: usize,
        #[serde(default = "default_num_hyperplanes")]
        num_hyperplanes: usize,
        #[serde(default = "default_seed")]
        seed: u64,
    },
    Geographic {
        #[serde(default)]
        state_field: Option<String>,
        #[serde(default)]
        city_field: Option<String>,
        #[serde(default)]
        postal_field: Option<String>,
        #[serde(default = "default_postal_prefix")]
        postal_prefix: u32,
    },
    GraphTraversal {
        relation_collection: String,
        #[serde(default = "default_max_hops")]
        max_hops: usize,
    },
    Hybrid {
        fields: Vec<String>,
        search_view: String,
        #[serde(default = "default_bm25_threshold")]
        bm25_threshold: f64,
        #[serde(default = "default_limit_per_entity")]
        limit_per_entity: usize,
        verify_field: String,
        #[serde(default = "default_verify_threshold")]
        verify_threshold: f64,
    },
}

fn default_min_block_size() -> usize {
    2
}
fn default_max_block_size() -> usize {
    100
}
fn default_bm25_threshold() -> f64 {
    0.1
}
fn default_limit_per_entity() -> usize {
    10
}
fn default_min_similarity() -> f32 {
    0.8
}
fn default_top_k() -> usize {
    10
}
fn default_num_tables() -> usize {
    4
}
fn default_num_hyperplanes() -> usize {
    12
}
fn default_seed() -> u64 {
    42
}
fn default_postal_prefix() -> u32 {
    5
}
fn default_max_hops() -> usize {
    2
}
fn default_verify_threshold() -> f64 {
    0.8
}

/// Per-field blocking filter.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterConfig {
    NotNull { field: String },
    MinLength { field: String, len: u32 },
    NotEqual { field: String, value: String },
}

impl FilterConfig {
    pub fn to_filter(&self) -> Result<FieldFilter, ValidationError> {
        let (field, predicate) = match self {
            FilterConfig::NotNull { field } => (field, FilterPredicate::NotNull),
            FilterConfig::MinLength { field, len } => (field, FilterPredicate::MinLength(*len)),
            FilterConfig::NotEqual { field, value } => {
                (field, FilterPredicate::NotEqual(value.clone()))
            }
        };
        validate_field_name(field)?;
        Ok(FieldFilter {
            field: field.clone(),
            predicate,
        })
    }
}

/// Edge-materialization policy.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub force_update: bool,
    /// Provenance carried on every edge.
    #[serde(default)]
    pub metadata: Fields,
    #[serde(default = "default_edge_batch_size")]
    pub batch_size: usize,
}

fn default_edge_batch_size() -> usize {
    1000
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            force_update: false,
            metadata: Fields::new(),
            batch_size: default_edge_batch_size(),
        }
    }
}

/// Golden-record section.
#[derive(Debug, Clone, Deserialize)]
pub struct GoldenConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub field_strategies: BTreeMap<String, ResolutionStrategy>,
    /// Field → validator id.
    #[serde(default)]
    pub validators: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for GoldenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            field_strategies: BTreeMap::new(),
            validators: BTreeMap::new(),
        }
    }
}

/// Enrichment toggles and parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub type_filter: Option<TypeFilterConfig>,
    /// Acronym → expansions, fed into fuzzy blocking.
    #[serde(default)]
    pub acronyms: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub hierarchical_context: Option<HierarchicalContextConfig>,
    #[serde(default)]
    pub provenance_sweep: Option<ProvenanceSweepConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeFilterConfig {
    #[serde(default = "default_type_field")]
    pub type_field: String,
    /// type → compatible types.
    pub matrix: BTreeMap<String, Vec<String>>,
}

fn default_type_field() -> String {
    "type".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HierarchicalContextConfig {
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,
    #[serde(default = "default_context_weight")]
    pub context_weight: f64,
    /// Field carrying a record's parent-context string.
    pub context_field: String,
    /// Field carrying the description compared against the other side.
    pub description_field: String,
}

fn default_base_weight() -> f64 {
    0.7
}
fn default_context_weight() -> f64 {
    0.3
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvenanceSweepConfig {
    pub relation_collection: String,
}

impl PipelineConfig {
    /// Parse from YAML.
    pub fn from_yaml(text: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| ValidationError::Config(format!("bad YAML configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from JSON.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| ValidationError::Config(format!("bad JSON configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every name the configuration will interpolate.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_collection_name(&self.collection_name)?;
        validate_collection_name(&self.edge_collection)?;
        validate_collection_name(&self.cluster_collection)?;
        validate_collection_name(&self.golden_collection)?;
        for field in self.similarity.field_weights.keys() {
            validate_field_name(field)?;
        }
        for strategy in &self.blocking {
            strategy.validate()?;
        }
        if let Some(sweep) = &self.enrichments.provenance_sweep {
            validate_collection_name(&sweep.relation_collection)?;
        }
        if let Some(tf) = &self.enrichments.type_filter {
            validate_field_name(&tf.type_field)?;
        }
        if let Some(hc) = &self.enrichments.hierarchical_context {
            validate_field_name(&hc.context_field)?;
            validate_field_name(&hc.description_field)?;
        }
        Ok(())
    }
}

impl StrategyConfig {
    /// The strategy's configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::Collect { .. } => "collect",
            StrategyConfig::Bm25 { .. } => "bm25",
            StrategyConfig::Vector { .. } => "vector",
            StrategyConfig::Lsh { .. } => "lsh",
            StrategyConfig::Geographic { .. } => "geographic",
            StrategyConfig::GraphTraversal { .. } => "graph_traversal",
            StrategyConfig::Hybrid { .. } => "hybrid",
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StrategyConfig::Collect {
                fields,
                computed_fields,
                filters,
                ..
            } => {
                if fields.is_empty() && computed_fields.is_empty() {
                    return Err(ValidationError::Config(
                        "collect blocking needs fields or computed_fields".into(),
                    ));
                }
                for field in fields {
                    validate_field_name(field)?;
                }
                for expr in computed_fields {
                    KeyExpr::parse(expr)?;
                }
                for filter in filters {
                    filter.to_filter()?;
                }
            }
            StrategyConfig::Bm25 {
                fields,
                search_view,
                constraint_field,
                ..
            } => {
                validate_view_name(search_view)?;
                for field in fields {
                    validate_field_name(field)?;
                }
                if let Some(field) = constraint_field {
                    validate_field_name(field)?;
                }
            }
            StrategyConfig::Vector {
                embedding_field, ..
            } => {
                if let Some(field) = embedding_field {
                    validate_field_name(field)?;
                }
            }
            StrategyConfig::Lsh { .. } => {}
            StrategyConfig::Geographic {
                state_field,
                city_field,
                postal_field,
                ..
            } => {
                for field in [state_field, city_field, postal_field].into_iter().flatten() {
                    validate_field_name(field)?;
                }
                if state_field.is_none() && city_field.is_none() && postal_field.is_none() {
                    return Err(ValidationError::Config(
                        "geographic blocking needs at least one of state/city/postal fields".into(),
                    ));
                }
            }
            StrategyConfig::GraphTraversal {
                relation_collection,
                ..
            } => {
                validate_collection_name(relation_collection)?;
            }
            StrategyConfig::Hybrid {
                fields,
                search_view,
                verify_field,
                ..
            } => {
                validate_view_name(search_view)?;
                validate_field_name(verify_field)?;
                for field in fields {
                    validate_field_name(field)?;
                }
            }
        }
        Ok(())
    }

    /// Key expressions for a collect spec: plain fields first, computed
    /// expressions after, in configuration order.
    pub fn collect_keys(
        fields: &[String],
        computed_fields: &[String],
    ) -> Result<Vec<KeyExpr>, ValidationError> {
        let mut keys = Vec::with_capacity(fields.len() + computed_fields.len());
        for field in fields {
            validate_field_name(field)?;
            keys.push(KeyExpr::Field(field.clone()));
        }
        for expr in computed_fields {
            keys.push(KeyExpr::parse(expr)?);
        }
        Ok(keys)
    }
}
