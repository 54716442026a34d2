//! Golden record synthesis
//!
//! For each cluster, gathers candidate values per field across all
//! members and resolves conflicts by strategy: `highest_quality`,
//! `most_frequent`, or `most_complete_with_quality`. Value quality
//! combines a pluggable validator verdict, a bounded length check, and
//! a clean-character check; ties always break to the first-seen value
//! (member-id order), so synthesis is deterministic.

use crate::clustering::Cluster;
use crate::error::Result;
use crate::record::{is_system_field, Fields, Record};
use crate::storage::EntityStore;
use crate::validate::validate_collection_name;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Per-field conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    HighestQuality,
    MostFrequent,
    MostCompleteWithQuality,
}

/// A pluggable per-field value validator.
pub trait FieldValidator: Send + Sync {
    fn id(&self) -> &str;
    fn is_valid(&self, value: &str) -> bool;
}

/// Email: one `@`, non-empty local part, dotted domain, no whitespace.
pub struct EmailValidator;

impl FieldValidator for EmailValidator {
    fn id(&self) -> &str {
        "email"
    }

    fn is_valid(&self, value: &str) -> bool {
        if value.chars().any(char::is_whitespace) {
            return false;
        }
        let Some((local, domain)) = value.split_once('@') else {
            return false;
        };
        !local.is_empty()
            && domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
            && !value[local.len() + 1..].contains('@')
    }
}

/// Phone: at least ten digits after stripping, and not a known sentinel.
pub struct PhoneValidator;

const PHONE_SENTINELS: &[&str] = &["0000000000", "9999999999", "1234567890"];

impl FieldValidator for PhoneValidator {
    fn id(&self) -> &str {
        "phone"
    }

    fn is_valid(&self, value: &str) -> bool {
        let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
        digits.len() >= 10 && !PHONE_SENTINELS.contains(&digits.as_str())
    }
}

/// ZIP: five digits, optionally plus four.
pub struct ZipValidator;

impl FieldValidator for ZipValidator {
    fn id(&self) -> &str {
        "zip"
    }

    fn is_valid(&self, value: &str) -> bool {
        let (five, rest) = value.split_at(value.len().min(5));
        if five.len() != 5 || !five.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        match rest.strip_prefix('-') {
            None => rest.is_empty(),
            Some(plus4) => plus4.len() == 4 && plus4.chars().all(|c| c.is_ascii_digit()),
        }
    }
}

/// Two-letter US state or territory code.
pub struct StateValidator;

const STATE_CODES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC", "PR", "VI", "GU", "AS", "MP",
];

impl FieldValidator for StateValidator {
    fn id(&self) -> &str {
        "state"
    }

    fn is_valid(&self, value: &str) -> bool {
        STATE_CODES.contains(&value.to_ascii_uppercase().as_str())
    }
}

/// A consolidated representative record for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoldenRecord {
    pub cluster_id: String,
    pub fields: Fields,
    /// Provenance: the cluster members the fields were drawn from.
    pub source_ids: Vec<String>,
    /// Fields where more than one distinct value competed.
    pub conflicts_resolved: usize,
    /// Fields with no acceptable candidate value (omitted from output).
    pub fields_unresolved: usize,
    /// Mean quality of the chosen values.
    pub quality_score: f64,
}

/// Statistics for one synthesis run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GoldenStats {
    pub clusters_in: usize,
    pub records_built: usize,
    pub conflicts_resolved: usize,
    pub fields_unresolved: usize,
}

/// Synthesizes golden records from clusters.
pub struct GoldenRecordService {
    store: Arc<dyn EntityStore>,
    collection: String,
    field_strategies: BTreeMap<String, ResolutionStrategy>,
    default_strategy: ResolutionStrategy,
    /// Field → validator id; resolved against the registry.
    field_validators: BTreeMap<String, String>,
    validators: HashMap<String, Arc<dyn FieldValidator>>,
    /// Floor for `most_complete_with_quality`.
    min_quality: f64,
}

impl GoldenRecordService {
    pub fn new(store: Arc<dyn EntityStore>, collection: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        let mut validators: HashMap<String, Arc<dyn FieldValidator>> = HashMap::new();
        for validator in default_validators() {
            validators.insert(validator.id().to_string(), validator);
        }
        Ok(Self {
            store,
            collection,
            field_strategies: BTreeMap::new(),
            default_strategy: ResolutionStrategy::default(),
            field_validators: BTreeMap::new(),
            validators,
            min_quality: 0.5,
        })
    }

    pub fn with_field_strategies(
        mut self,
        strategies: BTreeMap<String, ResolutionStrategy>,
    ) -> Self {
        self.field_strategies = strategies;
        self
    }

    pub fn with_default_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Map fields to validator ids (`email`, `phone`, `zip`, `state`, or
    /// a registered custom id).
    pub fn with_field_validators(mut self, mapping: BTreeMap<String, String>) -> Self {
        self.field_validators = mapping;
        self
    }

    /// Register a custom validator.
    pub fn register_validator(mut self, validator: Arc<dyn FieldValidator>) -> Self {
        self.validators
            .insert(validator.id().to_string(), validator);
        self
    }

    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = min_quality;
        self
    }

    /// Synthesize one golden record.
    pub fn synthesize(&self, cluster: &Cluster) -> Result<GoldenRecord> {
        let fetched = self
            .store
            .fetch_many(&self.collection, &cluster.members, None)?;
        // First-seen tie-breaking follows member-id order.
        let by_id: HashMap<&str, &Record> =
            fetched.iter().map(|r| (r.id.as_str(), r)).collect();
        let records: Vec<&Record> = cluster
            .members
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .collect();

        let mut field_names: BTreeSet<String> = BTreeSet::new();
        for record in &records {
            for name in record.fields.keys() {
                if !is_system_field(name) {
                    field_names.insert(name.clone());
                }
            }
        }

        let mut fields = Fields::new();
        let mut conflicts_resolved = 0;
        let mut fields_unresolved = 0;
        let mut quality_total = 0.0;
        let mut quality_count = 0;

        for field in &field_names {
            let candidates = gather_candidates(&records, field);
            if candidates.is_empty() {
                continue;
            }
            if candidates.len() > 1 {
                conflicts_resolved += 1;
            }
            let strategy = self
                .field_strategies
                .get(field)
                .copied()
                .unwrap_or(self.default_strategy);
            match self.resolve(field, &candidates, strategy) {
                Some((value, quality)) => {
                    fields.insert(field.clone(), value);
                    quality_total += quality;
                    quality_count += 1;
                }
                None => {
                    debug!(%field, "no acceptable candidate value, field omitted");
                    fields_unresolved += 1;
                }
            }
        }

        Ok(GoldenRecord {
            cluster_id: cluster.cluster_id.clone(),
            fields,
            source_ids: cluster.members.clone(),
            conflicts_resolved,
            fields_unresolved,
            quality_score: if quality_count > 0 {
                quality_total / quality_count as f64
            } else {
                0.0
            },
        })
    }

    /// Synthesize golden records for every cluster and persist them
    /// keyed by cluster id.
    pub fn synthesize_all(
        &self,
        clusters: &[Cluster],
        golden_collection: &str,
    ) -> Result<(Vec<GoldenRecord>, GoldenStats)> {
        validate_collection_name(golden_collection)?;
        self.store.ensure_collection(golden_collection)?;
        let mut stats = GoldenStats {
            clusters_in: clusters.len(),
            ..GoldenStats::default()
        };
        let mut records = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let golden = self.synthesize(cluster)?;
            stats.conflicts_resolved += golden.conflicts_resolved;
            stats.fields_unresolved += golden.fields_unresolved;

            let mut doc = Fields::new();
            doc.insert("cluster_id".into(), Value::String(golden.cluster_id.clone()));
            for (k, v) in &golden.fields {
                doc.insert(k.clone(), v.clone());
            }
            doc.insert(
                "source_ids".into(),
                Value::Array(
                    golden
                        .source_ids
                        .iter()
                        .map(|id| Value::String(id.clone()))
                        .collect(),
                ),
            );
            doc.insert(
                "conflicts_resolved".into(),
                Value::from(golden.conflicts_resolved),
            );
            doc.insert("quality_score".into(), Value::from(golden.quality_score));
            self.store
                .upsert_document(golden_collection, &Record::new(golden.cluster_id.clone(), doc))?;

            records.push(golden);
        }
        stats.records_built = records.len();
        info!(
            clusters = stats.clusters_in,
            records = stats.records_built,
            conflicts = stats.conflicts_resolved,
            "golden records synthesized"
        );
        Ok((records, stats))
    }

    /// Resolve one field. Returns the chosen value and its quality.
    fn resolve(
        &self,
        field: &str,
        candidates: &[CandidateValue],
        strategy: ResolutionStrategy,
    ) -> Option<(Value, f64)> {
        match strategy {
            ResolutionStrategy::HighestQuality => self.pick_highest_quality(field, candidates),
            ResolutionStrategy::MostFrequent => {
                let top_count = candidates.iter().map(|c| c.count).max()?;
                let leaders: Vec<CandidateValue> = candidates
                    .iter()
                    .filter(|c| c.count == top_count)
                    .cloned()
                    .collect();
                self.pick_highest_quality(field, &leaders)
            }
            ResolutionStrategy::MostCompleteWithQuality => {
                let mut viable: Vec<(&CandidateValue, f64)> = candidates
                    .iter()
                    .map(|c| (c, self.value_quality(field, &c.text)))
                    .filter(|(_, q)| *q >= self.min_quality)
                    .collect();
                // Longest first; equal lengths by quality; stable order
                // keeps first-seen ahead on full ties.
                viable.sort_by(|(a, qa), (b, qb)| {
                    b.text
                        .chars()
                        .count()
                        .cmp(&a.text.chars().count())
                        .then(qb.partial_cmp(qa).unwrap_or(std::cmp::Ordering::Equal))
                });
                viable
                    .first()
                    .map(|(c, q)| (c.value.clone(), *q))
            }
        }
    }

    fn pick_highest_quality(
        &self,
        field: &str,
        candidates: &[CandidateValue],
    ) -> Option<(Value, f64)> {
        // First-seen wins ties because candidates arrive in member order
        // and the comparison is strict.
        let mut best: Option<(&CandidateValue, f64)> = None;
        for candidate in candidates {
            let quality = self.value_quality(field, &candidate.text);
            match &best {
                Some((_, best_quality)) if quality <= *best_quality => {}
                _ => best = Some((candidate, quality)),
            }
        }
        best.map(|(c, q)| (c.value.clone(), q))
    }

    /// Quality of one candidate value in `[0, 1]`: validator verdict
    /// (0.4), length within a sane band (0.3), clean characters (0.3).
    fn value_quality(&self, field: &str, value: &str) -> f64 {
        let validator_component = match self
            .field_validators
            .get(field)
            .and_then(|id| self.validators.get(id))
        {
            Some(validator) => {
                if validator.is_valid(value) {
                    0.4
                } else {
                    0.0
                }
            }
            // No validator configured: the component is not withheld.
            None => 0.4,
        };
        let length = value.chars().count();
        let length_component = if (1..=200).contains(&length) { 0.3 } else { 0.0 };
        let clean = !value.chars().any(char::is_control)
            && value.split_whitespace().all(|t| t.chars().count() <= 64);
        let clean_component = if clean { 0.3 } else { 0.0 };
        validator_component + length_component + clean_component
    }
}

/// One distinct candidate value for a field.
#[derive(Debug, Clone)]
struct CandidateValue {
    /// Comparable text rendering.
    text: String,
    /// The original JSON value (first occurrence).
    value: Value,
    /// How many members carried this text.
    count: usize,
}

/// Distinct values in first-seen member order, with counts. Nulls and
/// non-scalar values are dropped.
fn gather_candidates(records: &[&Record], field: &str) -> Vec<CandidateValue> {
    let mut candidates: Vec<CandidateValue> = Vec::new();
    for record in records {
        let Some(text) = record.text(field) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        match candidates.iter_mut().find(|c| c.text == text) {
            Some(existing) => existing.count += 1,
            None => candidates.push(CandidateValue {
                text,
                value: record.get(field).cloned().unwrap_or(Value::Null),
                count: 1,
            }),
        }
    }
    candidates
}

fn default_validators() -> Vec<Arc<dyn FieldValidator>> {
    vec![
        Arc::new(EmailValidator),
        Arc::new(PhoneValidator),
        Arc::new(ZipValidator),
        Arc::new(StateValidator),
    ]
}
