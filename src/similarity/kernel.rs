//! Weighted multi-field similarity kernel
//!
//! Pure and deterministic: `confidence = Σ wᵢ·sᵢ / Σ wᵢ` over the fields
//! the configured null-handling mode admits. No I/O.

use super::metrics::{jaro_winkler, levenshtein_similarity, token_jaccard};
use crate::record::Record;
use crate::validate::collapse_whitespace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String metric used for each field comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityAlgorithm {
    #[default]
    JaroWinkler,
    Levenshtein,
    Jaccard,
}

impl SimilarityAlgorithm {
    /// Apply the metric to a pair of already-normalized values.
    pub fn apply(&self, a: &str, b: &str) -> f64 {
        match self {
            SimilarityAlgorithm::JaroWinkler => jaro_winkler(a, b),
            SimilarityAlgorithm::Levenshtein => levenshtein_similarity(a, b),
            SimilarityAlgorithm::Jaccard => token_jaccard(a, b),
        }
    }
}

/// How a field missing on one or both sides contributes to the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NullMode {
    /// Drop the field from both numerator and denominator.
    #[default]
    Skip,
    /// Contribute 0 to the numerator but keep the weight in the denominator.
    Zero,
    /// Treat the missing side as the empty string.
    Default,
}

/// Text normalization applied to both sides before the metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextNormalize {
    pub lowercase: bool,
    pub trim: bool,
    pub collapse_whitespace: bool,
}

impl Default for TextNormalize {
    fn default() -> Self {
        Self {
            lowercase: true,
            trim: true,
            collapse_whitespace: true,
        }
    }
}

impl TextNormalize {
    fn apply(&self, s: &str) -> String {
        let mut out = if self.lowercase {
            s.to_lowercase()
        } else {
            s.to_string()
        };
        if self.collapse_whitespace {
            out = collapse_whitespace(&out);
        } else if self.trim {
            out = out.trim().to_string();
        }
        out
    }
}

/// Result of scoring one record pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldScore {
    /// Weighted confidence in `[0, 1]`.
    pub confidence: f64,
    /// Per-field similarity for the fields that were compared.
    pub field_scores: BTreeMap<String, f64>,
    /// Number of fields present on both sides.
    pub fields_compared: usize,
}

/// The field similarity kernel.
///
/// Weights are kept in a `BTreeMap` so iteration order, and therefore
/// floating-point accumulation order, is deterministic.
#[derive(Debug, Clone)]
pub struct FieldSimilarity {
    algorithm: SimilarityAlgorithm,
    weights: BTreeMap<String, f64>,
    null_mode: NullMode,
    normalize: TextNormalize,
}

impl FieldSimilarity {
    /// Create a kernel with explicit per-field weights.
    pub fn new(algorithm: SimilarityAlgorithm, weights: BTreeMap<String, f64>) -> Self {
        Self {
            algorithm,
            weights,
            null_mode: NullMode::default(),
            normalize: TextNormalize::default(),
        }
    }

    /// Create a kernel with equal weights over the given fields,
    /// normalized to sum to 1.
    pub fn with_equal_weights(
        algorithm: SimilarityAlgorithm,
        fields: impl IntoIterator<Item = String>,
    ) -> Self {
        let fields: Vec<String> = fields.into_iter().collect();
        let w = if fields.is_empty() {
            0.0
        } else {
            1.0 / fields.len() as f64
        };
        Self::new(algorithm, fields.into_iter().map(|f| (f, w)).collect())
    }

    /// Set the null-handling mode.
    pub fn with_null_mode(mut self, mode: NullMode) -> Self {
        self.null_mode = mode;
        self
    }

    /// Set the text normalization options.
    pub fn with_normalize(mut self, normalize: TextNormalize) -> Self {
        self.normalize = normalize;
        self
    }

    /// The configured fields, in scoring order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    /// Score a record pair.
    pub fn score(&self, a: &Record, b: &Record) -> FieldScore {
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        let mut field_scores = BTreeMap::new();
        let mut fields_compared = 0;

        for (field, &weight) in &self.weights {
            if weight <= 0.0 {
                continue;
            }
            let va = a.text(field).map(|v| self.normalize.apply(&v));
            let vb = b.text(field).map(|v| self.normalize.apply(&v));

            match (va, vb) {
                (Some(va), Some(vb)) => {
                    let s = self.algorithm.apply(&va, &vb);
                    numerator += weight * s;
                    denominator += weight;
                    field_scores.insert(field.clone(), s);
                    fields_compared += 1;
                }
                (va, vb) => match self.null_mode {
                    NullMode::Skip => {}
                    NullMode::Zero => {
                        denominator += weight;
                        field_scores.insert(field.clone(), 0.0);
                    }
                    NullMode::Default => {
                        let s = self
                            .algorithm
                            .apply(va.as_deref().unwrap_or(""), vb.as_deref().unwrap_or(""));
                        numerator += weight * s;
                        denominator += weight;
                        field_scores.insert(field.clone(), s);
                    }
                },
            }
        }

        let confidence = if denominator > 0.0 {
            numerator / denominator
        } else {
            0.0
        };
        FieldScore {
            confidence,
            field_scores,
            fields_compared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person(id: &str, name: Option<&str>, city: Option<&str>) -> Record {
        let mut fields = serde_json::Map::new();
        if let Some(n) = name {
            fields.insert("name".into(), json!(n));
        }
        if let Some(c) = city {
            fields.insert("city".into(), json!(c));
        }
        Record::new(id, fields)
    }

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    // === Scenario: identical records score 1.0 ===

    #[test]
    fn identical_records_score_one() {
        let kernel = FieldSimilarity::new(
            SimilarityAlgorithm::JaroWinkler,
            weights(&[("name", 0.7), ("city", 0.3)]),
        );
        let a = person("a", Some("John Smith"), Some("Oakland"));
        let b = person("b", Some("john  smith"), Some("OAKLAND"));
        let score = kernel.score(&a, &b);
        assert!((score.confidence - 1.0).abs() < 1e-9);
        assert_eq!(score.fields_compared, 2);
    }

    // === Scenario: weighted mixture ===

    #[test]
    fn confidence_is_the_weighted_mean() {
        let kernel = FieldSimilarity::new(
            SimilarityAlgorithm::Levenshtein,
            weights(&[("name", 3.0), ("city", 1.0)]),
        );
        let a = person("a", Some("abcd"), Some("xy"));
        let b = person("b", Some("abcd"), Some("xz"));
        // name: 1.0, city: 0.5 -> (3*1.0 + 1*0.5) / 4
        let score = kernel.score(&a, &b);
        assert!((score.confidence - 3.5 / 4.0).abs() < 1e-9);
        assert_eq!(score.field_scores["name"], 1.0);
        assert!((score.field_scores["city"] - 0.5).abs() < 1e-9);
    }

    // === Scenario: null-handling modes ===

    #[test]
    fn skip_mode_drops_missing_fields_from_normalization() {
        let kernel = FieldSimilarity::new(
            SimilarityAlgorithm::JaroWinkler,
            weights(&[("name", 0.5), ("city", 0.5)]),
        );
        let a = person("a", Some("john"), None);
        let b = person("b", Some("john"), Some("Oakland"));
        let score = kernel.score(&a, &b);
        assert!((score.confidence - 1.0).abs() < 1e-9, "city skipped entirely");
        assert_eq!(score.fields_compared, 1);
        assert!(!score.field_scores.contains_key("city"));
    }

    #[test]
    fn zero_mode_keeps_weight_in_denominator() {
        let kernel = FieldSimilarity::new(
            SimilarityAlgorithm::JaroWinkler,
            weights(&[("name", 0.5), ("city", 0.5)]),
        )
        .with_null_mode(NullMode::Zero);
        let a = person("a", Some("john"), None);
        let b = person("b", Some("john"), Some("Oakland"));
        let score = kernel.score(&a, &b);
        assert!((score.confidence - 0.5).abs() < 1e-9);
        assert_eq!(score.field_scores["city"], 0.0);
    }

    #[test]
    fn default_mode_compares_against_empty_string() {
        let kernel = FieldSimilarity::new(
            SimilarityAlgorithm::Levenshtein,
            weights(&[("city", 1.0)]),
        )
        .with_null_mode(NullMode::Default);
        let a = person("a", None, None);
        let b = person("b", None, Some("Oakland"));
        let score = kernel.score(&a, &b);
        assert_eq!(score.confidence, 0.0, "empty vs non-empty");

        let c = person("c", None, None);
        let score = kernel.score(&a, &c);
        assert_eq!(score.confidence, 1.0, "both missing compare equal");
    }

    // === Scenario: no comparable fields ===

    #[test]
    fn no_overlapping_fields_scores_zero() {
        let kernel = FieldSimilarity::new(
            SimilarityAlgorithm::JaroWinkler,
            weights(&[("name", 1.0)]),
        );
        let a = person("a", None, Some("x"));
        let b = person("b", None, Some("x"));
        let score = kernel.score(&a, &b);
        assert_eq!(score.confidence, 0.0);
        assert_eq!(score.fields_compared, 0);
    }

    // === Determinism ===

    #[test]
    fn scoring_is_deterministic() {
        let kernel = FieldSimilarity::with_equal_weights(
            SimilarityAlgorithm::Jaccard,
            ["name".to_string(), "city".to_string()],
        );
        let a = person("a", Some("acme corp hq"), Some("austin"));
        let b = person("b", Some("acme corporation"), Some("austin tx"));
        let first = kernel.score(&a, &b);
        for _ in 0..10 {
            assert_eq!(kernel.score(&a, &b), first);
        }
    }
}
