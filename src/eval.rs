//! A/B evaluation harness for blocking strategies
//!
//! Runs two candidate-generation callables against a ground-truth pair
//! set and reports precision, recall, F1, reduction ratio, pairs
//! completeness, and throughput — as a machine-readable JSON value and
//! as a flat CSV with per-metric deltas.

use crate::blocking::CandidatePair;
use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Instant;

/// One labelled pair of record ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroundTruthPair {
    pub a: String,
    pub b: String,
    pub is_match: bool,
}

impl GroundTruthPair {
    /// Build a labelled pair in canonical order.
    pub fn new(x: impl Into<String>, y: impl Into<String>, is_match: bool) -> Self {
        let (x, y) = (x.into(), y.into());
        let (a, b) = if x < y { (x, y) } else { (y, x) };
        Self { a, b, is_match }
    }
}

/// Blocking-quality metrics for one strategy run.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyMetrics {
    pub name: String,
    pub candidates: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// `1 − candidates / (n·(n−1)/2)`
    pub reduction_ratio: f64,
    /// Recall at the blocking stage.
    pub pairs_completeness: f64,
    /// Candidates generated per second.
    pub throughput: f64,
    pub elapsed_secs: f64,
}

/// Per-metric baseline/hybrid comparison row.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDelta {
    pub metric: String,
    pub baseline: f64,
    pub hybrid: f64,
    pub delta: f64,
    pub percent_change: f64,
}

/// The full A/B comparison.
#[derive(Debug, Clone, Serialize)]
pub struct AbReport {
    pub baseline: StrategyMetrics,
    pub hybrid: StrategyMetrics,
    pub deltas: Vec<MetricDelta>,
}

impl AbReport {
    /// Machine-readable JSON report.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Flat CSV: one row per metric with delta and percent change.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("metric,baseline,hybrid,delta,percent_change\n");
        for row in &self.deltas {
            out.push_str(&format!(
                "{},{:.6},{:.6},{:.6},{:.2}\n",
                row.metric, row.baseline, row.hybrid, row.delta, row.percent_change
            ));
        }
        out
    }
}

/// Evaluates candidate sets against ground truth.
pub struct AbHarness {
    truth_positives: HashSet<(String, String)>,
    total_records: usize,
}

impl AbHarness {
    pub fn new(truth: &[GroundTruthPair], total_records: usize) -> Self {
        let truth_positives = truth
            .iter()
            .filter(|t| t.is_match)
            .map(|t| (t.a.clone(), t.b.clone()))
            .collect();
        Self {
            truth_positives,
            total_records,
        }
    }

    /// Score one candidate set.
    pub fn evaluate(
        &self,
        name: impl Into<String>,
        candidates: &[CandidatePair],
        elapsed_secs: f64,
    ) -> StrategyMetrics {
        let candidate_set: HashSet<(String, String)> = candidates
            .iter()
            .map(|p| (p.a.clone(), p.b.clone()))
            .collect();
        let true_positives = candidate_set
            .iter()
            .filter(|pair| self.truth_positives.contains(*pair))
            .count();
        let false_positives = candidate_set.len() - true_positives;
        let false_negatives = self.truth_positives.len() - true_positives;

        let precision = ratio(true_positives, candidate_set.len());
        let recall = ratio(true_positives, self.truth_positives.len());
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        let possible = self.total_records * self.total_records.saturating_sub(1) / 2;
        let reduction_ratio = if possible > 0 {
            1.0 - candidate_set.len() as f64 / possible as f64
        } else {
            0.0
        };
        let throughput = if elapsed_secs > 0.0 {
            candidate_set.len() as f64 / elapsed_secs
        } else {
            0.0
        };

        StrategyMetrics {
            name: name.into(),
            candidates: candidate_set.len(),
            true_positives,
            false_positives,
            false_negatives,
            precision,
            recall,
            f1,
            reduction_ratio,
            pairs_completeness: recall,
            throughput,
            elapsed_secs,
        }
    }

    /// Run and compare two candidate-set producers.
    pub fn compare<B, H>(&self, mut baseline: B, mut hybrid: H) -> Result<AbReport>
    where
        B: FnMut() -> Result<Vec<CandidatePair>>,
        H: FnMut() -> Result<Vec<CandidatePair>>,
    {
        let started = Instant::now();
        let baseline_pairs = baseline()?;
        let baseline_elapsed = started.elapsed().as_secs_f64();

        let started = Instant::now();
        let hybrid_pairs = hybrid()?;
        let hybrid_elapsed = started.elapsed().as_secs_f64();

        let baseline = self.evaluate("baseline", &baseline_pairs, baseline_elapsed);
        let hybrid = self.evaluate("hybrid", &hybrid_pairs, hybrid_elapsed);
        let deltas = deltas_between(&baseline, &hybrid);
        Ok(AbReport {
            baseline,
            hybrid,
            deltas,
        })
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn deltas_between(baseline: &StrategyMetrics, hybrid: &StrategyMetrics) -> Vec<MetricDelta> {
    let rows = [
        ("candidates", baseline.candidates as f64, hybrid.candidates as f64),
        ("precision", baseline.precision, hybrid.precision),
        ("recall", baseline.recall, hybrid.recall),
        ("f1", baseline.f1, hybrid.f1),
        (
            "reduction_ratio",
            baseline.reduction_ratio,
            hybrid.reduction_ratio,
        ),
        (
            "pairs_completeness",
            baseline.pairs_completeness,
            hybrid.pairs_completeness,
        ),
        ("throughput", baseline.throughput, hybrid.throughput),
    ];
    rows.into_iter()
        .map(|(metric, b, h)| MetricDelta {
            metric: metric.to_string(),
            baseline: b,
            hybrid: h,
            delta: h - b,
            percent_change: if b != 0.0 { (h - b) / b * 100.0 } else { 0.0 },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truth() -> Vec<GroundTruthPair> {
        vec![
            GroundTruthPair::new("r1", "r2", true),
            GroundTruthPair::new("r3", "r4", true),
            GroundTruthPair::new("r1", "r5", false),
        ]
    }

    fn pairs(specs: &[(&str, &str)]) -> Vec<CandidatePair> {
        specs
            .iter()
            .map(|(a, b)| CandidatePair::new(*a, *b, "test"))
            .collect()
    }

    // === Metric arithmetic against a known confusion matrix ===

    #[test]
    fn computes_precision_recall_f1() {
        let harness = AbHarness::new(&truth(), 10);
        // TP: (r1,r2); FP: (r1,r5), (r2,r9); FN: (r3,r4)
        let metrics = harness.evaluate(
            "baseline",
            &pairs(&[("r1", "r2"), ("r1", "r5"), ("r2", "r9")]),
            1.0,
        );
        assert_eq!(metrics.true_positives, 1);
        assert_eq!(metrics.false_positives, 2);
        assert_eq!(metrics.false_negatives, 1);
        assert!((metrics.precision - 1.0 / 3.0).abs() < 1e-9);
        assert!((metrics.recall - 0.5).abs() < 1e-9);
        let expected_f1 = 2.0 * (1.0 / 3.0) * 0.5 / (1.0 / 3.0 + 0.5);
        assert!((metrics.f1 - expected_f1).abs() < 1e-9);
        // 3 candidates over 45 possible pairs
        assert!((metrics.reduction_ratio - (1.0 - 3.0 / 45.0)).abs() < 1e-9);
        assert_eq!(metrics.pairs_completeness, metrics.recall);
        assert!((metrics.throughput - 3.0).abs() < 1e-9);
    }

    #[test]
    fn perfect_candidates_score_one() {
        let harness = AbHarness::new(&truth(), 10);
        let metrics = harness.evaluate("x", &pairs(&[("r1", "r2"), ("r3", "r4")]), 1.0);
        assert_eq!(metrics.precision, 1.0);
        assert_eq!(metrics.recall, 1.0);
        assert_eq!(metrics.f1, 1.0);
    }

    // === Comparison produces deltas and both serializations ===

    #[test]
    fn compare_reports_deltas_json_and_csv() {
        let harness = AbHarness::new(&truth(), 10);
        let report = harness
            .compare(
                || Ok(pairs(&[("r1", "r2"), ("r1", "r5")])),
                || Ok(pairs(&[("r1", "r2"), ("r3", "r4")])),
            )
            .unwrap();

        assert_eq!(report.baseline.true_positives, 1);
        assert_eq!(report.hybrid.true_positives, 2);

        let recall_delta = report
            .deltas
            .iter()
            .find(|d| d.metric == "recall")
            .unwrap();
        assert!((recall_delta.delta - 0.5).abs() < 1e-9);
        assert!((recall_delta.percent_change - 100.0).abs() < 1e-9);

        let json = report.to_json();
        assert_eq!(json["hybrid"]["recall"], 1.0);

        let csv = report.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "metric,baseline,hybrid,delta,percent_change");
        assert_eq!(lines.len(), 8, "header plus seven metrics");
        assert!(lines.iter().any(|l| l.starts_with("recall,")));
    }

    #[test]
    fn duplicate_candidates_count_once() {
        let harness = AbHarness::new(&truth(), 10);
        let metrics = harness.evaluate("x", &pairs(&[("r1", "r2"), ("r2", "r1")]), 1.0);
        assert_eq!(metrics.candidates, 1);
    }
}
