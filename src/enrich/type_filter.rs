//! Type-compatibility pre-filter
//!
//! A user-supplied matrix declares which record types may match which.
//! Pairs failing the check are rejected before any scoring happens, so
//! a medication can never pair with a diagnosis.

use crate::blocking::CandidatePair;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TypeFilter {
    type_field: String,
    /// type → set of compatible types. Same-type pairs always pass.
    matrix: HashMap<String, HashSet<String>>,
}

impl TypeFilter {
    pub fn new(
        type_field: impl Into<String>,
        matrix: impl IntoIterator<Item = (String, Vec<String>)>,
    ) -> Self {
        Self {
            type_field: type_field.into(),
            matrix: matrix
                .into_iter()
                .map(|(k, v)| (k, v.into_iter().collect()))
                .collect(),
        }
    }

    /// The field carrying the record type.
    pub fn type_field(&self) -> &str {
        &self.type_field
    }

    /// Whether two types may match. Equal types always do; otherwise
    /// the matrix must link them in either direction. Records without a
    /// type are not judged.
    pub fn compatible(&self, a: Option<&str>, b: Option<&str>) -> bool {
        let (Some(a), Some(b)) = (a, b) else {
            return true;
        };
        if a == b {
            return true;
        }
        self.matrix.get(a).is_some_and(|set| set.contains(b))
            || self.matrix.get(b).is_some_and(|set| set.contains(a))
    }

    /// Drop incompatible pairs. Returns the surviving pairs and the
    /// rejected count (`type_filter_rejected` in phase statistics).
    pub fn filter_pairs(
        &self,
        pairs: Vec<CandidatePair>,
        types: &HashMap<String, String>,
    ) -> (Vec<CandidatePair>, usize) {
        let before = pairs.len();
        let kept: Vec<CandidatePair> = pairs
            .into_iter()
            .filter(|pair| {
                self.compatible(
                    types.get(&pair.a).map(String::as_str),
                    types.get(&pair.b).map(String::as_str),
                )
            })
            .collect();
        let rejected = before - kept.len();
        if rejected > 0 {
            debug!(rejected, "type filter rejected incompatible pairs");
        }
        (kept, rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> TypeFilter {
        TypeFilter::new(
            "type",
            [
                (
                    "diagnosis".to_string(),
                    vec!["condition".to_string(), "syndrome".to_string()],
                ),
            ],
        )
    }

    fn types(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(id, ty)| (id.to_string(), ty.to_string()))
            .collect()
    }

    // === Scenario: medication cannot match diagnosis ===

    #[test]
    fn incompatible_pair_is_rejected_and_counted() {
        let f = filter();
        let candidates = vec![
            CandidatePair::new("diag_001", "med_044", "collect"),
            CandidatePair::new("diag_001", "cond_002", "collect"),
        ];
        let types = types(&[
            ("diag_001", "diagnosis"),
            ("med_044", "medication"),
            ("cond_002", "condition"),
        ]);
        let (kept, rejected) = f.filter_pairs(candidates, &types);
        assert_eq!(rejected, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id_pair(), ("cond_002", "diag_001"));
    }

    #[test]
    fn equal_types_always_pass() {
        assert!(filter().compatible(Some("medication"), Some("medication")));
    }

    #[test]
    fn matrix_links_work_in_either_direction() {
        let f = filter();
        assert!(f.compatible(Some("diagnosis"), Some("condition")));
        assert!(f.compatible(Some("condition"), Some("diagnosis")));
        assert!(!f.compatible(Some("diagnosis"), Some("medication")));
    }

    #[test]
    fn untyped_records_are_not_judged() {
        assert!(filter().compatible(None, Some("diagnosis")));
        assert!(filter().compatible(None, None));
    }
}
