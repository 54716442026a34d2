//! Hierarchical-context disambiguation
//!
//! For hierarchical vocabularies, a candidate's parent-context string
//! carries signal the base field similarity misses. This resolver
//! blends base similarity with token overlap between one side's parent
//! context and the other side's description.

use crate::similarity::token_jaccard;
use crate::validate::normalize_for_comparison;

#[derive(Debug, Clone, Copy)]
pub struct HierarchicalContext {
    pub base_weight: f64,
    pub context_weight: f64,
}

impl Default for HierarchicalContext {
    fn default() -> Self {
        Self {
            base_weight: 0.7,
            context_weight: 0.3,
        }
    }
}

impl HierarchicalContext {
    pub fn new(base_weight: f64, context_weight: f64) -> Self {
        Self {
            base_weight,
            context_weight,
        }
    }

    /// Blend a base similarity with parent-context token overlap.
    pub fn blend(&self, base_similarity: f64, parent_context: &str, other_description: &str) -> f64 {
        let total = self.base_weight + self.context_weight;
        if total <= 0.0 {
            return base_similarity;
        }
        let overlap = token_jaccard(
            &normalize_for_comparison(parent_context),
            &normalize_for_comparison(other_description),
        );
        (self.base_weight * base_similarity + self.context_weight * overlap) / total
    }
}
