//! Field similarity: string metrics and the weighted multi-field kernel

mod kernel;
mod metrics;

pub use kernel::{FieldScore, FieldSimilarity, NullMode, SimilarityAlgorithm, TextNormalize};
pub use metrics::{jaro_winkler, levenshtein_similarity, soundex, token_jaccard};
