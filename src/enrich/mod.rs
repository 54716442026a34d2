//! Orthogonal enrichments around the core pipeline
//!
//! Each enrichment is optional and independent: a type-compatibility
//! filter ahead of scoring, acronym expansion inside fuzzy blocking,
//! hierarchical-context blending inside scoring, and a post-clustering
//! provenance sweep that repoints existing relationships at canonical
//! ids.

mod acronyms;
mod hierarchy;
mod provenance;
mod type_filter;

pub use acronyms::AcronymExpander;
pub use hierarchy::HierarchicalContext;
pub use provenance::{canonical_mapping, ProvenanceSweeper, SweepStats};
pub use type_filter::TypeFilter;
