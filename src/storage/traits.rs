//! Storage trait definitions
//!
//! The engine talks to any multi-model store through `EntityStore`:
//! documents, full-text search with BM25 scoring, similarity edges with
//! merge-on-reinsert, generic relationship edges, and optional native
//! vector search. Names interpolated into queries are validated by
//! `crate::validate`; values are always parameterized.

use crate::edges::SimilarityEdge;
use crate::embedding::EmbeddingMeta;
use crate::record::{Fields, Record};
use crate::validate::{validate_field_name, ValidationError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not connected to a database")]
    NotConnected,

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("date parsing error: {0}")]
    DateParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether a bounded retry is worthwhile (lock contention, busy handles).
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A blocking key component, possibly computed server-side.
///
/// Computed keys cover the common normalizations used for blocking:
/// prefixes (`left(postal_code, 5)`), digit stripping
/// (`digits_only(phone)`), and case folding (`lower(state)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExpr {
    /// The field value as stored.
    Field(String),
    /// The first `len` characters of the field value.
    Prefix { field: String, len: u32 },
    /// The field value with every non-digit removed.
    DigitsOnly { field: String },
    /// The field value lower-cased.
    Lower { field: String },
}

impl KeyExpr {
    /// The underlying field path.
    pub fn field(&self) -> &str {
        match self {
            KeyExpr::Field(f)
            | KeyExpr::Prefix { field: f, .. }
            | KeyExpr::DigitsOnly { field: f }
            | KeyExpr::Lower { field: f } => f,
        }
    }

    /// Parse a configuration expression.
    ///
    /// Accepted forms: a bare field path, `left(field, n)`,
    /// `digits_only(field)`, `lower(field)`.
    pub fn parse(expr: &str) -> Result<Self, ValidationError> {
        let expr = expr.trim();
        let parsed = if let Some(args) = call_args(expr, "left") {
            let (field, len) = args.split_once(',').ok_or_else(|| {
                ValidationError::Config(format!("left() takes two arguments: {expr:?}"))
            })?;
            let len: u32 = len
                .trim()
                .parse()
                .map_err(|_| ValidationError::Config(format!("bad length in {expr:?}")))?;
            KeyExpr::Prefix {
                field: field.trim().to_string(),
                len,
            }
        } else if let Some(field) = call_args(expr, "digits_only") {
            KeyExpr::DigitsOnly {
                field: field.trim().to_string(),
            }
        } else if let Some(field) = call_args(expr, "lower") {
            KeyExpr::Lower {
                field: field.trim().to_string(),
            }
        } else {
            KeyExpr::Field(expr.to_string())
        };
        validate_field_name(parsed.field())?;
        Ok(parsed)
    }

    /// Evaluate the key against a record in-process. Mirrors the
    /// store-side evaluation used by `group_blocks`; `None` when the
    /// field is missing or renders empty.
    pub fn eval(&self, record: &Record) -> Option<String> {
        let text = record.text(self.field())?;
        let value = match self {
            KeyExpr::Field(_) => text,
            KeyExpr::Prefix { len, .. } => text.chars().take(*len as usize).collect(),
            KeyExpr::DigitsOnly { .. } => text.chars().filter(|c| c.is_ascii_digit()).collect(),
            KeyExpr::Lower { .. } => text.to_lowercase(),
        };
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

/// Extract `args` from `name(args)`, if `expr` has that shape.
fn call_args<'a>(expr: &'a str, name: &str) -> Option<&'a str> {
    expr.strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

/// Per-field predicate applied before grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub predicate: FilterPredicate,
}

/// Supported blocking filters.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterPredicate {
    /// Field must be present and non-empty.
    NotNull,
    /// Field text must be at least this long.
    MinLength(u32),
    /// Field text must differ from this value.
    NotEqual(String),
}

/// A group of record ids sharing a blocking key tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Stringified key components, in `KeyExpr` order.
    pub key: Vec<String>,
    /// Member record ids.
    pub members: Vec<String>,
}

/// One full-text search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct TextHit {
    pub id: String,
    /// BM25 relevance; higher is better.
    pub score: f64,
}

/// Outcome of a similarity-edge upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeUpsert {
    /// True when the edge did not previously exist.
    pub created: bool,
    /// The stored `update_count` after the operation.
    pub update_count: u32,
}

/// A similarity-edge endpoint pair with its score, as used by clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeEndpoints {
    pub from_id: String,
    pub to_id: String,
    pub similarity_score: f64,
}

/// A generic relationship edge in an existing domain graph
/// (shared phone, prescribed-by, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from_id: String,
    pub to_id: String,
    pub relationship: String,
    #[serde(default)]
    pub properties: Fields,
}

/// Trait for multi-model storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`); the engine
/// shares one store across its services.
pub trait EntityStore: Send + Sync {
    // === Collections ===

    /// Create the collection if it does not exist.
    fn ensure_collection(&self, name: &str) -> StorageResult<()>;

    /// Whether the collection exists.
    fn collection_exists(&self, name: &str) -> StorageResult<bool>;

    /// Remove every document, edge, and relation stored under the name.
    fn truncate_collection(&self, name: &str) -> StorageResult<()>;

    /// Number of documents in the collection.
    fn count(&self, name: &str) -> StorageResult<usize>;

    // === Documents ===

    /// Bulk insert, replacing documents that share an id. Returns the
    /// number written.
    fn insert_many(&self, collection: &str, records: &[Record]) -> StorageResult<usize>;

    /// Insert or replace a single document.
    fn upsert_document(&self, collection: &str, record: &Record) -> StorageResult<()>;

    /// Load a document by id.
    fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Record>>;

    /// Bulk fetch by id, optionally projected to the given field paths.
    /// Missing ids are silently absent from the result.
    fn fetch_many(
        &self,
        collection: &str,
        ids: &[String],
        fields: Option<&[String]>,
    ) -> StorageResult<Vec<Record>>;

    /// Fetch up to `limit` documents (all, when `None`).
    fn scan(&self, collection: &str, limit: Option<usize>) -> StorageResult<Vec<Record>>;

    /// All document ids, up to `limit`.
    fn list_ids(&self, collection: &str, limit: Option<usize>) -> StorageResult<Vec<String>>;

    /// Merge top-level fields into an existing document.
    fn merge_fields(&self, collection: &str, id: &str, patch: &Fields) -> StorageResult<()>;

    // === Blocking support ===

    /// Group records by a tuple of (possibly computed) blocking keys,
    /// after applying the filters. Key expressions are evaluated
    /// store-side; records with any null key component are excluded.
    fn group_blocks(
        &self,
        collection: &str,
        keys: &[KeyExpr],
        filters: &[FieldFilter],
    ) -> StorageResult<Vec<Block>>;

    // === Full-text search ===

    /// (Re)build a full-text view over the given fields of a collection.
    fn ensure_text_index(
        &self,
        view: &str,
        collection: &str,
        fields: &[String],
    ) -> StorageResult<()>;

    /// BM25-ranked search against a view. Returns hits sorted by
    /// descending score.
    fn search_text(&self, view: &str, query: &str, limit: usize) -> StorageResult<Vec<TextHit>>;

    // === Embeddings ===

    /// Attach an embedding vector and its metadata to a document. The
    /// vector lands in `field`, the metadata in `{field}_meta`.
    fn store_embedding(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        vector: &[f32],
        meta: &EmbeddingMeta,
    ) -> StorageResult<()>;

    /// Ids of documents that do not yet carry an embedding in `field`.
    fn ids_missing_embedding(
        &self,
        collection: &str,
        field: &str,
        limit: Option<usize>,
    ) -> StorageResult<Vec<String>>;

    /// All `(id, vector)` pairs that carry an embedding in `field`.
    fn fetch_embeddings(
        &self,
        collection: &str,
        field: &str,
    ) -> StorageResult<Vec<(String, Vec<f32>)>>;

    /// Whether `nearest_native` is available on this store.
    fn supports_native_vector(&self) -> bool {
        false
    }

    /// Native approximate nearest-neighbour search by cosine similarity.
    fn nearest_native(
        &self,
        _collection: &str,
        _field: &str,
        _query: &[f32],
        _k: usize,
        _min_similarity: f32,
    ) -> StorageResult<Vec<(String, f32)>> {
        Err(StorageError::Unsupported("native vector search"))
    }

    // === Similarity edges ===

    /// Insert or merge a similarity edge keyed by its deterministic pair
    /// key. See `SimilarityEdge` for the merge policy.
    fn upsert_edge(
        &self,
        edge_collection: &str,
        edge: &SimilarityEdge,
        force_update: bool,
    ) -> StorageResult<EdgeUpsert>;

    /// Load an edge by key.
    fn get_edge(&self, edge_collection: &str, key: &str) -> StorageResult<Option<SimilarityEdge>>;

    /// All edges at or above the similarity threshold.
    fn fetch_edges_above(
        &self,
        edge_collection: &str,
        min_similarity: f64,
    ) -> StorageResult<Vec<EdgeEndpoints>>;

    /// Delete every edge created by the named algorithm. Returns the
    /// number removed.
    fn delete_edges_by_algorithm(
        &self,
        edge_collection: &str,
        algorithm: &str,
    ) -> StorageResult<usize>;

    /// Number of edges in the collection.
    fn count_edges(&self, edge_collection: &str) -> StorageResult<usize>;

    /// Store-side traversal: every vertex weakly connected to `seed`
    /// through edges at or above the threshold (seed included).
    fn component_from(
        &self,
        edge_collection: &str,
        seed: &str,
        min_similarity: f64,
    ) -> StorageResult<Vec<String>>;

    // === Relationship edges ===

    /// Append a relation to an edge collection.
    fn insert_relation(&self, collection: &str, relation: &Relation) -> StorageResult<()>;

    /// All relations in an edge collection.
    fn fetch_relations(&self, collection: &str) -> StorageResult<Vec<Relation>>;

    /// Replace the whole relation set of an edge collection. Returns the
    /// number written.
    fn replace_relations(&self, collection: &str, relations: &[Relation]) -> StorageResult<usize>;

    /// Undirected reachability over relations: every vertex within
    /// `max_hops` of `seed` (seed included).
    fn neighbors_within(
        &self,
        collection: &str,
        seed: &str,
        max_hops: usize,
    ) -> StorageResult<Vec<String>>;
}

/// Extension trait for opening stores from paths.
pub trait OpenStore: EntityStore + Sized {
    /// Open or create a store at the given path.
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing and small corpora).
    fn open_in_memory() -> StorageResult<Self>;
}
