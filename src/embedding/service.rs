//! Batch embedding service
//!
//! Iterates records lacking an embedding, serializes each through the
//! tuple serializer, encodes in batches, and persists vector plus
//! metadata back onto the document.

use super::{Encoder, EncoderError, EmbeddingMeta};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::serializer::TupleSerializer;
use crate::storage::{EntityStore, StorageError};
use crate::validate::validate_collection_name;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts per vector before a persistence failure aborts the run.
const PERSIST_ATTEMPTS: u32 = 3;

/// Embedding coverage of a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageStats {
    pub total: usize,
    pub embedded: usize,
    pub percent: f64,
}

/// Computes and persists embeddings for one collection.
pub struct EmbeddingService {
    store: Arc<dyn EntityStore>,
    encoder: Arc<dyn Encoder>,
    serializer: TupleSerializer,
    collection: String,
    field: String,
    batch_size: usize,
    /// Serialized text → vector. Duplicate records (identical tuple
    /// text) are encoded once per service lifetime.
    cache: DashMap<String, Vec<f32>>,
}

impl EmbeddingService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        encoder: Arc<dyn Encoder>,
        serializer: TupleSerializer,
        collection: impl Into<String>,
    ) -> Result<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        Ok(Self {
            store,
            encoder,
            serializer,
            collection,
            field: "embedding".to_string(),
            batch_size: 1000,
            cache: DashMap::new(),
        })
    }

    /// Store vectors in a different document field (multi-resolution runs).
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    /// Set the encoder batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Embed every record lacking a vector, up to `limit`. Returns the
    /// number of vectors stored.
    pub async fn embed_records(&self, limit: Option<usize>) -> Result<usize> {
        if !self.store.collection_exists(&self.collection)? {
            return Err(StorageError::CollectionNotFound(self.collection.clone()).into());
        }

        let missing = self
            .store
            .ids_missing_embedding(&self.collection, &self.field, limit)?;
        if missing.is_empty() {
            return Ok(0);
        }
        info!(
            collection = %self.collection,
            field = %self.field,
            missing = missing.len(),
            "embedding records"
        );

        let mut stored = 0;
        for chunk in missing.chunks(self.batch_size) {
            let records = self.store.fetch_many(&self.collection, chunk, None)?;

            let mut ids = Vec::with_capacity(records.len());
            let mut texts = Vec::with_capacity(records.len());
            for record in &records {
                let text = self.serializer.serialize(record);
                if text.trim().is_empty() {
                    warn!(id = %record.id, "record serialized to empty text, skipping");
                    continue;
                }
                ids.push(record.id.clone());
                texts.push(text);
            }
            if texts.is_empty() {
                continue;
            }

            // Duplicate tuple texts hit the cache instead of the model.
            let to_encode: Vec<String> = texts
                .iter()
                .filter(|t| !self.cache.contains_key(t.as_str()))
                .cloned()
                .collect();
            if !to_encode.is_empty() {
                let vectors = self.encoder.encode(&to_encode).await?;
                if vectors.len() != to_encode.len() {
                    return Err(EncoderError::ShapeMismatch {
                        expected: to_encode.len(),
                        got: vectors.len(),
                    }
                    .into());
                }
                for (text, vector) in to_encode.into_iter().zip(vectors) {
                    self.cache.insert(text, vector);
                }
            }

            let meta = EmbeddingMeta {
                model_id: self.encoder.model_id().to_string(),
                dim: self.encoder.dim(),
                created_at: Utc::now(),
            };
            for (id, text) in ids.iter().zip(texts.iter()) {
                let vector = self
                    .cache
                    .get(text)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| {
                        Error::from(EncoderError::EncodeFailed("vector missing from cache".into()))
                    })?;
                self.persist_with_retry(id, &vector, &meta)?;
                stored += 1;
            }
            debug!(batch = texts.len(), stored, "embedding batch persisted");
        }
        Ok(stored)
    }

    /// Encode a single record without persisting.
    pub async fn embed_record(&self, record: &Record) -> Result<Vec<f32>> {
        let text = self.serializer.serialize(record);
        let mut vectors = self.encoder.encode(&[text]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::from(EncoderError::EncodeFailed("empty batch result".into())))
    }

    /// Embedding coverage of the collection.
    pub fn coverage_stats(&self) -> Result<CoverageStats> {
        let total = self.store.count(&self.collection)?;
        let embedded = self
            .store
            .fetch_embeddings(&self.collection, &self.field)?
            .len();
        let percent = if total == 0 {
            0.0
        } else {
            embedded as f64 / total as f64 * 100.0
        };
        Ok(CoverageStats {
            total,
            embedded,
            percent,
        })
    }

    fn persist_with_retry(
        &self,
        id: &str,
        vector: &[f32],
        meta: &EmbeddingMeta,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self
                .store
                .store_embedding(&self.collection, id, &self.field, vector, meta)
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < PERSIST_ATTEMPTS => {
                    attempt += 1;
                    debug!(%id, attempt, "transient persistence failure, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Coarse + fine embedding pair over one collection.
///
/// The fine vectors land in `embedding`, the coarse in
/// `embedding_coarse`; metadata records each model separately.
pub struct MultiResolutionEmbedder {
    fine: EmbeddingService,
    coarse: EmbeddingService,
}

impl MultiResolutionEmbedder {
    pub fn new(
        store: Arc<dyn EntityStore>,
        fine_encoder: Arc<dyn Encoder>,
        coarse_encoder: Arc<dyn Encoder>,
        serializer: TupleSerializer,
        collection: &str,
    ) -> Result<Self> {
        Ok(Self {
            fine: EmbeddingService::new(
                store.clone(),
                fine_encoder,
                serializer.clone(),
                collection,
            )?,
            coarse: EmbeddingService::new(store, coarse_encoder, serializer, collection)?
                .with_field("embedding_coarse"),
        })
    }

    /// Embed at both resolutions. Returns `(fine, coarse)` counts.
    pub async fn embed_records(&self, limit: Option<usize>) -> Result<(usize, usize)> {
        let fine = self.fine.embed_records(limit).await?;
        let coarse = self.coarse.embed_records(limit).await?;
        Ok((fine, coarse))
    }
}
