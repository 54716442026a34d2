//! Embedding support: encoder seam and batch embedding service
//!
//! Encoders are remote or model-backed services, so the seam is async;
//! everything downstream of a persisted vector is synchronous. The
//! production encoder (fastembed, ONNX) sits behind the `embeddings`
//! feature; tests use deterministic mock encoders.

mod service;

pub use service::{CoverageStats, EmbeddingService, MultiResolutionEmbedder};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the embedding encoder.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The model could not be loaded or reached. Fatal for
    /// embedding-dependent phases.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    /// Inference failed for a batch.
    #[error("encoding failed: {0}")]
    EncodeFailed(String),

    /// The encoder returned vectors of an unexpected shape.
    #[error("expected {expected} vectors, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Metadata persisted alongside each stored vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMeta {
    pub model_id: String,
    pub dim: usize,
    pub created_at: DateTime<Utc>,
}

/// Trait for text-to-vector encoders.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Stable identifier of the underlying model.
    fn model_id(&self) -> &str;

    /// Dimensionality of produced vectors.
    fn dim(&self) -> usize;

    /// Encode a batch of texts, one vector per text, in order.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError>;
}

#[cfg(feature = "embeddings")]
mod fastembed_impl {
    use super::{Encoder, EncoderError};
    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Mutex;

    /// Production encoder backed by fastembed (ONNX Runtime).
    ///
    /// Wraps `fastembed::TextEmbedding` in a `Mutex` because its `embed`
    /// method requires `&mut self`, while the `Encoder` trait uses `&self`.
    pub struct FastEmbedEncoder {
        model: Mutex<TextEmbedding>,
        model_id: String,
        dim: usize,
    }

    impl FastEmbedEncoder {
        /// Load a specific fastembed model.
        pub fn new(model: EmbeddingModel) -> Result<Self, EncoderError> {
            let info = TextEmbedding::get_model_info(&model)
                .map_err(|e| EncoderError::ModelUnavailable(e.to_string()))?;
            let model_id = info.model_code.to_string();
            let dim = info.dim;
            let options = InitOptions::new(model).with_show_download_progress(false);
            let embedding = TextEmbedding::try_new(options)
                .map_err(|e| EncoderError::ModelUnavailable(e.to_string()))?;
            Ok(Self {
                model: Mutex::new(embedding),
                model_id,
                dim,
            })
        }

        /// Load the default model (nomic-embed-text-v1.5).
        pub fn default_model() -> Result<Self, EncoderError> {
            Self::new(EmbeddingModel::NomicEmbedTextV15)
        }
    }

    #[async_trait]
    impl Encoder for FastEmbedEncoder {
        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn dim(&self) -> usize {
            self.dim
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let mut model = self.model.lock().unwrap();
            let embeddings = model
                .embed(texts.to_vec(), None)
                .map_err(|e| EncoderError::EncodeFailed(e.to_string()))?;
            if embeddings.len() != texts.len() {
                return Err(EncoderError::ShapeMismatch {
                    expected: texts.len(),
                    got: embeddings.len(),
                });
            }
            Ok(embeddings)
        }
    }
}

#[cfg(feature = "embeddings")]
pub use fastembed_impl::FastEmbedEncoder;
