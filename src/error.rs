//! Crate-level error type
//!
//! Subsystems define their own error enums (storage, embedding,
//! validation); this umbrella wraps them for callers that drive several
//! subsystems at once, such as the pipeline orchestrator.

use crate::embedding::EncoderError;
use crate::storage::StorageError;
use crate::validate::ValidationError;
use thiserror::Error;

/// Errors surfaced by engine services.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("pipeline cancelled during {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
