//! Engine error type.
//!
//! Only genuine failures live here. "Not yet enough entries" and "nothing
//! matched" are ordinary outcomes and are returned as values, see
//! [`crate::memory::patterns::AnalysisOutcome`] and the empty result list of
//! [`crate::memory::retrieval`].

use crate::memory::types::EntryId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The embedding model could not be loaded or reached.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    /// A stored vector does not match the encoder's output dimension.
    #[error("vector dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("pattern not found: {0}")]
    PatternNotFound(String),

    /// A long-running job observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_model_unavailable(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
