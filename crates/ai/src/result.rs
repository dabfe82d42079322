use thiserror::Error;

/// Embedding failure.
///
/// Variants are `Clone` because one backend failure may have to be reported
/// to every member of a batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    /// The backend call failed (transport error, non-success status).
    /// Eligible for retry.
    #[error("embedding backend error: {0}")]
    Backend(String),

    /// The backend answered with a payload that violates its contract
    /// (wrong vector count or dimensionality).
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    /// The request was dropped before a result could be produced
    /// (dispatcher shut down while the request was pending).
    #[error("embedding request dropped before completion")]
    Dropped,
}

impl EmbeddingError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }
}
