use async_trait::async_trait;

use crate::result::EmbeddingError;

/// A dense embedding vector produced for one input text.
pub type Embedding = Vec<f32>;

/// Contract for embedding backends.
///
/// Implementations convert input texts into dense vectors, one per input,
/// index-aligned with the request. This crate stays transport-agnostic:
/// HTTP clients, local models, and test doubles all live in higher layers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed every text in `texts`.
    ///
    /// Must return exactly one vector per input, in input order. Failures
    /// are transient from the caller's perspective; retry policy is the
    /// caller's concern.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError>;

    /// Output dimensionality of the vectors this backend produces.
    fn dimensions(&self) -> u32;
}
