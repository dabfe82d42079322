//! OpenAI-compatible HTTP embedding backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pulsecrm_ai::{Embedder, Embedding, EmbeddingError};

use crate::config::EmbeddingBackendConfig;

/// Embedding backend speaking the OpenAI `/embeddings` wire format.
///
/// Any endpoint accepting `{model, input, dimensions}` with bearer auth
/// works; the endpoint and credentials come from configuration.
pub struct HttpEmbedder {
    config: EmbeddingBackendConfig,
    http_client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingApiRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: u32,
}

#[derive(Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingApiVector>,
}

#[derive(Deserialize)]
struct EmbeddingApiVector {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingBackendConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    /// Construct from environment configuration.
    ///
    /// Fails fast with a descriptive error when required settings
    /// (the API key) are absent.
    pub fn from_env() -> Result<Self, crate::config::ConfigError> {
        Ok(Self::new(EmbeddingBackendConfig::from_env()?))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let request = EmbeddingApiRequest {
            model: &self.config.model,
            input: texts,
            dimensions: self.config.dimensions,
        };

        let resp = self
            .http_client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::backend(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::backend(format!("{status}: {body}")));
        }

        let response: EmbeddingApiResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::invalid_response(e.to_string()))?;

        let vectors: Vec<Embedding> = response.data.into_iter().map(|d| d.embedding).collect();
        for vector in &vectors {
            if vector.len() != self.config.dimensions as usize {
                return Err(EmbeddingError::invalid_response(format!(
                    "dimension mismatch: expected {}, got {}",
                    self.config.dimensions,
                    vector.len()
                )));
            }
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> u32 {
        self.config.dimensions
    }
}
