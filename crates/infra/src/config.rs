//! Environment-driven configuration for the dispatch pipeline.
//!
//! Every knob has a documented default; required values (credentials,
//! connection endpoints) fail fast at startup with a descriptive error
//! instead of surfacing later as a mid-request failure.

use std::time::Duration;

use thiserror::Error;

/// Configuration error. Fatal at startup of the affected component.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    lookup(name).ok_or(ConfigError::Missing(name))
}

fn parsed_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            reason: format!("{}", e),
        }),
        None => Ok(default),
    }
}

/// Throttling, batching, and retry knobs for the embedding dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Ceiling on backend calls per minute (`MAX_REQUESTS_PER_MINUTE`).
    pub max_requests_per_minute: u32,
    /// Maximum requests drained into one backend call (`BATCH_SIZE`).
    pub batch_size: usize,
    /// Total attempts per batch before its requests are rejected
    /// (`RETRY_LIMIT`).
    pub retry_limit: u32,
    /// First backoff delay; doubles on each subsequent attempt
    /// (`BASE_DELAY_MS`).
    pub base_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 140,
            batch_size: 10,
            retry_limit: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_requests_per_minute: parsed_or(
                lookup,
                "MAX_REQUESTS_PER_MINUTE",
                defaults.max_requests_per_minute,
            )?,
            batch_size: parsed_or(lookup, "BATCH_SIZE", defaults.batch_size)?,
            retry_limit: parsed_or(lookup, "RETRY_LIMIT", defaults.retry_limit)?,
            base_delay: Duration::from_millis(parsed_or(
                lookup,
                "BASE_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
        })
    }
}

/// Worker pool sizing and stall detection knobs.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Concurrent in-flight jobs per pool instance (`CONCURRENCY`).
    pub concurrency: usize,
    /// Sleep between claim attempts while the queue is empty.
    pub poll_interval: Duration,
    /// A claimed job without a liveness signal for this long is stalled
    /// (`STALLED_CHECK_INTERVAL_MS`).
    pub stalled_check_interval: Duration,
    /// Stalls tolerated (requeue) before the job is forcibly failed
    /// (`MAX_STALLED_COUNT`).
    pub max_stalled_count: u32,
    /// Name for logging.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(100),
            stalled_check_interval: Duration::from_millis(30_000),
            max_stalled_count: 2,
            name: "document-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            concurrency: parsed_or(lookup, "CONCURRENCY", defaults.concurrency)?,
            stalled_check_interval: Duration::from_millis(parsed_or(
                lookup,
                "STALLED_CHECK_INTERVAL_MS",
                defaults.stalled_check_interval.as_millis() as u64,
            )?),
            max_stalled_count: parsed_or(
                lookup,
                "MAX_STALLED_COUNT",
                defaults.max_stalled_count,
            )?,
            ..defaults
        })
    }
}

/// Connection and auth settings for the embedding backend.
#[derive(Debug, Clone)]
pub struct EmbeddingBackendConfig {
    /// Endpoint URL (`EMBEDDING_API_URL`).
    pub api_url: String,
    /// Bearer token (`EMBEDDING_API_KEY`, required).
    pub api_key: String,
    /// Model identifier (`EMBEDDING_MODEL`).
    pub model: String,
    /// Target output dimensionality (`EMBEDDING_DIMENSIONS`).
    pub dimensions: u32,
}

impl EmbeddingBackendConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: lookup("EMBEDDING_API_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string()),
            api_key: required(lookup, "EMBEDDING_API_KEY")?,
            model: lookup("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            dimensions: parsed_or(lookup, "EMBEDDING_DIMENSIONS", 1536)?,
        })
    }
}

/// Top-level configuration for a pipeline process.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Durable queue substrate endpoint (`DATABASE_URL`, required).
    pub database_url: String,
    pub embedding: EmbeddingBackendConfig,
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerPoolConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required(lookup, "DATABASE_URL")?,
            embedding: EmbeddingBackendConfig::from_lookup(lookup)?,
            dispatcher: DispatcherConfig::from_lookup(lookup)?,
            worker: WorkerPoolConfig::from_lookup(lookup)?,
        })
    }
}
