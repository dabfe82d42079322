//! Queue facade: enqueue with policy, aggregate statistics.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use pulsecrm_core::DocumentId;

use super::store::{JobStore, JobStoreError};
use super::types::{BackoffStrategy, Job, JobId, JobStats, RetentionPolicy, RetryPolicy};

/// Enqueue-time policy knobs.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Scheduling weight; lower values are served first, ties run FIFO.
    pub priority: i32,
    /// Minimum delay before the job is eligible to run.
    pub delay: Option<Duration>,
    /// Maximum attempts, the first one included.
    pub attempts: u32,
    /// Backoff strategy between attempts.
    pub backoff: BackoffStrategy,
    /// Base backoff delay.
    pub backoff_delay: Duration,
    /// Retention after successful completion.
    pub remove_on_complete: RetentionPolicy,
    /// Retention after terminal failure.
    pub remove_on_fail: RetentionPolicy,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: None,
            attempts: 3,
            backoff: BackoffStrategy::Exponential,
            backoff_delay: Duration::from_millis(1000),
            remove_on_complete: RetentionPolicy::After(Duration::from_secs(24 * 60 * 60)),
            remove_on_fail: RetentionPolicy::Keep,
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy, delay: Duration) -> Self {
        self.backoff = strategy;
        self.backoff_delay = delay;
        self
    }
}

/// Facade over the job store: writes jobs with policy and reports
/// aggregate queue statistics.
#[derive(Clone)]
pub struct QueueManager<S: JobStore> {
    store: Arc<S>,
}

impl<S: JobStore> QueueManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Enqueue a job. Non-blocking beyond the store write.
    pub async fn enqueue(
        &self,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, JobStoreError> {
        let retry = RetryPolicy {
            max_attempts: options.attempts,
            base_delay: options.backoff_delay,
            strategy: options.backoff,
        };
        let mut job = Job::new(payload)
            .with_priority(options.priority)
            .with_retry(retry)
            .with_retention(options.remove_on_complete, options.remove_on_fail);
        if let Some(delay) = options.delay {
            job = job.delayed(delay);
        }

        let id = self.store.enqueue(job).await?;
        debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Enqueue a document-processing job with default policy.
    pub async fn enqueue_document(
        &self,
        document_id: DocumentId,
    ) -> Result<JobId, JobStoreError> {
        self.enqueue(
            json!({ "document_id": document_id }),
            EnqueueOptions::default(),
        )
        .await
    }

    /// Aggregate per-status counts over the job records visible right now.
    pub async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.store.stats().await
    }
}
