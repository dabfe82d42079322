//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued and eligible to be claimed
    Waiting,
    /// Scheduled for later (initial delay or retry backoff)
    Delayed,
    /// Claimed by a worker and executing
    Active,
    /// Finished successfully
    Completed,
    /// Exhausted its attempts (or was forcibly failed after stalling)
    Failed { error: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }

    /// Storage name of the status bucket.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Base delay between retries.
    pub base_delay: Duration,
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate the delay applied after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let factor = 1u64 << u64::from((attempt - 1).min(32));
                base_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(delay_ms)
    }

    /// Check if more attempts are allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// What happens to a job record once it reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep the record until an operator removes it
    Keep,
    /// Purge on the next reaper pass
    Remove,
    /// Purge once the record has been terminal for this long
    After(Duration),
}

impl RetentionPolicy {
    /// Whether a record that became terminal at `finished_at` is due for
    /// purging at `now`.
    pub fn expired(&self, finished_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            RetentionPolicy::Keep => false,
            RetentionPolicy::Remove => true,
            RetentionPolicy::After(window) => {
                let window = chrono::Duration::from_std(*window).unwrap_or_default();
                finished_at + window <= now
            }
        }
    }
}

/// A background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// JSON payload (e.g. the document to process)
    pub payload: serde_json::Value,
    /// Scheduling weight; lower values are served first, ties run FIFO
    pub priority: i32,
    /// Current status
    pub status: JobStatus,
    /// Retry policy
    pub retry: RetryPolicy,
    /// Attempts consumed so far (advances when a worker claims the job)
    pub attempt: u32,
    /// Retention after successful completion
    pub remove_on_complete: RetentionPolicy,
    /// Retention after terminal failure
    pub remove_on_fail: RetentionPolicy,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job was last updated
    pub updated_at: DateTime<Utc>,
    /// When the job becomes eligible to run (delay or retry backoff)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Last liveness signal from the worker executing this job
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Times this job was detected stalled
    pub stalled_count: u32,
    /// Error from the most recent failed attempt
    pub last_error: Option<String>,
}

impl Job {
    /// Create a new job in `Waiting` with default policies.
    pub fn new(payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            priority: 0,
            status: JobStatus::Waiting,
            retry: RetryPolicy::default(),
            attempt: 0,
            remove_on_complete: RetentionPolicy::After(Duration::from_secs(24 * 60 * 60)),
            remove_on_fail: RetentionPolicy::Keep,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            finished_at: None,
            heartbeat_at: None,
            stalled_count: 0,
            last_error: None,
        }
    }

    /// Set the scheduling weight (lower runs first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a custom retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set retention for both terminal outcomes.
    pub fn with_retention(
        mut self,
        remove_on_complete: RetentionPolicy,
        remove_on_fail: RetentionPolicy,
    ) -> Self {
        self.remove_on_complete = remove_on_complete;
        self.remove_on_fail = remove_on_fail;
        self
    }

    /// Schedule the job with a minimum delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self.status = JobStatus::Delayed;
        self
    }

    /// Check if the job is eligible to execute at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Mark job as claimed: consumes an attempt and starts the heartbeat.
    pub fn mark_active(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Active;
        self.attempt += 1;
        self.scheduled_at = None;
        self.heartbeat_at = Some(now);
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
        self.heartbeat_at = None;
        self.updated_at = now;
    }

    /// Mark the current attempt as failed.
    ///
    /// Schedules a retry with the configured backoff while attempts remain,
    /// otherwise the job becomes terminally `Failed`.
    pub fn mark_failed(&mut self, error: String) {
        let now = Utc::now();
        self.heartbeat_at = None;
        self.updated_at = now;
        if self.retry.should_retry(self.attempt) {
            let backoff = self.retry.delay_for_attempt(self.attempt);
            self.scheduled_at =
                Some(now + chrono::Duration::from_std(backoff).unwrap_or_default());
            self.status = JobStatus::Delayed;
            self.last_error = Some(error);
        } else {
            self.status = JobStatus::Failed {
                error: error.clone(),
            };
            self.last_error = Some(error);
            self.finished_at = Some(now);
        }
    }

    /// Record a stall detection.
    ///
    /// Requeues the job (giving back the attempt the stalled run consumed)
    /// while the stall budget lasts; past the budget the job goes through
    /// the normal failure path.
    pub fn mark_stalled(&mut self, max_stalled_count: u32) {
        self.stalled_count += 1;
        if self.stalled_count <= max_stalled_count {
            self.attempt = self.attempt.saturating_sub(1);
            self.status = JobStatus::Waiting;
            self.scheduled_at = None;
            self.heartbeat_at = None;
            self.updated_at = Utc::now();
        } else {
            self.mark_failed(format!(
                "stalled {} times without a liveness signal",
                self.stalled_count
            ));
        }
    }

    /// Record a liveness signal.
    pub fn renew_heartbeat(&mut self, at: DateTime<Utc>) {
        self.heartbeat_at = Some(at);
        self.updated_at = at;
    }
}

/// Point-in-time queue statistics, aggregated on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub total: usize,
}
