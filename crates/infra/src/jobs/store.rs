//! Job storage: the durable-substrate abstraction and the in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{Job, JobId, JobStats, JobStatus};

/// Narrow abstraction over the durable queue substrate.
///
/// Any persistent backend (relational table, embedded log, managed queue
/// service) can satisfy this. Implementations must make `claim_next`
/// atomic: no two callers may claim or transition the same job
/// concurrently.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a new job.
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Update a job.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Atomically claim the next ready job and mark it active.
    ///
    /// Order: lowest priority value first, FIFO by enqueue time within a
    /// priority. A delayed job whose schedule has come is claimable.
    /// Returns None if nothing is ready.
    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// Record a liveness signal for an active job.
    async fn heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Active jobs whose last liveness signal is older than `cutoff`.
    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Remove terminal jobs whose retention has expired. Returns the number
    /// of purged records.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Count jobs per status bucket.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job).await
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next().await
    }

    async fn heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).heartbeat(job_id, at).await
    }

    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_stalled(cutoff).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).purge_expired(now).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

/// In-memory job store for tests/dev.
///
/// Claim atomicity comes from the write lock; a single map write covers the
/// ready-check and the transition to active.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn claimable(job: &Job, now: DateTime<Utc>) -> bool {
    match job.status {
        JobStatus::Waiting => job.is_ready(now),
        JobStatus::Delayed => job.is_ready(now),
        _ => false,
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();

        let mut candidates: Vec<_> = jobs.values().filter(|j| claimable(j, now)).collect();
        candidates.sort_by_key(|j| (j.priority, j.created_at, j.id.0));

        if let Some(job) = candidates.first() {
            let job_id = job.id;
            if let Some(job) = jobs.get_mut(&job_id) {
                job.mark_active();
                return Ok(Some(job.clone()));
            }
        }

        Ok(None)
    }

    async fn heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if matches!(job.status, JobStatus::Active) {
            job.renew_heartbeat(at);
        }
        Ok(())
    }

    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Active)
                    && j.heartbeat_at.map_or(true, |hb| hb < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| {
            let Some(finished_at) = job.finished_at else {
                return true;
            };
            let retention = match job.status {
                JobStatus::Completed => job.remove_on_complete,
                JobStatus::Failed { .. } => job.remove_on_fail,
                _ => return true,
            };
            !retention.expired(finished_at, now)
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let now = Utc::now();

        let mut stats = JobStats::default();
        for job in jobs.values() {
            match &job.status {
                JobStatus::Waiting => stats.waiting += 1,
                // A delayed job whose schedule has come is waiting in all
                // but storage representation.
                JobStatus::Delayed if job.is_ready(now) => stats.waiting += 1,
                JobStatus::Delayed => stats.delayed += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }
}
