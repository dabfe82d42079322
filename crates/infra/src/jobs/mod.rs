//! Background job system with retry, backoff, and stall recovery.
//!
//! ## Design
//!
//! - Jobs are JSON-payload records in a durable store
//! - Retry policy with fixed or exponential backoff
//! - Priority scheduling (lower value first, FIFO within a priority)
//! - Stalled-job detection via worker heartbeats
//! - Retention policies drive purging of terminal records
//!
//! ## Components
//!
//! - `Job`: core job abstraction with payload and policies
//! - `JobStore`: persistence for jobs (in-memory or Postgres)
//! - `WorkerPool`: bounded-concurrency execution with stall recovery
//! - `QueueManager`: enqueue facade and aggregate statistics

pub mod manager;
pub mod postgres;
pub mod store;
pub mod types;
pub mod worker;

pub use manager::{EnqueueOptions, QueueManager};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, Job, JobId, JobStats, JobStatus, RetentionPolicy, RetryPolicy,
};
pub use worker::{
    JobHandler, JobNotification, ProcessingError, SweepReport, WorkerPool, WorkerPoolHandle,
};
