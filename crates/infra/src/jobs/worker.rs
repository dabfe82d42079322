//! Fixed-concurrency worker pool over the durable job queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId};
use crate::config::WorkerPoolConfig;

/// Processing callback contract.
///
/// Invoked at most once per claimed attempt; the outcome drives the job
/// state machine (retry with backoff, or terminal failure).
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<(), ProcessingError>;
}

/// Failure reported by a job handler.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProcessingError {
    pub message: String,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Completion/failure notification emitted for external logging/metrics.
#[derive(Debug, Clone)]
pub enum JobNotification {
    Completed {
        job_id: JobId,
        attempt: u32,
    },
    Failed {
        job_id: JobId,
        attempt: u32,
        error: String,
        terminal: bool,
    },
    Stalled {
        job_id: JobId,
        requeued: bool,
    },
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stalled: usize,
    pub purged: u64,
}

/// Background worker pool.
///
/// Pulls jobs from the store with bounded concurrency, renews each claimed
/// job's heartbeat while its handler runs, and runs a reaper that recovers
/// stalled jobs and purges expired terminal records.
pub struct WorkerPool<S: JobStore> {
    store: Arc<S>,
    config: WorkerPoolConfig,
}

/// Handle to control a running pool.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    notifications: broadcast::Sender<JobNotification>,
}

impl WorkerPoolHandle {
    /// Subscribe to completion/failure notifications.
    ///
    /// The channel is lossy under a slow consumer; it is a metrics surface,
    /// not the source of truth (job records are).
    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.notifications.subscribe()
    }

    /// Request graceful shutdown and wait for every worker to stop.
    ///
    /// Workers finish the job they are executing before exiting.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl<S: JobStore + 'static> WorkerPool<S> {
    pub fn new(store: Arc<S>, config: WorkerPoolConfig) -> Self {
        Self { store, config }
    }

    /// Run one stalled-job sweep and one retention purge.
    ///
    /// The running pool does this periodically; it is public so operators
    /// and tests can force a pass.
    pub async fn sweep_once(&self) -> Result<SweepReport, JobStoreError> {
        sweep(&self.store, &self.config, None).await
    }

    /// Start the pool: `concurrency` worker loops plus the reaper.
    pub fn start<H: JobHandler>(self, handler: Arc<H>) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (notify_tx, _) = broadcast::channel(256);

        info!(
            pool = %self.config.name,
            concurrency = self.config.concurrency,
            "worker pool started"
        );

        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);
        for index in 0..self.config.concurrency {
            tasks.push(tokio::spawn(worker_loop(
                self.store.clone(),
                self.config.clone(),
                handler.clone(),
                shutdown_rx.clone(),
                notify_tx.clone(),
                index,
            )));
        }
        tasks.push(tokio::spawn(reaper_loop(
            self.store.clone(),
            self.config.clone(),
            shutdown_rx,
            notify_tx.clone(),
        )));

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
            notifications: notify_tx,
        }
    }
}

async fn worker_loop<S: JobStore, H: JobHandler>(
    store: Arc<S>,
    config: WorkerPoolConfig,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
    notify: broadcast::Sender<JobNotification>,
    index: usize,
) {
    debug!(pool = %config.name, worker = index, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match store.claim_next().await {
            Ok(Some(mut job)) => {
                run_claimed(&store, &config, handler.as_ref(), &mut job, &notify).await;
            }
            Ok(None) => {
                // Queue empty; wake on shutdown or after the poll interval.
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                error!(pool = %config.name, error = %e, "failed to claim job");
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }

    debug!(pool = %config.name, worker = index, "worker stopped");
}

/// Execute one claimed job: run the handler, renew the heartbeat while it
/// runs, then apply the outcome to the job record.
async fn run_claimed<S: JobStore, H: JobHandler + ?Sized>(
    store: &S,
    config: &WorkerPoolConfig,
    handler: &H,
    job: &mut Job,
    notify: &broadcast::Sender<JobNotification>,
) {
    let job_id = job.id;
    debug!(job_id = %job_id, attempt = job.attempt, "claimed job");

    let result = {
        let mut ticker = tokio::time::interval(config.stalled_check_interval / 2);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the claim already stamped a
        // heartbeat, so swallow it.
        ticker.tick().await;

        let mut fut = std::pin::pin!(handler.handle(job));
        loop {
            tokio::select! {
                res = &mut fut => break res,
                _ = ticker.tick() => {
                    if let Err(e) = store.heartbeat(job_id, Utc::now()).await {
                        warn!(job_id = %job_id, error = %e, "heartbeat update failed");
                    }
                }
            }
        }
    };

    match result {
        Ok(()) => {
            job.mark_completed();
            if let Err(e) = store.update(job).await {
                error!(job_id = %job_id, error = %e, "failed to record completion");
            }
            debug!(job_id = %job_id, attempt = job.attempt, "job completed");
            let _ = notify.send(JobNotification::Completed {
                job_id,
                attempt: job.attempt,
            });
        }
        Err(err) => {
            job.mark_failed(err.message.clone());
            if let Err(e) = store.update(job).await {
                error!(job_id = %job_id, error = %e, "failed to record failure");
            }
            let terminal = job.status.is_terminal();
            if terminal {
                warn!(job_id = %job_id, attempt = job.attempt, error = %err, "job permanently failed");
            } else {
                debug!(job_id = %job_id, attempt = job.attempt, error = %err, "job attempt failed, will retry");
            }
            let _ = notify.send(JobNotification::Failed {
                job_id,
                attempt: job.attempt,
                error: err.message,
                terminal,
            });
        }
    }
}

async fn reaper_loop<S: JobStore>(
    store: Arc<S>,
    config: WorkerPoolConfig,
    mut shutdown: watch::Receiver<bool>,
    notify: broadcast::Sender<JobNotification>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(config.stalled_check_interval) => {}
        }
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = sweep(&store, &config, Some(&notify)).await {
            error!(pool = %config.name, error = %e, "reaper sweep failed");
        }
    }
}

/// Recover stalled jobs and purge expired terminal records.
async fn sweep<S: JobStore>(
    store: &S,
    config: &WorkerPoolConfig,
    notify: Option<&broadcast::Sender<JobNotification>>,
) -> Result<SweepReport, JobStoreError> {
    let now = Utc::now();
    let cutoff = now
        - chrono::Duration::from_std(config.stalled_check_interval).unwrap_or_default();

    let stalled = store.find_stalled(cutoff).await?;
    let stalled_count = stalled.len();
    for mut job in stalled {
        job.mark_stalled(config.max_stalled_count);
        let requeued = !job.status.is_terminal();
        if requeued {
            warn!(job_id = %job.id, stalls = job.stalled_count, "stalled job requeued");
        } else {
            warn!(job_id = %job.id, stalls = job.stalled_count, "stalled job failed");
        }
        store.update(&job).await?;
        if let Some(notify) = notify {
            let _ = notify.send(JobNotification::Stalled {
                job_id: job.id,
                requeued,
            });
        }
    }

    let purged = store.purge_expired(now).await?;
    if purged > 0 {
        debug!(purged, "expired terminal jobs purged");
    }

    Ok(SweepReport {
        stalled: stalled_count,
        purged,
    })
}
