//! Integration tests for the full dispatch pipeline.
//!
//! Tests: QueueManager -> JobStore -> WorkerPool -> handler -> EmbeddingDispatcher
//!
//! Verifies:
//! - Document jobs flow end to end and settle their embedding futures
//! - Processing failures retry with backoff and still converge
//! - Stalled jobs are recovered, never left active

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::broadcast;

    use pulsecrm_ai::{Embedder, Embedding, EmbeddingError};
    use pulsecrm_core::DocumentId;

    use crate::config::{DispatcherConfig, WorkerPoolConfig};
    use crate::embeddings::EmbeddingDispatcher;
    use crate::jobs::{
        EnqueueOptions, InMemoryJobStore, Job, JobHandler, JobId, JobNotification, JobStatus,
        JobStore, ProcessingError, QueueManager, RetryPolicy, WorkerPool,
    };

    /// Embedding backend double: records inputs, always succeeds.
    struct RecordingEmbedder {
        calls: Mutex<Vec<usize>>,
    }

    impl RecordingEmbedder {
        fn arc() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn total_texts(&self) -> usize {
            self.calls.lock().unwrap().iter().sum()
        }
    }

    #[async_trait]
    impl Embedder for RecordingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
            self.calls.lock().unwrap().push(texts.len());
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }

        fn dimensions(&self) -> u32 {
            1
        }
    }

    /// Document processor: embeds the document text through the dispatcher,
    /// failing a scripted number of leading attempts first.
    struct DocumentEmbeddingHandler {
        dispatcher: EmbeddingDispatcher,
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for DocumentEmbeddingHandler {
        async fn handle(&self, job: &Job) -> Result<(), ProcessingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(ProcessingError::new(format!("induced failure {call}")));
            }

            let document_id = job.payload["document_id"]
                .as_str()
                .ok_or_else(|| ProcessingError::new("payload missing document_id"))?;

            let vector = self
                .dispatcher
                .submit(format!("document {document_id}"))
                .wait()
                .await
                .map_err(|e| ProcessingError::new(e.to_string()))?;
            if vector.is_empty() {
                return Err(ProcessingError::new("backend returned an empty vector"));
            }
            Ok(())
        }
    }

    fn fast_dispatcher(embedder: Arc<RecordingEmbedder>) -> EmbeddingDispatcher {
        // A generous ceiling keeps pacing out of the test's critical path.
        let config = DispatcherConfig {
            max_requests_per_minute: 60_000,
            base_delay: Duration::from_millis(5),
            ..DispatcherConfig::default()
        };
        EmbeddingDispatcher::new(embedder, config)
    }

    fn fast_worker_config() -> WorkerPoolConfig {
        pulsecrm_observability::init();
        WorkerPoolConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            stalled_check_interval: Duration::from_secs(30),
            max_stalled_count: 2,
            name: "pipeline-test-worker".to_string(),
        }
    }

    async fn wait_for_terminal(
        rx: &mut broadcast::Receiver<JobNotification>,
        job_id: JobId,
    ) -> Vec<JobNotification> {
        let mut seen = Vec::new();
        loop {
            let notification = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for notifications")
                .expect("notification channel closed");
            let done = match &notification {
                JobNotification::Completed { job_id: id, .. } => *id == job_id,
                JobNotification::Failed {
                    job_id: id,
                    terminal,
                    ..
                } => *id == job_id && *terminal,
                JobNotification::Stalled { .. } => false,
            };
            seen.push(notification);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn document_job_flows_through_embedding_and_completes() {
        let embedder = RecordingEmbedder::arc();
        let dispatcher = fast_dispatcher(embedder.clone());
        let store = InMemoryJobStore::arc();
        let manager = QueueManager::new(store.clone());

        let handler = Arc::new(DocumentEmbeddingHandler {
            dispatcher,
            fail_first: 0,
            calls: AtomicU32::new(0),
        });
        let handle = WorkerPool::new(store.clone(), fast_worker_config()).start(handler);
        let mut rx = handle.subscribe();

        let job_id = manager.enqueue_document(DocumentId::new()).await.unwrap();
        wait_for_terminal(&mut rx, job_id).await;
        handle.shutdown().await;

        let job = store.get(job_id).await.unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Completed));
        assert_eq!(embedder.total_texts(), 1);

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn processing_failures_retry_then_converge() {
        let embedder = RecordingEmbedder::arc();
        let dispatcher = fast_dispatcher(embedder.clone());
        let store = InMemoryJobStore::arc();
        let manager = QueueManager::new(store.clone());

        let handler = Arc::new(DocumentEmbeddingHandler {
            dispatcher,
            fail_first: 2,
            calls: AtomicU32::new(0),
        });
        let handle = WorkerPool::new(store.clone(), fast_worker_config()).start(handler.clone());
        let mut rx = handle.subscribe();

        let job_id = manager
            .enqueue(
                serde_json::json!({"document_id": DocumentId::new()}),
                EnqueueOptions::default()
                    .with_attempts(3)
                    .with_backoff(
                        crate::jobs::BackoffStrategy::Fixed,
                        Duration::from_millis(20),
                    ),
            )
            .await
            .unwrap();

        let seen = wait_for_terminal(&mut rx, job_id).await;
        handle.shutdown().await;

        let completions = seen
            .iter()
            .filter(|n| matches!(n, JobNotification::Completed { .. }))
            .count();
        assert_eq!(completions, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let job = store.get(job_id).await.unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Completed));
        assert_eq!(job.attempt, 3);
        // Only the successful attempt reaches the backend.
        assert_eq!(embedder.total_texts(), 1);
    }

    #[tokio::test]
    async fn exhausted_processing_is_reported_terminally() {
        let embedder = RecordingEmbedder::arc();
        let dispatcher = fast_dispatcher(embedder.clone());
        let store = InMemoryJobStore::arc();
        let manager = QueueManager::new(store.clone());

        let handler = Arc::new(DocumentEmbeddingHandler {
            dispatcher,
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let handle = WorkerPool::new(store.clone(), fast_worker_config()).start(handler);
        let mut rx = handle.subscribe();

        let job_id = manager
            .enqueue(
                serde_json::json!({"document_id": DocumentId::new()}),
                EnqueueOptions::default()
                    .with_attempts(2)
                    .with_backoff(
                        crate::jobs::BackoffStrategy::Fixed,
                        Duration::from_millis(10),
                    ),
            )
            .await
            .unwrap();

        let seen = wait_for_terminal(&mut rx, job_id).await;
        handle.shutdown().await;

        match seen.last().unwrap() {
            JobNotification::Failed { terminal, .. } => assert!(*terminal),
            other => panic!("expected terminal failure, got {other:?}"),
        }
        assert_eq!(manager.stats().await.unwrap().failed, 1);
        assert_eq!(embedder.total_texts(), 0);
    }

    #[tokio::test]
    async fn stalled_job_is_recovered_not_left_active() {
        let store = InMemoryJobStore::arc();
        let config = fast_worker_config();
        let pool = WorkerPool::new(store.clone(), config.clone());

        let job_id = store
            .enqueue(Job::new(serde_json::json!({"document_id": "d"})).with_retry(
                RetryPolicy::fixed(1, Duration::from_millis(10)),
            ))
            .await
            .unwrap();

        // Simulate a crashed worker: claim, then silence the heartbeat for
        // longer than the stall budget allows.
        for _ in 0..=config.max_stalled_count {
            if store.claim_next().await.unwrap().is_none() {
                break;
            }
            store
                .heartbeat(job_id, Utc::now() - chrono::Duration::minutes(5))
                .await
                .unwrap();
            pool.sweep_once().await.unwrap();

            let job = store.get(job_id).await.unwrap().unwrap();
            assert!(!matches!(job.status, JobStatus::Active));
        }

        let job = store.get(job_id).await.unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Failed { .. }));
    }
}
