//! In-process embedding dispatch: a FIFO pending queue drained by a single
//! paced loop that batches requests into backend calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use pulsecrm_ai::{Embedder, Embedding, EmbeddingError};

use super::rate_limit::RateLimiter;
use crate::config::DispatcherConfig;

/// One pending request: the text plus the caller's reply slot.
struct PendingRequest {
    text: String,
    reply: oneshot::Sender<Result<Embedding, EmbeddingError>>,
}

/// Caller-side handle for a submitted request.
///
/// Settles exactly once: either the embedding vector, or the terminal error
/// of the batch the request rode in.
pub struct EmbeddingTicket {
    rx: oneshot::Receiver<Result<Embedding, EmbeddingError>>,
}

impl EmbeddingTicket {
    /// Await the outcome.
    pub async fn wait(self) -> Result<Embedding, EmbeddingError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(EmbeddingError::Dropped),
        }
    }
}

/// Rate-limited batching dispatcher for embedding requests.
///
/// One instance owns the pending queue, the rate state, and the drain
/// exclusivity flag; there is no process-global state. Clones share the
/// same queue, so handing clones to concurrent producers is cheap and safe:
/// whichever producer finds the dispatcher idle starts the drain, and every
/// request enqueued while it runs is served by that same drain.
///
/// Rate limiting is per dispatcher instance (per process). In a
/// multi-instance deployment each instance enforces the ceiling
/// independently.
#[derive(Clone)]
pub struct EmbeddingDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    embedder: Arc<dyn Embedder>,
    config: DispatcherConfig,
    limiter: RateLimiter,
    pending: Mutex<VecDeque<PendingRequest>>,
    draining: AtomicBool,
}

impl EmbeddingDispatcher {
    pub fn new(embedder: Arc<dyn Embedder>, config: DispatcherConfig) -> Self {
        let limiter = RateLimiter::new(config.max_requests_per_minute);
        Self {
            inner: Arc::new(Inner {
                embedder,
                config,
                limiter,
                pending: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a text for embedding.
    ///
    /// Non-blocking; the returned ticket settles once the drain loop has
    /// processed the request. Starts a drain task if none is running.
    ///
    /// Pending requests live only in memory: they are lost on process
    /// restart, and a request rejected after retry exhaustion is never
    /// retried without a fresh `submit`.
    pub fn submit(&self, text: impl Into<String>) -> EmbeddingTicket {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.push_back(PendingRequest {
                text: text.into(),
                reply: tx,
            });
        }
        self.spawn_drain_if_idle();
        EmbeddingTicket { rx }
    }

    /// Number of requests waiting to be drained.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    fn spawn_drain_if_idle(&self) {
        if !self.inner.draining.swap(true, Ordering::AcqRel) {
            let inner = self.inner.clone();
            tokio::spawn(drain(inner));
        }
    }
}

/// The single active drain loop.
///
/// Exclusivity is held through the `draining` flag: the loop releases it
/// only after observing an empty queue, then re-checks for requests that
/// raced in during the release and re-acquires if it wins.
async fn drain(inner: Arc<Inner>) {
    debug!("embedding drain started");
    loop {
        if inner.pending.lock().unwrap().is_empty() {
            inner.draining.store(false, Ordering::Release);
            let raced = !inner.pending.lock().unwrap().is_empty();
            if raced && !inner.draining.swap(true, Ordering::AcqRel) {
                continue;
            }
            break;
        }

        inner.limiter.await_slot().await;

        let batch: Vec<PendingRequest> = {
            let mut pending = inner.pending.lock().unwrap();
            let take = pending.len().min(inner.config.batch_size);
            pending.drain(..take).collect()
        };
        if batch.is_empty() {
            continue;
        }

        process_batch(&inner, batch).await;
    }
    debug!("embedding drain finished");
}

/// Issue one backend call for the whole batch, retrying transient failures,
/// then settle every member exactly once.
async fn process_batch(inner: &Inner, batch: Vec<PendingRequest>) {
    let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
    let attempts = inner.config.retry_limit.max(1);

    let mut attempt = 0u32;
    let last_error = loop {
        attempt += 1;
        match inner.embedder.embed(&texts).await {
            Ok(vectors) => {
                if vectors.len() != batch.len() {
                    // Contract violation, not a transient failure.
                    let err = EmbeddingError::invalid_response(format!(
                        "expected {} vectors, got {}",
                        batch.len(),
                        vectors.len()
                    ));
                    warn!(error = %err, "embedding backend broke the batch contract");
                    reject_all(batch, err);
                    return;
                }
                debug!(batch = vectors.len(), attempt, "embedding batch resolved");
                for (request, vector) in batch.into_iter().zip(vectors) {
                    let _ = request.reply.send(Ok(vector));
                }
                return;
            }
            Err(err) => {
                warn!(attempt, error = %err, "embedding batch attempt failed");
                if attempt >= attempts {
                    break err;
                }
                let backoff = inner.config.base_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
        }
    };

    warn!(batch = batch.len(), error = %last_error, "embedding batch exhausted retries");
    reject_all(batch, last_error);
}

fn reject_all(batch: Vec<PendingRequest>, error: EmbeddingError) {
    for request in batch {
        let _ = request.reply.send(Err(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Test backend: fails the first `fail_first` calls, records every call
    /// with its input size and grant time, and flags overlapping calls.
    struct ScriptedEmbedder {
        fail_first: u32,
        call_delay: Duration,
        calls: Mutex<Vec<(usize, Instant)>>,
        in_flight: AtomicU32,
        overlapped: AtomicBool,
    }

    impl ScriptedEmbedder {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                call_delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicU32::new(0),
                overlapped: AtomicBool::new(false),
            }
        }

        fn with_call_delay(mut self, delay: Duration) -> Self {
            self.call_delay = delay;
            self
        }

        fn call_sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().map(|(n, _)| *n).collect()
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    #[async_trait]
    impl Embedder for ScriptedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((texts.len(), Instant::now()));
                calls.len() as u32
            };
            if !self.call_delay.is_zero() {
                tokio::time::sleep(self.call_delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if call_index <= self.fail_first {
                return Err(EmbeddingError::backend(format!("boom {call_index}")));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }

        fn dimensions(&self) -> u32 {
            1
        }
    }

    fn dispatcher(embedder: Arc<ScriptedEmbedder>, config: DispatcherConfig) -> EmbeddingDispatcher {
        EmbeddingDispatcher::new(embedder, config)
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_five_requests_drain_as_three_paced_batches() {
        let embedder = Arc::new(ScriptedEmbedder::new(0));
        let dispatcher = dispatcher(embedder.clone(), DispatcherConfig::default());

        let tickets: Vec<_> = (0..25)
            .map(|i| dispatcher.submit("x".repeat(i + 1)))
            .collect();

        for (i, ticket) in tickets.into_iter().enumerate() {
            let vector = ticket.wait().await.unwrap();
            assert_eq!(vector, vec![(i + 1) as f32]);
        }

        assert_eq!(embedder.call_sizes(), vec![10, 10, 5]);

        // Batch dispatches respect the 60_000 / 140 = 428ms minimum spacing.
        let times = embedder.call_times();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(428));
        }

        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_batch_rejects_every_member_with_last_error() {
        let embedder = Arc::new(ScriptedEmbedder::new(u32::MAX));
        let dispatcher = dispatcher(embedder.clone(), DispatcherConfig::default());

        let tickets: Vec<_> = (0..3).map(|i| dispatcher.submit(format!("doc {i}"))).collect();

        for ticket in tickets {
            let err = ticket.wait().await.unwrap_err();
            assert_eq!(err, EmbeddingError::backend("boom 3"));
        }

        // Three total attempts, then nothing without a fresh submit.
        assert_eq!(embedder.call_sizes().len(), 3);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(embedder.call_sizes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_recover_with_doubling_backoff() {
        let embedder = Arc::new(ScriptedEmbedder::new(2));
        let dispatcher = dispatcher(embedder.clone(), DispatcherConfig::default());

        let vector = dispatcher.submit("hello").wait().await.unwrap();
        assert_eq!(vector, vec![5.0]);

        let times = embedder.call_times();
        assert_eq!(times.len(), 3);
        assert!(times[1] - times[0] >= Duration::from_millis(1000));
        assert!(times[2] - times[1] >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_producers_are_served_by_one_drain() {
        let embedder = Arc::new(
            ScriptedEmbedder::new(0).with_call_delay(Duration::from_millis(10)),
        );
        let config = DispatcherConfig {
            max_requests_per_minute: 60_000,
            ..DispatcherConfig::default()
        };
        let dispatcher = dispatcher(embedder.clone(), config);

        let mut producers = Vec::new();
        for _ in 0..4 {
            let dispatcher = dispatcher.clone();
            producers.push(tokio::spawn(async move {
                let tickets: Vec<_> = (0..10).map(|i| dispatcher.submit("x".repeat(i + 1))).collect();
                for ticket in tickets {
                    ticket.wait().await.unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        assert!(!embedder.overlapped.load(Ordering::SeqCst));
        assert_eq!(embedder.call_sizes().iter().sum::<usize>(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_dispatcher_starts_a_fresh_drain_per_submit() {
        let embedder = Arc::new(ScriptedEmbedder::new(0));
        let dispatcher = dispatcher(embedder.clone(), DispatcherConfig::default());

        dispatcher.submit("one").wait().await.unwrap();
        dispatcher.submit("two").wait().await.unwrap();

        assert_eq!(embedder.call_sizes(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_vector_count_fails_the_batch_without_retry() {
        struct ShortEmbedder {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Embedder for ShortEmbedder {
            async fn embed(&self, _texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![vec![1.0]])
            }

            fn dimensions(&self) -> u32 {
                1
            }
        }

        let embedder = Arc::new(ShortEmbedder { calls: AtomicU32::new(0) });
        let dispatcher = EmbeddingDispatcher::new(embedder.clone(), DispatcherConfig::default());

        let a = dispatcher.submit("a");
        let b = dispatcher.submit("b");
        assert!(matches!(a.wait().await, Err(EmbeddingError::InvalidResponse(_))));
        assert!(matches!(b.wait().await, Err(EmbeddingError::InvalidResponse(_))));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }
}
