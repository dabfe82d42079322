//! Request pacing against a per-minute ceiling.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces grants so that consecutive backend calls are at least
/// `60_000 / ceiling` milliseconds apart.
///
/// Built for a single serialized caller (the dispatcher drain loop); there
/// is no fair queueing of multiple waiters. Holding the grant lock across
/// the sleep keeps accidental concurrent callers spaced correctly anyway.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_granted: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `ceiling` is the maximum number of requests per minute.
    /// A ceiling of zero disables pacing.
    pub fn new(ceiling: u32) -> Self {
        let min_interval = if ceiling == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(60_000 / u64::from(ceiling))
        };
        Self {
            min_interval,
            last_granted: Mutex::new(None),
        }
    }

    /// Minimum spacing between grants.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next slot is due, then record the grant instant.
    ///
    /// The first call is granted immediately.
    pub async fn await_slot(&self) {
        let mut last = self.last_granted.lock().await;
        if let Some(prev) = *last {
            let due = prev + self.min_interval;
            if due > Instant::now() {
                tokio::time::sleep_until(due).await;
            }
        }
        *last = Some(Instant::now());
    }
}
