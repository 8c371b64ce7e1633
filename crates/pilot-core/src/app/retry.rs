//! Retry policy for compare-and-swap conflicts.
//!
//! Every read-modify-write on a shared document can lose the race to another
//! process. The loser re-fetches and tries again, a bounded number of times,
//! sleeping with exponential backoff plus jitter so that contending workers
//! spread out.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{PilotError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,

    /// Delay after the first conflict.
    pub base_delay: Duration,

    /// Upper bound on a single delay (before jitter).
    pub max_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// No sleeping between attempts (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Backoff before attempt `attempts + 1`, without jitter.
    ///
    /// base=100ms, multiplier=2.0: 100ms, 200ms, 400ms, ... capped at `max_delay`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    /// `next_delay` plus up to 50% random jitter.
    pub fn jittered_delay(&self, attempts: u32) -> Duration {
        let delay = self.next_delay(attempts);
        let jitter_ms = (delay.as_millis() / 2) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Run `attempt` until it stops failing with `Conflict`.
    ///
    /// The closure receives the 1-indexed attempt number and must re-read the
    /// document itself. Other errors are returned immediately; running out of
    /// attempts yields `RetriesExhausted`.
    pub async fn on_conflict<T, F, Fut>(
        &self,
        operation: &'static str,
        id: &str,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for n in 1..=self.max_attempts {
            match attempt(n).await {
                Err(PilotError::Conflict { .. }) if n < self.max_attempts => {
                    let delay = self.jittered_delay(n);
                    tracing::debug!(operation, id, attempt = n, ?delay, "conflict, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(PilotError::Conflict { .. }) => break,
                other => return other,
            }
        }
        tracing::warn!(operation, id, attempts = self.max_attempts, "giving up after conflicts");
        Err(PilotError::RetriesExhausted {
            operation,
            id: id.to_string(),
            attempts: self.max_attempts,
        })
    }
}
