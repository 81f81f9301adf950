//! Retry Logic with Exponential Backoff
//!
//! Remote byte-range reads fail transiently: connections reset, servers
//! return 503 under load, local disks hit EINTR. This module retries those
//! failures with exponential backoff before they are surfaced as problems.
//!
//! ```text
//! backoff = min(initial_backoff * multiplier^attempt, max_backoff)
//!
//! Defaults (100ms initial, 2x multiplier, 10s max):
//! - Attempt 1: immediate
//! - Attempt 2: wait 100ms
//! - Attempt 3: wait 200ms
//! - Attempt 4: wait 400ms
//! ```
//!
//! Only errors classified retryable by [`Error::is_retryable`] are retried;
//! corruption errors fail immediately (re-reading corrupt bytes returns the
//! same corrupt bytes). Jitter (±25%) spreads simultaneous retries from
//! multiple sources so a recovering server is not hit by a thundering herd.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Retry policy for byte-range reads.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the initial try
    pub max_retries: usize,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,

    /// Apply ±25% random jitter to each backoff
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Calculate backoff duration for a given attempt number (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64).min(self.max_backoff);

        if self.jitter {
            let factor = 0.75 + (rand::random::<f64>() * 0.5); // 0.75-1.25x
            Duration::from_millis((backoff.as_millis() as f64 * factor) as u64)
        } else {
            backoff
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Returns the first success, or fails fast on a non-retryable error, or
/// returns [`Error::RetriesExhausted`] wrapping the last failure once the
/// attempt budget is spent.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Read succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempts = attempt + 1,
                        error = %err,
                        "Retries exhausted, giving up"
                    );
                    return Err(Error::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(err),
                    });
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis(),
                    error = %err,
                    "Retryable read error, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
