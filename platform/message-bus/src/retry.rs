//! Bounded in-process retry with exponential backoff.
//!
//! The dispatcher replays a failing handler here before the delivery is
//! dead-lettered. The loop is an explicit bounded iteration with an attempt
//! counter, so stack depth stays flat and the attempt budget is visible.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry budget for one delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (not "retries after")
    pub max_attempts: u32,
    /// Delay before attempt N+1 is `base_delay * 2^(N-1)`
    pub base_delay: Duration,
    /// Cap on the exponential growth
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt - 1).min(16);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }
}

/// All attempts failed; carries the final error and how many were made.
#[derive(Debug, PartialEq)]
pub struct RetryExhausted<E> {
    pub last_error: E,
    pub attempts: u32,
}

/// Run `operation` until it succeeds or the attempt budget is spent.
///
/// Returns the successful value, or [`RetryExhausted`] with the last error
/// once `policy.max_attempts` attempts have all failed.
pub async fn run_with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempts = attempt,
                        error = %e,
                        "operation failed, attempt budget spent"
                    );
                    return Err(RetryExhausted {
                        last_error: e,
                        attempts: attempt,
                    });
                }

                let backoff = policy.delay_after(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "operation failed, retrying with backoff"
                );

                sleep(backoff).await;
            }
        }
    }
}
