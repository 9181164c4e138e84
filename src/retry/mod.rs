//! Retry module
//!
//! Bounded retry with exponential backoff for idempotent network calls.
//!
//! Every chunk delivery and every replayable atomic item upload runs through
//! [`retry`]. The default [`RetryPolicy`] allows 3 retries (4 attempts in
//! total), starting at 1000 ms and doubling up to a 10,000 ms cap.
//!
//! # Example
//!
//! ```no_run
//! use preweave_uploadr::retry::{retry, RetryPolicy};
//!
//! # async fn example() -> Result<(), std::io::Error> {
//! let policy = RetryPolicy::default();
//! let value = retry(&policy, "example", |attempt| async move {
//!     if attempt < 2 {
//!         Err(std::io::Error::other("transient"))
//!     } else {
//!         Ok(attempt)
//!     }
//! })
//! .await?;
//! assert_eq!(value, 2);
//! # Ok(())
//! # }
//! ```

use crate::metrics;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry policy for a single logical operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first one. Default: 3
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Delay before the first retry in milliseconds. Default: 1000
    #[serde(default = "default_min_timeout")]
    pub min_timeout_ms: u64,

    /// Upper bound for any single delay in milliseconds. Default: 10000
    #[serde(default = "default_max_timeout")]
    pub max_timeout_ms: u64,

    /// Growth factor applied per retry. Default: 2.0
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            min_timeout_ms: default_min_timeout(),
            max_timeout_ms: default_max_timeout(),
            factor: default_factor(),
        }
    }
}

fn default_retries() -> u32 {
    3
}

fn default_min_timeout() -> u64 {
    1000
}

fn default_max_timeout() -> u64 {
    10_000
}

fn default_factor() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Policy that performs exactly one attempt
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Total number of attempts, including the first
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay to wait before retry number `retry` (1-based)
    ///
    /// `min_timeout * factor^(retry - 1)`, capped at `max_timeout`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let raw = self.min_timeout_ms as f64 * self.factor.powi(exponent);
        let capped = raw.min(self.max_timeout_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Run `op` until it succeeds or the policy's attempt budget is spent.
///
/// `op` receives the 0-based attempt number. The last error is returned once
/// every attempt has failed; it is never dropped.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < max_attempts => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                metrics::record_retry(operation);

                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(
                    operation = operation,
                    attempts = max_attempts,
                    error = %e,
                    "Retry budget exhausted"
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.min_timeout_ms, 1000);
        assert_eq!(policy.max_timeout_ms, 10_000);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(&RetryPolicy::default(), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(format!("failure {}", attempt))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), String> = retry(&RetryPolicy::default(), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {}", attempt)) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s of backoff on the paused clock
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(7000));
        assert!(elapsed < Duration::from_millis(7100));
    }

    #[tokio::test]
    async fn test_no_retry_policy_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry(&RetryPolicy::none(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
