//! Generic retry with exponential backoff + jitter (spec.md §4.2).
//!
//! Backoff parameters follow the same shape as `SessionConfig` in
//! `scrapers/binance_session.rs` (base, max, multiplier, jitter factor),
//! generalized into a reusable `retry()` rather than being embedded in one
//! feed's reconnect loop.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::CoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    /// The sleep before attempt `k+1` (1-indexed `k`), per spec.md §4.2:
    /// `min(max_delay, base_delay * factor^(k-1)) * (1 ± jitter_ratio*U)`.
    pub fn delay_for_attempt(&self, k: u32) -> Duration {
        let exp = self.backoff_factor.powi((k.saturating_sub(1)) as i32);
        let nominal = self.base_delay.mul_f64(exp).min(self.max_delay);

        let mut rng = rand::thread_rng();
        let u: f64 = rng.gen_range(0.0..1.0);
        let jitter = 1.0 + self.jitter_ratio * (2.0 * u - 1.0);
        nominal.mul_f64(jitter.max(0.0))
    }
}

/// Retries `operation` under `policy`, stopping as soon as `CoreError` is
/// non-retryable (`CoreError::is_retryable`) or attempts are exhausted. On
/// exhaustion, the last error is returned. A `RateLimited` error's
/// `retry_after_secs` is honored as a *lower bound* on the computed backoff
/// sleep, per spec.md §4.2.
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt >= policy.max_attempts {
                    if attempt > 1 {
                        warn!(attempt, error = %err, "retry exhausted");
                    }
                    return Err(err);
                }

                let mut sleep_for = policy.delay_for_attempt(attempt);
                if let CoreError::RateLimited { retry_after_secs: Some(secs) } = &err {
                    sleep_for = sleep_for.max(Duration::from_secs(*secs));
                }

                debug!(attempt, delay_ms = sleep_for.as_millis() as u64, error = %err, "retrying");
                tokio::time::sleep(sleep_for).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::default();
        let result: Result<u32, CoreError> = retry(&policy, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);
        let result = retry(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoreError::TransientNetwork("boom".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn aborts_immediately_on_non_retryable() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<u32, CoreError> = retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::ParseError("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32, CoreError> = retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::TransientNetwork("still failing".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn delay_never_exceeds_max_delay_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_ratio: 0.25,
            max_attempts: 10,
        };
        for k in 1..8 {
            let d = policy.delay_for_attempt(k);
            assert!(d <= policy.max_delay.mul_f64(1.25) + Duration::from_millis(1));
        }
    }
}
