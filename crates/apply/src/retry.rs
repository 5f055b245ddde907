//! Bounded retry for optimistic-concurrency conflicts.
//!
//! Only [`ApiError::Conflict`] is retried; every other failure (including
//! `NotFound` from an object deleted underneath us) is returned at once.

use std::future::Future;
use std::time::Duration;

use kubelink_kubehub::ApiError;
use rand::Rng;
use tracing::{error, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay added as random jitter (0.1 = up to +10%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// No sleeping between attempts; for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self { max_attempts: attempts.max(1), initial_delay: Duration::ZERO, max_delay: Duration::ZERO, backoff_multiplier: 1.0, jitter: 0.0 }
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or the budget runs out.
pub async fn retry_on_conflict<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_conflict() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                error!(operation = %operation_name, attempt, error = %e, "conflict retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let jittered = if config.jitter > 0.0 {
                    delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..config.jitter))
                } else {
                    delay
                };
                warn!(operation = %operation_name, attempt, error = %e, delay_ms = jittered.as_millis() as u64, "conflict, retrying");
                if !jittered.is_zero() {
                    tokio::time::sleep(jittered).await;
                }
                delay = delay.mul_f64(config.backoff_multiplier).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> ApiError { ApiError::Conflict("modified".into()) }

    #[tokio::test]
    async fn succeeds_after_conflicts() {
        let count = AtomicU32::new(0);
        let counter = &count;
        let res = retry_on_conflict(&RetryConfig::immediate(5), "op", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 { Err(conflict()) } else { Ok(42) }
        })
        .await;
        assert_eq!(res, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_with_last_conflict() {
        let count = AtomicU32::new(0);
        let counter = &count;
        let res: Result<(), _> = retry_on_conflict(&RetryConfig::immediate(3), "op", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(conflict())
        })
        .await;
        assert!(res.unwrap_err().is_conflict());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let count = AtomicU32::new(0);
        let counter = &count;
        let res: Result<(), _> = retry_on_conflict(&RetryConfig::immediate(5), "op", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::NotFound("gone".into()))
        })
        .await;
        assert!(res.unwrap_err().is_not_found());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_between_attempts() {
        let cfg = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        };
        let started = tokio::time::Instant::now();
        let res: Result<(), _> = retry_on_conflict(&cfg, "op", || async { Err(conflict()) }).await;
        assert!(res.is_err());
        // 100ms, then 200ms capped to 150ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(300), "elapsed={:?}", elapsed);
    }
}
