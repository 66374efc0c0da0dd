//! Explicit retry/backoff for object-store calls.
//!
//! Deliberately not the SDK's built-in retrier: the numbers here (attempt
//! count, base delay, multiplier, jitter, cap) are this service's own
//! tuning knobs and need to be test-observable independent of whatever the
//! AWS SDK ships.

use rand::Rng;
use std::time::Duration;
use tracing::warn;

use super::traits::StoreError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter_ratio: f64,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter_ratio: 0.25,
            cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter_span = capped * self.jitter_ratio;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Run `op` under the given policy, retrying only errors that
/// [`StoreError::is_retryable`] marks as transient.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, ?delay, error = %err, "retrying store operation");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_never_exceeds_cap_plus_jitter() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            let d = policy.delay_for(attempt);
            let max_allowed = policy.cap.as_secs_f64() * (1.0 + policy.jitter_ratio);
            assert!(d.as_secs_f64() <= max_allowed + 0.001);
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter_ratio: 0.0,
            cap: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Backend("transient".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_not_found() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::NotFound("k".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
