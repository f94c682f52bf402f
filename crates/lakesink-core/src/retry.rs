//! Retry Executor (§4.6): bounded exponential backoff with jitter around a
//! retriable operation, reset on success, cooperative cancellation via
//! `CancellationToken`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ConnectorError, ErrorClass};

/// Tuning for the backoff curve. Defaults match §4.6: base 1s, multiplier
/// 2, cap 30s, jitter ±25%.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.25,
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the `attempt`-th retry (1-indexed), with jitter applied.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = (self.base.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        let jitter = raw * self.jitter_fraction;
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        let jittered = (raw + offset).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

/// Per-retry-name bookkeeping so the caller can observe how many
/// consecutive failures a logical operation has accrued; reset on the
/// first success (§4.6).
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryState {
    pub consecutive_failures: u32,
}

/// Runs `op` under the given policy until it succeeds, a non-retriable
/// error is returned, the attempt budget is exhausted, or `cancel` fires.
pub async fn run_with_retry<F, Fut, T>(
    name: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if ErrorClass::of(&err) != ErrorClass::Retriable {
                    return Err(err);
                }
                if attempt >= policy.max_attempts {
                    warn!(
                        retry_name = name,
                        attempt, "retry budget exhausted, giving up"
                    );
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    retry_name = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retriable failure, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delay_never_exceeds_cap_plus_jitter() {
        let policy = RetryPolicy::default();
        for attempt in 1..20 {
            let delay = policy.delay_for(attempt);
            let ceiling = policy.max_delay.as_secs_f64() * (1.0 + policy.jitter_fraction);
            assert!(delay.as_secs_f64() <= ceiling + 0.001);
        }
    }

    #[test]
    fn delay_grows_with_attempt_before_capping() {
        let policy = RetryPolicy {
            jitter_fraction: 0.0,
            ..Default::default()
        };
        let d1 = policy.delay_for(1);
        let d2 = policy.delay_for(2);
        let d3 = policy.delay_for(3);
        assert!(d1 < d2);
        assert!(d2 < d3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            ..Default::default()
        };
        let result = run_with_retry("unit-test", policy, &cancel, || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ConnectorError::Storage("request timed out".into()))
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
    async fn terminal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let result: Result<(), ConnectorError> =
            run_with_retry("unit-test", RetryPolicy::default(), &cancel, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ConnectorError::Validation("bad field".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), ConnectorError> =
            run_with_retry("unit-test", RetryPolicy::default(), &cancel, || async {
                Err(ConnectorError::Storage("request timed out".into()))
            })
            .await;
        assert!(matches!(result, Err(ConnectorError::Cancelled)));
    }
}
