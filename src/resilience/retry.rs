//! Retry with exponential backoff around provider calls.

use crate::errors::{GatewayError, GatewayResult};
use crate::resilience::circuit::CircuitBreaker;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 200;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the initial call included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Randomize each delay by up to +/- this fraction of it.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
        }
    }

    /// Backoff before attempt `n` (1-based). The first attempt is immediate;
    /// attempt n waits `base * 2^(n-2)`, capped at `max_delay_ms`, with
    /// jitter applied last.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(20);
        let base = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = base.min(self.max_delay_ms);

        let final_ms = if self.jitter_factor > 0.0 && capped > 0 {
            let spread = (capped as f64 * self.jitter_factor) as u64;
            let jitter = rand::thread_rng().gen_range(0..=spread * 2);
            capped.saturating_sub(spread).saturating_add(jitter)
        } else {
            capped
        };
        Duration::from_millis(final_ms)
    }
}

/// Run `operation` under the breaker with retry on transient failures.
///
/// An open breaker fails fast with `CircuitOpen` before any attempt.
/// Every attempt's outcome is recorded individually, so a failing run of
/// retries counts toward the breaker threshold attempt by attempt.
/// Non-retryable errors return immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    key: &str,
    mut operation: F,
) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut last_error: Option<GatewayError> = None;

    for attempt in 1..=policy.max_attempts {
        if !breaker.can_execute() {
            return Err(GatewayError::CircuitOpen {
                key: key.to_string(),
                retry_after_ms: breaker.retry_after_hint_ms(),
            });
        }

        let delay = match &last_error {
            Some(err) => err
                .retry_after()
                .unwrap_or_else(|| policy.delay_before_attempt(attempt)),
            None => policy.delay_before_attempt(attempt),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) => {
                breaker.record_failure();
                if !err.is_retryable() {
                    return Err(err);
                }
                debug!(%key, attempt, error = %err, "retryable provider failure");
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        GatewayError::transport("retry loop finished without an attempt".to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit::CircuitConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter_factor: 0.0,
        };
        assert_eq!(policy.delay_before_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_before_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before_attempt(4), Duration::from_millis(400));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 250,
            jitter_factor: 0.0,
        };
        assert_eq!(policy.delay_before_attempt(4), Duration::from_millis(250));
        assert_eq!(policy.delay_before_attempt(9), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.5,
        };
        for _ in 0..50 {
            let d = policy.delay_before_attempt(2).as_millis() as u64;
            assert!((500..=1500).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let breaker = CircuitBreaker::with_defaults();
        let calls = AtomicU32::new(0);

        let result = with_retry(&quick_policy(3), &breaker, "test:op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(GatewayError::transport("connection reset"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let breaker = CircuitBreaker::with_defaults();
        let calls = AtomicU32::new(0);

        let result: GatewayResult<()> = with_retry(&quick_policy(3), &breaker, "test:op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::provider_call(400, "invalid_request", "bad")) }
        })
        .await;

        assert!(matches!(result, Err(GatewayError::ProviderCall { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let breaker = CircuitBreaker::with_defaults();
        let calls = AtomicU32::new(0);

        let result: GatewayResult<()> = with_retry(&quick_policy(3), &breaker, "test:op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::provider_call(503, "overloaded", "busy")) }
        })
        .await;

        assert!(matches!(result, Err(GatewayError::ProviderCall { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.failure_count(), 3);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_calling() {
        let breaker = CircuitBreaker::new(CircuitConfig {
            failure_threshold: 1,
            reset_timeout_ms: 60_000,
            half_open_max: 1,
        });
        breaker.record_failure();
        assert!(breaker.is_open());

        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = with_retry(&quick_policy(3), &breaker, "test:op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        match result {
            Err(GatewayError::CircuitOpen { key, retry_after_ms }) => {
                assert_eq!(key, "test:op");
                assert!(retry_after_ms > 0);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn denied_half_open_caller_gets_reset_timeout_hint() {
        let breaker = CircuitBreaker::new(CircuitConfig {
            failure_threshold: 1,
            reset_timeout_ms: 25,
            half_open_max: 1,
        });
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(35)).await;
        // Another caller holds the probe slot.
        assert!(breaker.can_execute());

        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = with_retry(&quick_policy(3), &breaker, "test:op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        match result {
            Err(GatewayError::CircuitOpen { retry_after_ms, .. }) => {
                assert_eq!(retry_after_ms, 25);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
