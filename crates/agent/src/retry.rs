use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use cartwheel_core::config::RetryConfig;

/// Deterministic exponential backoff policy. No jitter is applied, so
/// concurrent retries against a shared backend align their delays
/// (thundering-herd risk accepted for a single-instance deployment).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial call; a value of 3 allows four calls total.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: u32,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2,
            retryable_statuses: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Delay before retry number `retry` (zero-based): initial × factor^retry,
    /// capped at `max_delay`. Delays are therefore non-decreasing.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(retry);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Classifies an error as worth retrying under a given policy.
pub trait RetryClass {
    fn retryable(&self, policy: &RetryPolicy) -> bool;
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All attempts failed with retryable errors; carries the last cause.
    #[error("operation `{operation}` failed after {attempts} attempts")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },
    /// A non-retryable failure, propagated immediately.
    #[error(transparent)]
    Fatal(E),
}

/// Runs `call` until it succeeds, fails non-retryably, or exhausts the policy.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, RetryError<E>>
where
    E: RetryClass + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut failures = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.retryable(policy) => return Err(RetryError::Fatal(error)),
            Err(error) => {
                failures += 1;
                if failures > policy.max_retries {
                    return Err(RetryError::Exhausted {
                        operation: operation.to_owned(),
                        attempts: failures,
                        source: error,
                    });
                }
                let delay = policy.delay_for(failures - 1);
                warn!(
                    event_name = "retry.attempt",
                    operation,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use thiserror::Error;

    use super::{run_with_retry, RetryClass, RetryError, RetryPolicy};

    #[derive(Debug, Error, PartialEq, Eq)]
    enum FakeError {
        #[error("transient")]
        Transient,
        #[error("permanent")]
        Permanent,
    }

    impl RetryClass for FakeError {
        fn retryable(&self, _policy: &RetryPolicy) -> bool {
            matches!(self, Self::Transient)
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            ..RetryPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&fast_policy(), "op", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(FakeError::Transient)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.ok(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_the_last_cause() {
        let result: Result<(), _> =
            run_with_retry(&fast_policy(), "op", || async { Err(FakeError::Transient) }).await;

        match result {
            Err(RetryError::Exhausted { attempts, source, .. }) => {
                assert_eq!(attempts, 4);
                assert_eq!(source, FakeError::Transient);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retry(&fast_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakeError::Permanent) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal(FakeError::Permanent))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2,
            ..RetryPolicy::default()
        };

        let delays: Vec<_> = (0..4).map(|retry| policy.delay_for(retry)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
            ]
        );
        for window in delays.windows(2) {
            assert!(window[0] <= window[1], "delays must be non-decreasing");
        }
    }

    #[test]
    fn retryable_status_set_matches_policy() {
        let policy = RetryPolicy::default();
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(policy.is_retryable_status(status));
        }
        assert!(!policy.is_retryable_status(404));
        assert!(!policy.is_retryable_status(401));
    }
}
