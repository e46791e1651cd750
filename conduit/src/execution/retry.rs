use std::time::Duration;

use conduit_config::shared::ExecutionConfig;
use futures::Future;
use metrics::counter;
use tracing::warn;

use crate::error::{ConduitError, ConduitResult, ErrorKind};
use crate::metrics::{CONDUIT_RETRIES_TOTAL, ERROR_KIND_LABEL};

/// Delay before retry number `attempt`, counting from 1: `initial * 2^(attempt - 1)`, capped at
/// `max`.
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    initial
        .checked_mul(1u32 << exponent)
        .unwrap_or(max)
        .min(max)
}

/// Whether a failed operation may be repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    Retry,
    NoRetry,
}

impl RetryDirective {
    /// Returns whether `error` may be retried.
    pub fn for_error(error: &ConduitError) -> Self {
        let never = error.kinds().iter().any(|kind| {
            matches!(
                kind,
                ErrorKind::ValidationFailed
                    | ErrorKind::PermissionDenied
                    | ErrorKind::ConstraintViolated
                    | ErrorKind::QueryInvalid
                    | ErrorKind::Unsupported
                    | ErrorKind::Cancelled
                    | ErrorKind::Timeout
                    | ErrorKind::ConfigInvalid
            )
        });

        if !never && error.is_transient() {
            RetryDirective::Retry
        } else {
            RetryDirective::NoRetry
        }
    }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a new policy from the retry settings of `config`.
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            initial_delay: config.retry_delay(),
            max_delay: config.max_retry_delay(),
        }
    }

    /// Creates a policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails with a non retryable error, or `attempts` retries were
    /// made. `on_retry` is called before every retry with the attempt number and the error.
    pub async fn run<T, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> ConduitResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConduitResult<T>>,
        R: FnMut(u32, &ConduitError),
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.attempts || RetryDirective::for_error(&err) == RetryDirective::NoRetry {
                        return Err(err);
                    }

                    attempt += 1;
                    let delay = backoff_delay(self.initial_delay, self.max_delay, attempt);
                    warn!(attempt, max_attempts = self.attempts, ?delay, error = %err, "retrying after transient failure");
                    counter!(CONDUIT_RETRIES_TOTAL, ERROR_KIND_LABEL => format!("{:?}", err.kind()))
                        .increment(1);
                    on_retry(attempt, &err);

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::conduit_error;

    #[test]
    fn delays_double_up_to_the_cap() {
        let initial = Duration::from_millis(10);
        let max = Duration::from_millis(50);

        assert_eq!(backoff_delay(initial, max, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(initial, max, 2), Duration::from_millis(20));
        assert_eq!(backoff_delay(initial, max, 3), Duration::from_millis(40));
        assert_eq!(backoff_delay(initial, max, 4), max);
        assert_eq!(backoff_delay(initial, max, 200), max);
    }

    #[test]
    fn validation_and_permission_errors_are_never_retried() {
        for kind in [ErrorKind::ValidationFailed, ErrorKind::PermissionDenied, ErrorKind::QueryInvalid] {
            assert_eq!(
                RetryDirective::for_error(&conduit_error!(kind, "failed")),
                RetryDirective::NoRetry
            );
        }
        assert_eq!(
            RetryDirective::for_error(&conduit_error!(ErrorKind::Transient, "failed")),
            RetryDirective::Retry
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let mut retries = vec![];
        let policy = RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        };

        let value = policy
            .run(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(conduit_error!(ErrorKind::Transient, "flaky"))
                    } else {
                        Ok(7)
                    }
                },
                |attempt, _| retries.push(attempt),
            )
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_configured_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };

        let err = policy
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(conduit_error!(ErrorKind::Transient, "down"))
                },
                |_, _| {},
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
