// ABOUTME: Bounded exponential backoff for transport calls that hit rate limits or transient failures.
// ABOUTME: Honors the platform's retry_after hint and gives up after a fixed number of attempts.

use std::future::Future;
use std::time::Duration;

use crate::transport::TransportError;

/// How transport calls are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// The last error seen and how many attempts were made before giving up.
#[derive(Debug, Clone)]
pub struct Exhausted {
    pub error: TransportError,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// raised to the platform hint and capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        backoff.max(hint.unwrap_or_default()).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let hint = match &error {
                        TransportError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = self.delay_for(attempt, hint);
                    tracing::debug!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label,
                        attempt,
                        max_attempts,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(Exhausted {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(400));
        assert_eq!(policy.delay_for(8, None), Duration::from_secs(1));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(700))),
            Duration::from_millis(700)
        );
    }

    #[tokio::test]
    async fn retries_rate_limits_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("send", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::RateLimited {
                        retry_after: Some(Duration::from_millis(1)),
                    })
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("edit", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Unavailable("502".to_string()))
            })
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::NotFound)
            })
            .await;

        assert_eq!(result.unwrap_err().error, TransportError::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
