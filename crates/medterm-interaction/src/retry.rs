//! Bounded retry with exponential backoff for LLM calls.
//!
//! Retries are sequential and not cancellable mid-wait; a server-provided
//! retry-after overrides the computed delay for that attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::agent::AgentError;

/// Retry knobs: attempt cap and the starting delay of the doubling schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
        }
    }
}

/// Runs `operation`, retrying retryable failures up to the policy's cap.
///
/// Non-retryable errors surface immediately; exhaustion surfaces the last
/// error.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let wait = err.retry_after().unwrap_or(delay);
                attempt += 1;
                warn!(
                    "Retryable LLM error (attempt {attempt}/{}), waiting {:?}: {err}",
                    policy.max_retries, wait
                );
                tokio::time::sleep(wait).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limited() -> AgentError {
        AgentError::Process {
            status_code: Some(429),
            message: "rate limited".into(),
            is_retryable: true,
            retry_after: None,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(rate_limited())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast_policy(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(rate_limited()) }
        })
        .await;

        assert!(result.is_err());
        // Initial attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast_policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AgentError::ExecutionFailed("bad request".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_after_is_honored() {
        let calls = AtomicU32::new(0);
        let start = std::time::Instant::now();
        let result = retry_with_backoff(&fast_policy(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AgentError::process_error_with_retry_after(
                        429,
                        "slow down",
                        true,
                        Duration::from_millis(20),
                    ))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
