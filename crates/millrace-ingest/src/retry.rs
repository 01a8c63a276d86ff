//! Bounded retry with exponential backoff.
//!
//! Shared by the schema provisioner and the idempotent sink: transient
//! store failures are retried with exponentially growing, jittered delays
//! up to a bounded attempt count; everything else fails immediately.

use crate::store::StoreError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry behavior for store operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt.
    pub backoff_base: Duration,

    /// Ceiling on the backoff delay.
    pub backoff_cap: Duration,

    /// Upper bound on the per-operation timeout.
    pub op_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
            op_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a retried operation that ran out of attempts.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// The last attempt failed with a transient error and the attempt
    /// budget is spent.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: StoreError },

    /// A non-retryable error surfaced.
    #[error(transparent)]
    Fatal(StoreError),
}

/// Run `op` until it succeeds, retrying transient failures.
///
/// Each attempt is bounded by `config.op_timeout`; an elapsed timeout
/// counts as a transient failure.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = config.backoff_base;

    for attempt in 1..=config.max_attempts {
        let result = match tokio::time::timeout(config.op_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Transient(format!(
                "{what} timed out after {:?}",
                config.op_timeout
            ))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt == config.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                let delay = backoff.min(config.backoff_cap) + jitter();
                tracing::warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "{what} failed transiently: {e}; retrying"
                );
                tokio::time::sleep(delay).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => return Err(RetryError::Fatal(e)),
        }
    }

    unreachable!("loop returns on the final attempt")
}

/// Random jitter for backoff (0-50ms).
fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..50))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
            op_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result = retry_transient(&fast_config(3), "op", || async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_transient(&fast_config(5), "op", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("throttled".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = retry_transient(&fast_config(3), "op", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Transient("still down".to_string()))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = retry_transient(&fast_config(5), "op", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Fatal("corrupt".to_string()))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RetryError::Fatal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
