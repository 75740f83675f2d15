//! Retry Engine (C5).
//!
//! Wraps an idempotent async operation with exponential backoff on
//! transient transport failures. Classification lives on the error type
//! (`classify_reqwest_error`), never on a string match against the
//! message.

use std::future::Future;
use std::time::Duration;

use crate::error::NetworkError;

/// Default retry policy: 4 retries (5 attempts total), base 2.0 ->
/// waits 2, 4, 8, 16 seconds between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 4, base: 2.0 }
    }
}

/// Outcome of a single attempt: either the happy path, or an error that
/// may (`Transient`) or may not (`Permanent`) be retried.
pub enum Attempt<T> {
    Ok(T),
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

/// Retry `operation` up to `policy.max_retries + 1` times. `operation`
/// classifies its own failures by returning [`Attempt::Transient`] or
/// [`Attempt::Permanent`]. On a permanent failure, returns immediately.
/// On exhaustion, returns [`NetworkError::RetryExhausted`] with the last
/// error attached.
pub async fn retry<T, F, Fut>(
    operation_name: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, NetworkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut last_error: Option<anyhow::Error> = None;
    for attempt in 0..=policy.max_retries {
        match operation().await {
            Attempt::Ok(value) => return Ok(value),
            Attempt::Permanent(e) => return Err(permanent_as_exhausted(operation_name, e)),
            Attempt::Transient(e) => {
                last_error = Some(e);
                if attempt < policy.max_retries {
                    let wait = policy.base.powi(attempt as i32 + 1);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }
    }
    Err(NetworkError::RetryExhausted {
        operation: operation_name.to_string(),
        attempts: policy.max_retries + 1,
        last_error: last_error.unwrap_or_else(|| anyhow::anyhow!("no attempts were made")),
    })
}

/// A permanent (non-transient) failure is surfaced as a one-attempt
/// `RetryExhausted` so callers see a single error type out of `retry()`
/// while the message still makes clear no retries occurred.
fn permanent_as_exhausted(operation_name: &str, last_error: anyhow::Error) -> NetworkError {
    NetworkError::RetryExhausted {
        operation: operation_name.to_string(),
        attempts: 1,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_second_attempt_after_one_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = retry("test-op", RetryPolicy { max_retries: 4, base: 0.001 }, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Attempt::Transient(anyhow::anyhow!("connection reset"))
                } else {
                    Attempt::Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries_and_preserves_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            "test-op",
            RetryPolicy { max_retries: 4, base: 0.001 },
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Transient(anyhow::anyhow!("boom")) }
            },
        )
        .await;
        match result {
            Err(NetworkError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 5),
            _ => panic!("expected RetryExhausted"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            "test-op",
            RetryPolicy { max_retries: 4, base: 0.001 },
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Permanent(anyhow::anyhow!("bad request")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
