//! Retry combinator with exponential backoff
//!
//! Applied explicitly at network call sites; the predicate decides which
//! error classes are worth another attempt.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `op` up to `max_attempts` times, sleeping
/// `backoff_factor * 2^attempt` seconds between attempts.
///
/// Only errors accepted by `retryable` trigger another attempt; the last
/// error is returned when attempts run out.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    max_attempts: u32,
    backoff_factor: f64,
    retryable: P,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= attempts || !retryable(&err) {
                    return Err(err);
                }
                let wait = backoff_factor * f64::from(1u32 << (attempt - 1));
                warn!(
                    "attempt {}/{} failed: {}. Retrying in {:.2}s",
                    attempt, attempts, err, wait
                );
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(3, 0.0, |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(3, 0.0, |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("permanent".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(2, 0.0, |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("transient".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
