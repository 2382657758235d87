//! Jittered exponential backoff for LLM calls (spec.md §5 "Timeouts & retries").
//!
//! Deliberately narrow: only LLM calls are retried here. Parse failures are
//! never retried — see [`crate::llm::parse_structured`] — so this helper
//! never sees them; it only wraps the network/provider round trip itself.

use std::time::Duration;

use rand::Rng;

use crate::error::{PowerMemError, Result};

/// Retries `f` up to `max_attempts` times (attempts, not retries) with
/// jittered exponential backoff starting at `base_delay`, doubling each
/// attempt and adding up to 50% jitter. Only retries [`PowerMemError::BackendUnavailable`];
/// every other error kind is returned immediately.
pub async fn with_backoff<F, Fut, T>(max_attempts: u32, base_delay: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(PowerMemError::BackendUnavailable(msg)) if attempt < max_attempts => {
                let backoff = base_delay * 2u32.pow(attempt - 1);
                let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.5);
                let jittered = backoff + Duration::from_secs_f64(backoff.as_secs_f64() * jitter_frac);
                tracing::warn!(attempt, error = %msg, delay_ms = jittered.as_millis(), "llm call failed, retrying");
                tokio::time::sleep(jittered).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_call_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_backoff(3, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_backend_unavailable_up_to_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_backoff(3, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PowerMemError::BackendUnavailable("down".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_validation_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_backoff(3, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PowerMemError::Validation("bad input".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
