//! Retry policy for backend calls
//!
//! "Automatic retry, zero delay": the first failure is reissued immediately once, a
//! second failure goes to the caller's fallback.

use crate::infra::metrics::Metrics;
use std::fmt::Display;
use std::future::Future;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// One immediate retry after the first failure
    pub const IMMEDIATE_ONCE: Self = Self { max_attempts: 2 };

    /// Run `call` until it succeeds or the attempts are used up
    pub async fn run<T, E, F, Fut>(&self, operation: &str, metrics: &Metrics, mut call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    warn!(operation = %operation, attempt = attempt, error = %e, "backend_retrying");
                    metrics.record_backend_retry();
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_success_first_try() {
        let metrics = Metrics::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, String> = RetryPolicy::IMMEDIATE_ONCE
            .run("op", &metrics, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.backend_retries_total(), 0);
    }

    #[tokio::test]
    async fn test_retries_once_then_succeeds() {
        let metrics = Metrics::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, String> = RetryPolicy::IMMEDIATE_ONCE
            .run("op", &metrics, || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("connection reset".to_string())
                } else {
                    Ok(1)
                }
            })
            .await;
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.backend_retries_total(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_second_failure() {
        let metrics = Metrics::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = RetryPolicy::IMMEDIATE_ONCE
            .run("op", &metrics, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("503".to_string())
            })
            .await;
        assert_eq!(result, Err("503".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
