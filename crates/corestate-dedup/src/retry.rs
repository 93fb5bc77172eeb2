//! Bounded retry with exponential backoff for backend calls.
//!
//! Each attempt runs under a timeout; an elapsed timeout is a transient
//! failure like any other and goes through the same backoff schedule.
//! Destructive calls use [`RetryExecutor::execute_to_completion`] instead:
//! abandoning one of those does not stop the backend, which may still apply
//! it after the caller has given up.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first (default: 3).
    pub max_retries: u32,
    /// Initial backoff in milliseconds (default: 50).
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds (default: 2000).
    pub max_backoff_ms: u64,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// A permanent error, or the retry budget ran out.
    Failed {
        /// The last error that occurred.
        last_error: StoreError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

/// Executor for retried backend calls.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    timeout: Duration,
}

impl RetryExecutor {
    /// Create an executor; `timeout` bounds each individual attempt.
    pub fn new(config: RetryConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    /// Execute an operation with retry logic.
    ///
    /// Only transient errors (see [`StoreError::is_transient`]) are retried;
    /// permanent errors fail immediately.
    pub async fn execute<F, Fut, T>(&self, op_name: &'static str, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.run(op_name, Some(self.timeout), operation).await
    }

    /// Like [`execute`](Self::execute), but every attempt is awaited until the
    /// backend answers. Errors are still retried; time is not bounded.
    pub async fn execute_to_completion<F, Fut, T>(
        &self,
        op_name: &'static str,
        operation: F,
    ) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.run(op_name, None, operation).await
    }

    async fn run<F, Fut, T>(
        &self,
        op_name: &'static str,
        timeout: Option<Duration>,
        operation: F,
    ) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(r) => r,
                    Err(_) => Err(StoreError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => operation().await,
            };

            match result {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    if !e.is_transient() || attempt > self.config.max_retries {
                        return RetryOutcome::Failed {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    debug!(op = op_name, attempt, ?backoff, error = %e, "retrying backend call");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Compute the exponential backoff duration for a given attempt.
    ///
    /// `initial_backoff * backoff_multiplier^attempt`, capped at `max_backoff`,
    /// plus up to 50% jitter when enabled.
    pub(crate) fn compute_backoff(&self, attempt: u32) -> Duration {
        backoff_for(&self.config, attempt)
    }
}

pub(crate) fn backoff_for(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff_ms as f64;
    let computed = base * config.backoff_multiplier.powi(attempt as i32);
    let capped = computed.min(config.max_backoff_ms as f64) as u64;

    if config.jitter && capped > 1 {
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        Duration::from_millis(capped.saturating_add(jitter))
    } else {
        Duration::from_millis(capped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff_ms, 50);
        assert_eq!(config.max_backoff_ms, 2_000);
        assert!(config.jitter);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let executor = RetryExecutor::new(fast_config(), Duration::from_secs(1));
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute("put", move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if count < 3 {
                        Err(StoreError::Unavailable("flaky".into()))
                    } else {
                        Ok("stored")
                    }
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success("stored")));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let executor = RetryExecutor::new(fast_config(), Duration::from_secs(1));
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome: RetryOutcome<()> = executor
            .execute("put", move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(StoreError::Unavailable("down".into()))
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Failed {
                last_error: StoreError::Unavailable(_),
                attempts: 4
            }
        ));
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let executor = RetryExecutor::new(fast_config(), Duration::from_secs(1));
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome: RetryOutcome<()> = executor
            .execute("get", move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(StoreError::Corrupted {
                        reason: "bad record".into(),
                    })
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 1, .. }));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let executor = RetryExecutor::new(
            RetryConfig {
                max_retries: 1,
                ..fast_config()
            },
            Duration::from_millis(10),
        );
        let outcome: RetryOutcome<()> = executor
            .execute("put", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Failed {
                last_error: StoreError::Timeout { timeout_ms: 10 },
                attempts: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_run_to_completion_outlasts_timeout() {
        let executor = RetryExecutor::new(fast_config(), Duration::from_millis(10));
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute_to_completion("rewrite", move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(7u32)
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success(7)));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_compute_backoff() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff_for(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff_for(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff_for(&config, 3), Duration::from_millis(800));
        assert_eq!(backoff_for(&config, 4), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let config = RetryConfig {
            initial_backoff_ms: 100,
            jitter: true,
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let d = backoff_for(&config, 0);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }
}
