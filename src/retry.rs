//! Bounded exponential backoff with jitter for cluster API calls.
//!
//! The resource reconciler wraps its whole fetch-merge-write cycle in
//! [`retry_with_backoff_if`] so that a conflict re-reads the live object
//! instead of resending a stale write.
//!
//! # Example
//!
//! ```ignore
//! use flowmesh::retry::{retry_with_backoff_if, RetryConfig};
//!
//! let applied = retry_with_backoff_if(
//!     &RetryConfig::conflict(),
//!     "apply Service flowmesh/processor",
//!     || async { reconciler.apply_once(&desired).await },
//!     |e: &Error| e.is_retryable(),
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff parameters for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Short curve used for optimistic-concurrency conflicts on one resource.
    ///
    /// Five attempts spaced 50ms, 100ms, 200ms, 400ms (before jitter), capped
    /// at 2s when the attempt count is raised.
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }

    /// Same curve with a different attempt bound
    pub fn conflict_with_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Self::conflict()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Execute an async operation with exponential backoff, retrying every error.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, operation, |_| true).await
}

/// Execute an async operation with exponential backoff, retrying only the
/// errors accepted by `should_retry`.
///
/// Rejected errors are returned immediately. Once `max_attempts` is reached
/// the last error is returned as-is; callers decide how to wrap it.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            debug!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed with non-retryable error"
            );
            return Err(e);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            warn!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(e);
        }

        // 0.5x to 1.5x so concurrent passes don't retry in lockstep
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        debug!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = jittered_delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::time::sleep(jittered_delay).await;
        delay = config.next_delay(delay);
    }
}
