//! Backoff for agent calls and agent acquisition
//!
//! Agent backends fail transiently (rate limits, timeouts, network blips).
//! Those errors are retried with exponential backoff; anything else is
//! surfaced immediately.

use crate::config::ExecutionConfig;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Patterns that indicate a retryable error
/// Matched against the lowercased error text
pub const RETRYABLE_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "timeout",
    "timed out",
    "network",
    "connection",
    "econnreset",
    "etimedout",
    "overloaded",
    "temporarily unavailable",
    "service unavailable",
    "503",
    "502",
    "500",
];

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&ExecutionConfig> for RetryConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_retries.saturating_add(1),
            initial_delay_ms: config.initial_backoff_ms,
            max_delay_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub result: Result<T, E>,
    /// Number of attempts made
    pub attempts: u32,
    /// Total time spent waiting between attempts
    pub total_retry_time_ms: u64,
}

/// Check if an error message indicates a retryable condition
pub fn is_retryable_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Delay before the given retry (1-based), capped at the configured maximum
pub fn backoff_delay_ms(config: &RetryConfig, retry: u32) -> u64 {
    let factor = config.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
    ((config.initial_delay_ms as f64 * factor) as u64).min(config.max_delay_ms)
}

/// Execute an async operation with retry logic.
///
/// `operation` receives the 1-based attempt number. `should_retry` decides
/// whether an error is transient; non-transient errors end the loop at once.
pub async fn with_retry<F, Fut, T, E, P>(
    mut operation: F,
    config: &RetryConfig,
    should_retry: P,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut attempts = 0u32;
    let mut total_retry_time_ms = 0u64;

    loop {
        attempts += 1;
        match operation(attempts).await {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts,
                    total_retry_time_ms,
                };
            }
            Err(error) => {
                if attempts >= config.max_attempts || !should_retry(&error) {
                    return RetryResult {
                        result: Err(error),
                        attempts,
                        total_retry_time_ms,
                    };
                }

                let delay_ms = backoff_delay_ms(config, attempts);
                log::warn!(
                    "[Executor] Retryable error on attempt {}/{}: {}. Retrying in {}ms...",
                    attempts,
                    config.max_attempts,
                    error,
                    delay_ms
                );

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                total_retry_time_ms += delay_ms;
            }
        }
    }
}
