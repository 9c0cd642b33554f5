//! Retry with exponential backoff for provider-specific transient errors
//!
//! The orchestrator never retries on its own. Lifecycle functions that talk
//! to flaky backends can wrap individual calls with [`with_retry`].

use std::future::Future;
use std::time::Duration;

/// Backoff settings
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given zero-based attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        self.base_delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Callback trait for retry notifications
pub trait RetryCallback: Send + Sync {
    /// Called before sleeping ahead of the next attempt
    ///
    /// `attempt` is the 1-indexed attempt that just failed.
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &anyhow::Error, delay: Duration);
}

/// Callback that logs retries at warn level
pub struct LogCallback;

impl RetryCallback for LogCallback {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &anyhow::Error, delay: Duration) {
        log::warn!(
            "Attempt {attempt}/{max_attempts} failed: {error:#}. Retrying in {}ms...",
            delay.as_millis()
        );
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts
///
/// `should_retry` decides which errors are transient. The last error is
/// returned unchanged.
pub async fn with_retry<T, F, Fut, P>(
    config: &RetryConfig,
    callback: Option<&dyn RetryCallback>,
    should_retry: P,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    P: Fn(&anyhow::Error) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !should_retry(&err) || attempt + 1 >= max_attempts {
                    return Err(err);
                }
                let delay = config.delay_for_attempt(attempt);
                if let Some(cb) = callback {
                    cb.on_retry(attempt + 1, max_attempts, &err, delay);
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
