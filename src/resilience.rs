//! Retry with exponential backoff.
//!
//! Used when the tail worker reopens its source connection after a
//! recoverable change-feed error, and by the control store's busy-retry.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> index_replicator::Result<()> {
//! use index_replicator::resilience::{retry_with_backoff, RetryConfig};
//!
//! let _value = retry_with_backoff(&RetryConfig::reconnect(), "open source", || async {
//!     Ok::<_, index_replicator::ReplicationError>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Reopening a source connection after a change-feed hiccup.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        (immediate)
    /// 2        500ms
    /// 3        1s
    /// 4        2s
    /// 5        4s
    /// 6+       8s, 16s, 30s (cap) ... up to 12 attempts
    /// ```
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 12,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }

    /// SQLite busy/locked contention.
    pub fn busy() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(160),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given retry number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}

/// Run `op` until it succeeds or `config.max_attempts` is reached.
///
/// Returns the last error when every attempt fails.
pub async fn retry_with_backoff<T, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
