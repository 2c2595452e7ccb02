// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff for connection setup.
//!
//! Row processing is never retried here: a failed re-query aborts its row and
//! a failed commit is handed back to the event loop, which re-delivers.
//!
//! # Example
//!
//! ```
//! use index_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on a bad URL
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//! assert_eq!(startup.initial_delay, Duration::from_millis(200));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first.
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// 5 attempts, giving up after roughly 5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Minimal delays for tests
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Retry errors `transient` accepts until `config.max_attempts` is reached;
/// anything else is returned at once.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) if attempt >= config.max_attempts.max(1) => return Err(err),
            Err(err) if !transient(&err) => {
                warn!(operation = operation_name, attempt, error = %err, "Operation failed, not retryable");
                return Err(err);
            }
            Err(err) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %err,
                    ?delay,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
