// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

/// Retry utilities with exponential backoff.
///
/// The same delay schedule drives short in-cycle retries of status writes
/// and the scheduler's requeue of failed reconciliation cycles.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Error;

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,)]
#[serde(default)]
pub struct RetryConfig
{
    /// Maximum number of attempts of an in-cycle retry (default: 3).
    pub max_attempts:     u32,
    /// Delay after the first failure in milliseconds (default: 1000).
    pub initial_delay_ms: u64,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_factor:   f64,
    /// Upper bound of any single delay in milliseconds (default: 300000).
    pub max_delay_ms:     u64,
}

impl Default for RetryConfig
{
    fn default() -> Self
    {
        Self {
            max_attempts: 3, initial_delay_ms: 1000, backoff_factor: 2.0, max_delay_ms: 300_000,
        }
    }
}

impl RetryConfig
{
    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay_for(&self, failures: u32,) -> Duration
    {
        let exponent = failures.saturating_sub(1,).min(64,) as i32;
        let scaled = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent,);
        let capped = if scaled.is_finite() { scaled.min(self.max_delay_ms as f64,) } else { self.max_delay_ms as f64 };
        Duration::from_millis(capped.max(0.0,) as u64,)
    }
}

/// Executes an async operation with exponential backoff retry logic.
///
/// Only errors accepted by `should_retry` are retried; any other error is
/// returned immediately.
///
/// # Arguments
///
/// * `config` - Retry configuration (max attempts, delays)
/// * `operation_name` - Name of the operation for logging
/// * `should_retry` - Predicate selecting retryable errors
/// * `f` - Async function to retry
///
/// # Errors
///
/// Returns the last error encountered if all retry attempts fail.
pub async fn retry_with_backoff<F, Fut, T,>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: fn(&Error,) -> bool,
    mut f: F,
) -> Result<T, Error,>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error,>,>,
{
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(result,) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result,);
            }
            Err(error,) => {
                if !should_retry(&error,) {
                    return Err(error,);
                }
                if attempt >= config.max_attempts {
                    warn!(
                        "{} failed after {} attempts: {}",
                        operation_name, config.max_attempts, error
                    );
                    return Err(error,);
                }

                let delay = config.delay_for(attempt,);
                warn!(
                    "{} failed on attempt {}/{}: {}. Retrying in {}ms...",
                    operation_name,
                    attempt,
                    config.max_attempts,
                    error,
                    delay.as_millis()
                );

                sleep(delay,).await;
                attempt += 1;
            }
        }
    }
}
