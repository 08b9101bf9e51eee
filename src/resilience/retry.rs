// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry for background work.
//!
//! The replication worker and segment replay both go through [`retry`].
//! The primary path does not: its attempts are interleaved with exclusion
//! bookkeeping and cancellation, so the execution engine runs its own loop.
//!
//! # Example
//!
//! ```
//! use replica_router::resilience::retry::RetryConfig;
//! use std::time::Duration;
//!
//! let fixed = RetryConfig::fixed(3, Duration::from_millis(100));
//! assert_eq!(fixed.max_attempts, 3);
//! assert_eq!(fixed.factor, 1.0);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ReplicationConfig;

/// How often and how patiently to retry.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failure. 1.0 keeps it fixed.
    pub factor: f64,
    /// Total attempts, first one included. Zero is treated as one.
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::replication(&ReplicationConfig::default())
    }
}

impl RetryConfig {
    /// Fixed delay between a bounded number of attempts.
    #[must_use]
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            factor: 1.0,
            max_attempts,
        }
    }

    /// Policy for applying jobs to the secondary target, live or on replay.
    #[must_use]
    pub fn replication(config: &ReplicationConfig) -> Self {
        Self::fixed(config.retry_times, Duration::from_millis(config.retry_delay_ms))
    }

    /// Exponential backoff, capped.
    #[must_use]
    pub fn backoff(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor: 2.0,
            max_attempts,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self::backoff(3, Duration::from_millis(1), Duration::from_millis(10))
    }

    fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = config.attempts();
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    debug!(operation = operation_name, retries = attempts, "Succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if attempts >= max {
                    return Err(err);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max_attempts = max,
                    error = %err,
                    next_delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
