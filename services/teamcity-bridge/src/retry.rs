//! Capped exponential backoff for TeamCity API calls.
//!
//! Only transient failures (see [`BridgeError::is_transient`]) are retried;
//! everything else is returned from the first attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BridgeError;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap for a single wait
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-indexed):
    /// `initial_delay * multiplier^retry`, capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(retry as i32);
        let delay_ms = (self.initial_delay_ms as f64 * multiplier).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// Exhausting the attempts on a transient failure yields
/// [`BridgeError::Unavailable`] carrying the last failure message.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                tracing::debug!("{} failed after {} attempts: {}", what, attempt, e);
                return Err(match e {
                    BridgeError::Unavailable(msg) => BridgeError::Unavailable(msg),
                    other => BridgeError::Unavailable(other.to_string()),
                });
            }
            Err(e) => {
                let delay = config.delay_for_retry(attempt - 1);
                tracing::debug!(
                    "{} attempt {}/{} failed: {}; retrying in {:?}",
                    what,
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
