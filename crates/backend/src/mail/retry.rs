// Retry with exponential backoff for provider operations
//
// - Only transient provider errors are retried
// - Delay before retry n is base_delay * 2^(n-1)
// - Exhausting all attempts returns the last error unchanged

use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::error::ProviderError;

/// Configuration for retried provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
  /// Total attempts, including the first
  pub max_attempts: u32,
  /// Delay before the first retry
  pub base_delay: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(800),
    }
  }
}

impl RetryConfig {
  /// Delay after the given failed attempt (1-based)
  pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    self.base_delay.saturating_mul(1 << exponent)
  }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// The closure receives the 1-based attempt number.
pub async fn retry_transient<T, F, Fut>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T, ProviderError>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, ProviderError>>,
{
  let max_attempts = config.max_attempts.max(1);
  let mut attempt = 1;

  loop {
    match operation(attempt).await {
      Ok(value) => {
        if attempt > 1 {
          info!(operation = label, attempt, "Succeeded after retry");
        }
        return Ok(value);
      }
      Err(e) if e.is_transient() && attempt < max_attempts => {
        let backoff = config.backoff_for_attempt(attempt);
        debug!(
          operation = label,
          attempt,
          max_attempts,
          backoff_ms = backoff.as_millis(),
          err = %e,
          "Transient error, retrying after backoff"
        );
        sleep(backoff).await;
        attempt += 1;
      }
      Err(e) => {
        if e.is_transient() {
          warn!(operation = label, attempts = attempt, err = %e, "All retries exhausted");
        }
        return Err(e);
      }
    }
  }
}
