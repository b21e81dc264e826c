//! Exponential backoff for transient fetch failures.

use crate::config::PipelineConfig;
use rand::Rng;
use std::time::Duration;

/// Retry budget and backoff bounds for the Producer's fetch calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt.
  pub max_retries: u32,
  /// Delay before the first retry.
  pub base_delay: Duration,
  /// Ceiling for any single delay, before jitter.
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(100),
      max_delay: Duration::from_secs(5),
    }
  }
}

impl RetryPolicy {
  /// Creates a policy with the given bounds.
  pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay,
      max_delay,
    }
  }

  /// Reads the retry settings of a pipeline configuration.
  pub fn from_config(config: &PipelineConfig) -> Self {
    Self::new(
      config.max_retries,
      config.retry_base_delay,
      config.retry_max_delay.max(config.retry_base_delay),
    )
  }

  /// True while another retry is allowed after `retries_so_far` retries.
  pub fn should_retry(&self, retries_so_far: u32) -> bool {
    retries_so_far < self.max_retries
  }

  /// Backoff before retry number `attempt` (1-based), without jitter.
  pub fn base_backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    self
      .base_delay
      .saturating_mul(1u32 << exponent)
      .min(self.max_delay)
  }

  /// Backoff before retry number `attempt` with up to 10% random jitter.
  pub fn delay(&self, attempt: u32) -> Duration {
    let base = self.base_backoff(attempt);
    let jitter_ms = (base.as_millis() / 10) as u64;
    if jitter_ms == 0 {
      return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
  }
}
