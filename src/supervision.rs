//! Bounded restart budget for pipeline failures.
//!
//! Pipelines are never restarted implicitly. Instead the Coordinator owns a
//! [`FailureBudget`]: every pipeline that ends in `failed` records a failure,
//! and once more than `max_failures` failures fall inside the sliding `window`,
//! `start` refuses new pipelines with
//! [`PipelineError::RestartBudgetExhausted`] until old failures age out.

use crate::error::PipelineError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How many failures are tolerated within a sliding window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupervisionPolicy {
  /// Failures tolerated inside `window`.
  pub max_failures: usize,
  /// Sliding window length.
  pub window: Duration,
}

impl SupervisionPolicy {
  /// Creates a policy.
  pub fn new(max_failures: usize, window: Duration) -> Self {
    Self {
      max_failures,
      window,
    }
  }

  /// Sets the failure bound.
  pub fn with_max_failures(mut self, n: usize) -> Self {
    self.max_failures = n;
    self
  }

  /// Sets the window.
  pub fn with_window(mut self, d: Duration) -> Self {
    self.window = d;
    self
  }
}

impl Default for SupervisionPolicy {
  fn default() -> Self {
    Self {
      max_failures: 5,
      window: Duration::from_secs(60),
    }
  }
}

/// Sliding-window failure counter shared by the Coordinator and its watchdogs.
#[derive(Debug)]
pub struct FailureBudget {
  policy: SupervisionPolicy,
  failures: Mutex<VecDeque<Instant>>,
}

impl FailureBudget {
  /// Creates an empty budget.
  pub fn new(policy: SupervisionPolicy) -> Self {
    Self {
      policy,
      failures: Mutex::new(VecDeque::new()),
    }
  }

  /// The policy in force.
  pub fn policy(&self) -> SupervisionPolicy {
    self.policy
  }

  /// Records one failure at `now`.
  pub fn record_failure(&self, now: Instant) {
    if let Ok(mut failures) = self.failures.lock() {
      failures.push_back(now);
      Self::evict(&mut failures, now, self.policy.window);
    }
  }

  /// Failures currently inside the window.
  pub fn recent_failures(&self, now: Instant) -> usize {
    match self.failures.lock() {
      Ok(mut failures) => {
        Self::evict(&mut failures, now, self.policy.window);
        failures.len()
      }
      Err(_) => 0,
    }
  }

  /// Fails when the budget is exhausted at `now`.
  pub fn check(&self, now: Instant) -> Result<(), PipelineError> {
    let failures = self.recent_failures(now);
    if failures > self.policy.max_failures {
      return Err(PipelineError::RestartBudgetExhausted {
        failures,
        window: self.policy.window,
      });
    }
    Ok(())
  }

  fn evict(failures: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = failures.front() {
      if now.saturating_duration_since(*oldest) > window {
        failures.pop_front();
      } else {
        break;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_budget_exhausts_after_max_failures() {
    let budget = FailureBudget::new(SupervisionPolicy::new(2, Duration::from_secs(60)));
    let now = Instant::now();
    budget.record_failure(now);
    budget.record_failure(now);
    assert!(budget.check(now).is_ok());
    budget.record_failure(now);
    assert!(matches!(
      budget.check(now),
      Err(PipelineError::RestartBudgetExhausted { failures: 3, .. })
    ));
  }

  #[test]
  fn test_failures_age_out() {
    let budget = FailureBudget::new(SupervisionPolicy::new(0, Duration::from_secs(10)));
    let start = Instant::now();
    budget.record_failure(start);
    assert!(budget.check(start).is_err());
    assert!(budget.check(start + Duration::from_secs(11)).is_ok());
    assert_eq!(budget.recent_failures(start + Duration::from_secs(11)), 0);
  }

  #[test]
  fn test_default_policy() {
    let policy = SupervisionPolicy::default();
    assert_eq!(policy.max_failures, 5);
    assert_eq!(policy.window, Duration::from_secs(60));
  }
}
