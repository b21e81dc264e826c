//! # Memory Circuit Breaker
//!
//! Memory sampling and the load-shedding thresholds the Producer applies before
//! every fetch.
//!
//! ## Thresholds
//!
//! - **Closed**: usage below `degraded_ratio * limit`; fetches use the full
//!   chunk size.
//! - **Degraded**: usage at or above the degraded threshold but below the limit;
//!   the effective chunk size is halved to shed load gradually.
//! - **Open**: usage at or above the limit; the Producer withholds production
//!   and re-samples on an interval. Open is a pause, never a failure.
//!
//! ## Probes
//!
//! The breaker reads usage through the [`MemoryProbe`] trait so tests and
//! simulations can drive it deterministically with [`ManualMemoryProbe`]. The
//! default [`ProcessMemoryProbe`] reports the resident set size of the current
//! process.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Pid, System};

/// Source of memory usage samples, in bytes.
pub trait MemoryProbe: Send + Sync {
  /// Takes one sample.
  fn sample(&self) -> u64;
}

/// Samples the resident memory of the current process.
pub struct ProcessMemoryProbe {
  system: Mutex<System>,
  pid: Option<Pid>,
}

impl Default for ProcessMemoryProbe {
  fn default() -> Self {
    Self::new()
  }
}

impl ProcessMemoryProbe {
  /// Creates a probe for the current process.
  pub fn new() -> Self {
    let pid = sysinfo::get_current_pid().ok();
    if pid.is_none() {
      tracing::warn!("current pid unavailable; process memory probe will report 0");
    }
    Self {
      system: Mutex::new(System::new()),
      pid,
    }
  }
}

impl MemoryProbe for ProcessMemoryProbe {
  fn sample(&self) -> u64 {
    let Some(pid) = self.pid else {
      return 0;
    };
    let Ok(mut system) = self.system.lock() else {
      return 0;
    };
    system.refresh_process(pid);
    system.process(pid).map(|process| process.memory()).unwrap_or(0)
  }
}

/// A probe whose reading is set explicitly. Clones share the reading.
#[derive(Debug, Clone, Default)]
pub struct ManualMemoryProbe {
  usage: Arc<AtomicU64>,
}

impl ManualMemoryProbe {
  /// Creates a probe reporting `usage` bytes.
  pub fn new(usage: u64) -> Self {
    Self {
      usage: Arc::new(AtomicU64::new(usage)),
    }
  }

  /// Changes the reported usage.
  pub fn set(&self, usage: u64) {
    self.usage.store(usage, Ordering::Release);
  }
}

impl MemoryProbe for ManualMemoryProbe {
  fn sample(&self) -> u64 {
    self.usage.load(Ordering::Acquire)
  }
}

/// Breaker position for one memory sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
  /// Normal production.
  Closed,
  /// Reduced chunk size.
  Degraded,
  /// Production withheld.
  Open,
}

impl BreakerState {
  /// Stable name used in logs and events.
  pub fn as_str(&self) -> &'static str {
    match self {
      BreakerState::Closed => "closed",
      BreakerState::Degraded => "degraded",
      BreakerState::Open => "open",
    }
  }
}

/// Memory thresholds applied before each fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryCircuitBreaker {
  limit: u64,
  degraded_threshold: u64,
}

impl MemoryCircuitBreaker {
  /// Creates a breaker opening at `limit` bytes and degrading at
  /// `degraded_ratio * limit`.
  pub fn new(limit: u64, degraded_ratio: f64) -> Self {
    let degraded_threshold = ((limit as f64) * degraded_ratio.clamp(0.0, 1.0)) as u64;
    Self {
      limit,
      degraded_threshold: degraded_threshold.min(limit),
    }
  }

  /// Hard limit in bytes.
  pub fn limit(&self) -> u64 {
    self.limit
  }

  /// Classifies a sample.
  pub fn evaluate(&self, usage: u64) -> BreakerState {
    if usage >= self.limit {
      BreakerState::Open
    } else if usage >= self.degraded_threshold {
      BreakerState::Degraded
    } else {
      BreakerState::Closed
    }
  }

  /// Chunk size to use in the given state. Zero means "do not fetch".
  pub fn effective_chunk_size(&self, state: BreakerState, chunk_size: usize) -> usize {
    match state {
      BreakerState::Closed => chunk_size,
      BreakerState::Degraded => (chunk_size / 2).max(1),
      BreakerState::Open => 0,
    }
  }
}
