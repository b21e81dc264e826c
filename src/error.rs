//! # Error Handling
//!
//! Error taxonomy for streamgate pipelines. Errors are split by the scope at
//! which they are recovered:
//!
//! - **Record level**: [`TransformError`] and group-cardinality rejections are
//!   always recovered inside the Aggregate Stage. The record is skipped or left
//!   out of its group and a counter is incremented; the pipeline continues.
//! - **Fetch level**: [`SourceError`] is classified as transient or permanent.
//!   Transient errors are retried with backoff by the Producer; permanent ones
//!   (and exhausted retries) become a [`PipelineError::SourceFetch`].
//! - **Pipeline level**: [`PipelineError`] surfaces through the output stream's
//!   final item and through the Registry status of the pipeline.
//! - **Configuration**: [`ConfigError`] is returned synchronously from
//!   `Coordinator::start`; nothing is registered or spawned.
//!
//! ## Example
//!
//! ```rust
//! use streamgate::error::{PipelineError, SourceError};
//!
//! let err = SourceError::transient("connection reset by peer");
//! assert!(err.is_transient());
//!
//! let fatal = PipelineError::SourceFetch { source: err, attempts: 4 };
//! assert!(fatal.to_string().contains("4 attempt"));
//! ```

use crate::registry::PipelineId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The execution unit of a pipeline an error or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
  /// The demand-driven Producer pulling from the source adapter.
  Producer,
  /// The Transform/Aggregate Stage relaying records to the caller.
  Aggregator,
}

impl PipelineStage {
  /// Both execution units, in start order.
  pub const ALL: [PipelineStage; 2] = [PipelineStage::Producer, PipelineStage::Aggregator];

  /// Returns the stable lowercase name used in logs and metrics labels.
  pub fn as_str(&self) -> &'static str {
    match self {
      PipelineStage::Producer => "producer",
      PipelineStage::Aggregator => "aggregator",
    }
  }
}

impl fmt::Display for PipelineStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Whether a failed fetch may succeed if attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
  /// Timeouts, connection resets and similar; retried with backoff.
  Transient,
  /// Malformed queries, missing tables, auth failures; never retried.
  Permanent,
}

impl fmt::Display for FetchErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FetchErrorKind::Transient => f.write_str("transient"),
      FetchErrorKind::Permanent => f.write_str("permanent"),
    }
  }
}

/// Error returned by a source adapter's `fetch` or `count`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} source error: {message}")]
pub struct SourceError {
  /// Retry classification.
  pub kind: FetchErrorKind,
  /// Human readable cause.
  pub message: String,
}

impl SourceError {
  /// Creates a retryable source error.
  pub fn transient(message: impl Into<String>) -> Self {
    Self {
      kind: FetchErrorKind::Transient,
      message: message.into(),
    }
  }

  /// Creates a non-retryable source error.
  pub fn permanent(message: impl Into<String>) -> Self {
    Self {
      kind: FetchErrorKind::Permanent,
      message: message.into(),
    }
  }

  /// Returns true when the fetch should be retried.
  pub fn is_transient(&self) -> bool {
    self.kind == FetchErrorKind::Transient
  }
}

/// Per-record failure raised by a caller-supplied transform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transform failed: {0}")]
pub struct TransformError(pub String);

impl TransformError {
  /// Creates a transform error from any message.
  pub fn new(message: impl Into<String>) -> Self {
    Self(message.into())
  }
}

/// Invalid pipeline or monitor configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
  /// `chunk_size` was zero.
  #[error("chunk_size must be greater than 0")]
  ZeroChunkSize,
  /// `max_demand` was zero.
  #[error("max_demand must be greater than 0")]
  ZeroMaxDemand,
  /// `buffer_size` was zero.
  #[error("buffer_size must be greater than 0")]
  ZeroBufferSize,
  /// `memory_limit` was zero.
  #[error("memory_limit must be greater than 0")]
  ZeroMemoryLimit,
  /// A channel-backed bound exceeded what tokio channels accept.
  #[error("{field} ({value}) exceeds the channel capacity limit of {max}")]
  CapacityTooLarge {
    /// Offending field.
    field: &'static str,
    /// Configured value.
    value: usize,
    /// Largest accepted value.
    max: usize,
  },
  /// `min_demand` was not below `max_demand`.
  #[error("min_demand ({min_demand}) must be less than max_demand ({max_demand})")]
  MinDemandTooLarge {
    /// Configured low-water mark.
    min_demand: usize,
    /// Configured demand window.
    max_demand: usize,
  },
  /// A grouping declared `max_groups = 0`.
  #[error("grouped aggregation '{0}' must allow at least one group (max_groups > 0)")]
  ZeroMaxGroups(String),
  /// A grouping declared no group-by fields.
  #[error("grouped aggregation '{0}' needs at least one group_by field")]
  EmptyGroupBy(String),
  /// A numeric aggregation was declared without a field.
  #[error("aggregation '{name}' uses {function} and requires a field")]
  MissingField {
    /// Aggregation name.
    name: String,
    /// Function that needs the field.
    function: String,
  },
  /// Two aggregations in the same scope share a name.
  #[error("duplicate aggregation name '{0}'")]
  DuplicateName(String),
  /// A ratio or threshold is outside its valid range.
  #[error("invalid threshold: {0}")]
  InvalidThreshold(String),
  /// A duration that must be positive was zero.
  #[error("{0} must be greater than zero")]
  ZeroDuration(&'static str),
  /// The configuration document could not be parsed.
  #[error("failed to parse configuration: {0}")]
  Parse(String),
}

/// Pipeline-level error, surfaced through `start`, the output stream and status.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
  /// Configuration was rejected before anything was started.
  #[error("invalid pipeline configuration: {0}")]
  Config(#[from] ConfigError),
  /// A fetch failed permanently or exhausted its retry budget.
  #[error("source fetch failed after {attempts} attempt(s): {source}")]
  SourceFetch {
    /// Last error returned by the source adapter.
    source: SourceError,
    /// Total attempts made, including the first.
    attempts: u32,
  },
  /// The configured overall timeout elapsed.
  #[error("pipeline timed out after {0:?}")]
  Timeout(Duration),
  /// The health monitor terminated the pipeline.
  #[error("pipeline killed by health monitor: {0}")]
  Killed(String),
  /// An execution unit panicked or stopped without reporting completion.
  #[error("{stage} crashed: {reason}")]
  Crashed {
    /// Unit that crashed.
    stage: PipelineStage,
    /// Panic message or termination reason.
    reason: String,
  },
  /// The pipeline was cancelled.
  #[error("pipeline cancelled")]
  Cancelled,
  /// No registry entry exists for the id.
  #[error("pipeline {0} not found")]
  NotFound(PipelineId),
  /// A registry entry with the same id already exists.
  #[error("pipeline {0} is already registered")]
  Duplicate(PipelineId),
  /// Too many pipelines failed recently; new starts are refused.
  #[error("{failures} pipeline failures within {window:?}; refusing to start new pipelines")]
  RestartBudgetExhausted {
    /// Failures observed inside the window.
    failures: usize,
    /// Sliding window length.
    window: Duration,
  },
  /// The Aggregate Stage is no longer accepting requests.
  #[error("aggregate stage of pipeline {0} is not available")]
  StageUnavailable(PipelineId),
}

impl PipelineError {
  /// Returns true for errors raised before a pipeline was started.
  pub fn is_config(&self) -> bool {
    matches!(self, PipelineError::Config(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_source_error_classification() {
    assert!(SourceError::transient("timeout").is_transient());
    assert!(!SourceError::permanent("no such table").is_transient());
  }

  #[test]
  fn test_source_error_display() {
    let err = SourceError::permanent("no such table");
    assert_eq!(err.to_string(), "permanent source error: no such table");
  }

  #[test]
  fn test_pipeline_error_from_config() {
    let err: PipelineError = ConfigError::ZeroChunkSize.into();
    assert!(err.is_config());
    assert_eq!(
      err.to_string(),
      "invalid pipeline configuration: chunk_size must be greater than 0"
    );
  }

  #[test]
  fn test_source_fetch_display_includes_cause() {
    let err = PipelineError::SourceFetch {
      source: SourceError::transient("connection reset"),
      attempts: 4,
    };
    let message = err.to_string();
    assert!(message.contains("4 attempt(s)"));
    assert!(message.contains("connection reset"));
  }

  #[test]
  fn test_stage_names() {
    assert_eq!(PipelineStage::Producer.to_string(), "producer");
    assert_eq!(PipelineStage::Aggregator.as_str(), "aggregator");
  }
}
