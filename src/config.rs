//! Pipeline configuration.
//!
//! [`PipelineConfig`] carries the chunking, demand, buffering, memory and
//! retry bounds of one pipeline together with the aggregations the Aggregate
//! Stage maintains. Every field has a default, so a configuration can be
//! deserialized from a partial JSON document or built fluently:
//!
//! ```rust
//! use streamgate::config::{AggregationSpec, GroupedAggregationSpec, PipelineConfig};
//!
//! let config = PipelineConfig::default()
//!   .with_chunk_size(250)
//!   .with_aggregation(AggregationSpec::sum("revenue", "amount"))
//!   .with_grouped_aggregation(
//!     GroupedAggregationSpec::new("by_territory", ["territory"])
//!       .with_aggregation(AggregationSpec::count("orders"))
//!       .with_max_groups(100),
//!   );
//! assert!(config.validate().is_ok());
//! ```

use crate::error::ConfigError;
use crate::record::FieldPath;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Default number of records per fetch.
pub const DEFAULT_CHUNK_SIZE: usize = 500;
/// Default demand window and output buffer capacity.
pub const DEFAULT_MAX_DEMAND: usize = 1000;
/// Default circuit-breaker threshold in bytes.
pub const DEFAULT_MEMORY_LIMIT: u64 = 500_000_000;
/// Default bound on distinct keys per grouping.
pub const DEFAULT_MAX_GROUPS: usize = 10_000;
/// Largest capacity a tokio channel accepts (its semaphore's permit limit).
pub const MAX_CHANNEL_CAPACITY: usize = usize::MAX >> 3;

/// Aggregation function maintained incrementally per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
  /// Number of records (or of records where the field is present).
  Count,
  /// Sum of numeric values.
  Sum,
  /// Arithmetic mean of numeric values.
  Avg,
  /// Smallest numeric value.
  Min,
  /// Largest numeric value.
  Max,
  /// Cumulative sum, also stamped into each emitted record.
  RunningTotal,
}

impl AggregateFunction {
  /// Whether the function needs a field to read values from.
  pub fn requires_field(&self) -> bool {
    !matches!(self, AggregateFunction::Count)
  }
}

impl fmt::Display for AggregateFunction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      AggregateFunction::Count => "count",
      AggregateFunction::Sum => "sum",
      AggregateFunction::Avg => "avg",
      AggregateFunction::Min => "min",
      AggregateFunction::Max => "max",
      AggregateFunction::RunningTotal => "running_total",
    };
    f.write_str(name)
  }
}

/// One named aggregation over an optional field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
  /// Name under which the running value is reported.
  pub name: String,
  /// Function to apply.
  pub function: AggregateFunction,
  /// Field to read; `count` without a field counts every record.
  #[serde(default)]
  pub field: Option<FieldPath>,
}

impl AggregationSpec {
  /// Creates a spec for an arbitrary function.
  pub fn new(name: impl Into<String>, function: AggregateFunction, field: Option<FieldPath>) -> Self {
    Self {
      name: name.into(),
      function,
      field,
    }
  }

  /// Counts every record.
  pub fn count(name: impl Into<String>) -> Self {
    Self::new(name, AggregateFunction::Count, None)
  }

  /// Counts records where `field` is present and not null.
  pub fn count_field(name: impl Into<String>, field: impl Into<FieldPath>) -> Self {
    Self::new(name, AggregateFunction::Count, Some(field.into()))
  }

  /// Sums `field`.
  pub fn sum(name: impl Into<String>, field: impl Into<FieldPath>) -> Self {
    Self::new(name, AggregateFunction::Sum, Some(field.into()))
  }

  /// Averages `field`.
  pub fn avg(name: impl Into<String>, field: impl Into<FieldPath>) -> Self {
    Self::new(name, AggregateFunction::Avg, Some(field.into()))
  }

  /// Minimum of `field`.
  pub fn min(name: impl Into<String>, field: impl Into<FieldPath>) -> Self {
    Self::new(name, AggregateFunction::Min, Some(field.into()))
  }

  /// Maximum of `field`.
  pub fn max(name: impl Into<String>, field: impl Into<FieldPath>) -> Self {
    Self::new(name, AggregateFunction::Max, Some(field.into()))
  }

  /// Running total of `field`.
  pub fn running_total(name: impl Into<String>, field: impl Into<FieldPath>) -> Self {
    Self::new(name, AggregateFunction::RunningTotal, Some(field.into()))
  }
}

/// Ordering of groups in a grouped snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
  /// Ascending by group key.
  #[default]
  Asc,
  /// Descending by group key.
  Desc,
}

/// One independent grouped aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedAggregationSpec {
  /// Name of the grouping in snapshots and events.
  pub name: String,
  /// Fields forming the group key, in key order.
  pub group_by: Vec<FieldPath>,
  /// Aggregations maintained per group.
  #[serde(default)]
  pub aggregations: Vec<AggregationSpec>,
  /// Maximum number of distinct groups.
  #[serde(default = "default_max_groups")]
  pub max_groups: usize,
  /// Snapshot ordering.
  #[serde(default)]
  pub sort: SortOrder,
}

fn default_max_groups() -> usize {
  DEFAULT_MAX_GROUPS
}

impl GroupedAggregationSpec {
  /// Creates a grouping over the given key fields.
  pub fn new<I, P>(name: impl Into<String>, group_by: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<FieldPath>,
  {
    Self {
      name: name.into(),
      group_by: group_by.into_iter().map(Into::into).collect(),
      aggregations: Vec::new(),
      max_groups: DEFAULT_MAX_GROUPS,
      sort: SortOrder::Asc,
    }
  }

  /// Adds a per-group aggregation.
  pub fn with_aggregation(mut self, spec: AggregationSpec) -> Self {
    self.aggregations.push(spec);
    self
  }

  /// Sets the cardinality bound.
  pub fn with_max_groups(mut self, max_groups: usize) -> Self {
    self.max_groups = max_groups;
    self
  }

  /// Sets the snapshot ordering.
  pub fn with_sort(mut self, sort: SortOrder) -> Self {
    self.sort = sort;
    self
  }
}

/// Configuration of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// Records per fetch/emit unit.
  pub chunk_size: usize,
  /// Upper bound on demand the Aggregate Stage keeps outstanding upstream.
  pub max_demand: usize,
  /// Outstanding demand at or below which the stage asks for more.
  /// Defaults to 75% of `max_demand`.
  pub min_demand: Option<usize>,
  /// Capacity of the output buffer between the stage and the caller.
  pub buffer_size: usize,
  /// Circuit-breaker threshold in bytes.
  pub memory_limit: u64,
  /// Fraction of `memory_limit` at which the producer halves its chunk size.
  pub degraded_memory_ratio: f64,
  /// Poll interval while the circuit breaker is open.
  pub memory_check_interval: Duration,
  /// Retry budget for transient fetch failures.
  pub max_retries: u32,
  /// First backoff delay.
  pub retry_base_delay: Duration,
  /// Backoff ceiling.
  pub retry_max_delay: Duration,
  /// Upper bound on a single fetch call.
  pub fetch_timeout: Option<Duration>,
  /// Global aggregations.
  pub aggregations: Vec<AggregationSpec>,
  /// Independent grouped aggregations.
  pub grouped_aggregations: Vec<GroupedAggregationSpec>,
  /// Overall pipeline timeout; unbounded when `None`.
  pub timeout: Option<Duration>,
  /// Emit telemetry events for this pipeline.
  pub enable_telemetry: bool,
  /// Free-form labels copied into the registry entry.
  pub metadata: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      chunk_size: DEFAULT_CHUNK_SIZE,
      max_demand: DEFAULT_MAX_DEMAND,
      min_demand: None,
      buffer_size: DEFAULT_MAX_DEMAND,
      memory_limit: DEFAULT_MEMORY_LIMIT,
      degraded_memory_ratio: 0.8,
      memory_check_interval: Duration::from_millis(100),
      max_retries: 3,
      retry_base_delay: Duration::from_millis(100),
      retry_max_delay: Duration::from_secs(5),
      fetch_timeout: Some(Duration::from_secs(30)),
      aggregations: Vec::new(),
      grouped_aggregations: Vec::new(),
      timeout: None,
      enable_telemetry: true,
      metadata: BTreeMap::new(),
    }
  }
}

impl PipelineConfig {
  /// Parses a JSON document; missing fields take their defaults.
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
  }

  /// Sets the chunk size.
  pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
    self.chunk_size = chunk_size;
    self
  }

  /// Sets the demand window.
  pub fn with_max_demand(mut self, max_demand: usize) -> Self {
    self.max_demand = max_demand;
    self
  }

  /// Sets the demand low-water mark.
  pub fn with_min_demand(mut self, min_demand: usize) -> Self {
    self.min_demand = Some(min_demand);
    self
  }

  /// Sets the output buffer capacity.
  pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
    self.buffer_size = buffer_size;
    self
  }

  /// Sets the memory limit in bytes.
  pub fn with_memory_limit(mut self, memory_limit: u64) -> Self {
    self.memory_limit = memory_limit;
    self
  }

  /// Sets the degraded-mode ratio.
  pub fn with_degraded_memory_ratio(mut self, ratio: f64) -> Self {
    self.degraded_memory_ratio = ratio;
    self
  }

  /// Sets the poll interval used while the breaker is open.
  pub fn with_memory_check_interval(mut self, interval: Duration) -> Self {
    self.memory_check_interval = interval;
    self
  }

  /// Sets the retry budget and backoff bounds.
  pub fn with_retries(mut self, max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
    self.max_retries = max_retries;
    self.retry_base_delay = base_delay;
    self.retry_max_delay = max_delay;
    self
  }

  /// Sets the per-fetch timeout.
  pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.fetch_timeout = timeout;
    self
  }

  /// Adds a global aggregation.
  pub fn with_aggregation(mut self, spec: AggregationSpec) -> Self {
    self.aggregations.push(spec);
    self
  }

  /// Adds a grouped aggregation.
  pub fn with_grouped_aggregation(mut self, spec: GroupedAggregationSpec) -> Self {
    self.grouped_aggregations.push(spec);
    self
  }

  /// Sets the overall timeout.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  /// Enables or disables telemetry.
  pub fn with_telemetry(mut self, enabled: bool) -> Self {
    self.enable_telemetry = enabled;
    self
  }

  /// Adds a metadata label.
  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }

  /// The low-water mark actually used by the Aggregate Stage.
  pub fn effective_min_demand(&self) -> usize {
    self
      .min_demand
      .unwrap_or(self.max_demand / 4 * 3 + self.max_demand % 4 * 3 / 4)
  }

  /// Validates the configuration. Nothing is started when this fails.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.chunk_size == 0 {
      return Err(ConfigError::ZeroChunkSize);
    }
    if self.max_demand == 0 {
      return Err(ConfigError::ZeroMaxDemand);
    }
    if self.buffer_size == 0 {
      return Err(ConfigError::ZeroBufferSize);
    }
    if self.memory_limit == 0 {
      return Err(ConfigError::ZeroMemoryLimit);
    }
    for (field, value) in [("max_demand", self.max_demand), ("buffer_size", self.buffer_size)] {
      if value > MAX_CHANNEL_CAPACITY {
        return Err(ConfigError::CapacityTooLarge {
          field,
          value,
          max: MAX_CHANNEL_CAPACITY,
        });
      }
    }
    let min_demand = self.effective_min_demand();
    if min_demand >= self.max_demand {
      return Err(ConfigError::MinDemandTooLarge {
        min_demand,
        max_demand: self.max_demand,
      });
    }
    if !(self.degraded_memory_ratio > 0.0 && self.degraded_memory_ratio <= 1.0) {
      return Err(ConfigError::InvalidThreshold(format!(
        "degraded_memory_ratio must be in (0, 1], got {}",
        self.degraded_memory_ratio
      )));
    }
    if self.memory_check_interval.is_zero() {
      return Err(ConfigError::ZeroDuration("memory_check_interval"));
    }
    if self.timeout.is_some_and(|t| t.is_zero()) {
      return Err(ConfigError::ZeroDuration("timeout"));
    }
    if self.fetch_timeout.is_some_and(|t| t.is_zero()) {
      return Err(ConfigError::ZeroDuration("fetch_timeout"));
    }
    validate_aggregations(&self.aggregations)?;

    let mut grouping_names = HashSet::new();
    for grouping in &self.grouped_aggregations {
      if !grouping_names.insert(grouping.name.as_str()) {
        return Err(ConfigError::DuplicateName(grouping.name.clone()));
      }
      if grouping.max_groups == 0 {
        return Err(ConfigError::ZeroMaxGroups(grouping.name.clone()));
      }
      if grouping.group_by.is_empty() || grouping.group_by.iter().any(FieldPath::is_empty) {
        return Err(ConfigError::EmptyGroupBy(grouping.name.clone()));
      }
      validate_aggregations(&grouping.aggregations)?;
    }
    Ok(())
  }
}

fn validate_aggregations(specs: &[AggregationSpec]) -> Result<(), ConfigError> {
  let mut names = HashSet::new();
  for spec in specs {
    if !names.insert(spec.name.as_str()) {
      return Err(ConfigError::DuplicateName(spec.name.clone()));
    }
    let has_field = spec.field.as_ref().is_some_and(|f| !f.is_empty());
    if spec.function.requires_field() && !has_field {
      return Err(ConfigError::MissingField {
        name: spec.name.clone(),
        function: spec.function.to_string(),
      });
    }
  }
  Ok(())
}
