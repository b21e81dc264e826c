//! Metrics for pipeline observability.
//!
//! Thin helpers over the [`metrics`] facade. If no recorder is installed by the
//! host application, recording is a no-op.
//!
//! - **Throughput:** [`record_records_in`] / [`record_records_out`] feed the
//!   `streamgate_records_in_total` and `streamgate_records_out_total` counters.
//! - **Failures:** [`record_transform_failures`], [`record_group_rejections`] and
//!   [`record_pipeline_error`].
//! - **Memory:** [`record_memory_usage`] sets `streamgate_memory_bytes`, and
//!   [`record_breaker_state`] sets `streamgate_breaker_state` (0 closed,
//!   1 degraded, 2 open).
//! - **Registry:** [`record_active_pipelines`] sets `streamgate_active_pipelines`.

use crate::memory::BreakerState;
use metrics::{counter, gauge, histogram};

/// Records consumed by the Aggregate Stage.
pub fn record_records_in(pipeline_id: &str, count: u64) {
  counter!("streamgate_records_in_total", "pipeline_id" => pipeline_id.to_string()).increment(count);
}

/// Records emitted to the output stream.
pub fn record_records_out(pipeline_id: &str, count: u64) {
  counter!("streamgate_records_out_total", "pipeline_id" => pipeline_id.to_string()).increment(count);
}

/// Records skipped because the transform failed.
pub fn record_transform_failures(pipeline_id: &str, count: u64) {
  if count == 0 {
    return;
  }
  counter!("streamgate_transform_failures_total", "pipeline_id" => pipeline_id.to_string())
    .increment(count);
}

/// Records refused by a grouping at its cardinality bound.
pub fn record_group_rejections(pipeline_id: &str, grouping: &str, count: u64) {
  counter!(
    "streamgate_group_rejections_total",
    "pipeline_id" => pipeline_id.to_string(),
    "grouping" => grouping.to_string()
  )
  .increment(count);
}

/// Pipeline ended in failure.
pub fn record_pipeline_error(pipeline_id: &str) {
  counter!("streamgate_errors_total", "pipeline_id" => pipeline_id.to_string()).increment(1);
}

/// Transient fetch error that will be retried.
pub fn record_fetch_retry(pipeline_id: &str) {
  counter!("streamgate_fetch_retries_total", "pipeline_id" => pipeline_id.to_string()).increment(1);
}

/// Latest memory sample for a pipeline.
pub fn record_memory_usage(pipeline_id: &str, bytes: u64) {
  gauge!("streamgate_memory_bytes", "pipeline_id" => pipeline_id.to_string()).set(bytes as f64);
}

/// Current circuit-breaker position.
pub fn record_breaker_state(pipeline_id: &str, state: BreakerState) {
  let value = match state {
    BreakerState::Closed => 0.0,
    BreakerState::Degraded => 1.0,
    BreakerState::Open => 2.0,
  };
  gauge!("streamgate_breaker_state", "pipeline_id" => pipeline_id.to_string()).set(value);
}

/// Duration of one transformed batch, in seconds.
pub fn record_batch_duration(pipeline_id: &str, seconds: f64) {
  histogram!("streamgate_batch_duration_seconds", "pipeline_id" => pipeline_id.to_string())
    .record(seconds);
}

/// Pipelines currently running or paused.
pub fn record_active_pipelines(count: usize) {
  gauge!("streamgate_active_pipelines").set(count as f64);
}
