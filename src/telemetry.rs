//! # Telemetry
//!
//! Structured pipeline events and the [`Reporter`] interface they are delivered
//! through.
//!
//! Every component that emits events receives a [`SharedReporter`] explicitly;
//! there is no process-wide event bus. Reporters shipped with the crate:
//!
//! - [`TracingReporter`]: logs each event with `tracing` and feeds the
//!   [`metrics`](crate::metrics) helpers. This is the default.
//! - [`BroadcastReporter`]: fans events out to any number of subscribers over a
//!   tokio broadcast channel.
//! - [`CollectingReporter`]: keeps events in memory; handy for tests and
//!   dashboards.
//! - [`NoopReporter`]: drops everything. Used when `enable_telemetry` is false.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use streamgate::telemetry::{CollectingReporter, Reporter, TelemetryEvent};
//! use streamgate::registry::PipelineId;
//!
//! let reporter = Arc::new(CollectingReporter::new());
//! reporter.report(TelemetryEvent::pipeline_start(PipelineId::from("p-1")));
//! assert_eq!(reporter.count("pipeline.start"), 1);
//! ```

use crate::error::PipelineStage;
use crate::memory::BreakerState;
use crate::registry::PipelineId;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::Level;

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
  /// The Producer started.
  PipelineStart,
  /// The Producer stopped without error.
  PipelineStop {
    /// Time since the Producer started.
    elapsed: Duration,
    /// Records the Producer handed downstream.
    records: u64,
  },
  /// The pipeline failed.
  PipelineError {
    /// Time since start.
    elapsed: Duration,
    /// Failure description.
    reason: String,
  },
  /// The Aggregate Stage finished one upstream chunk.
  BatchTransformed {
    /// Records received in the chunk.
    records_in: u64,
    /// Records emitted downstream.
    records_out: u64,
    /// Records whose transform failed.
    failed_count: u64,
    /// Group rejections caused by the chunk.
    rejected_count: u64,
    /// Time spent on the chunk.
    duration: Duration,
  },
  /// The output buffer crossed its high-water mark.
  BufferNearFull {
    /// Records currently buffered.
    buffered: usize,
    /// Buffer capacity.
    capacity: usize,
  },
  /// A grouping refused a new key.
  GroupRejected {
    /// Grouping name.
    grouping: String,
    /// Rendered key that was refused.
    key: String,
    /// Cumulative rejections of the grouping.
    rejected_count: u64,
  },
  /// The memory circuit breaker changed position.
  CircuitTransition {
    /// Previous position.
    from: BreakerState,
    /// New position.
    to: BreakerState,
    /// Sample that caused the change.
    usage: u64,
    /// Configured limit.
    limit: u64,
  },
  /// A transient fetch failure will be retried.
  FetchRetry {
    /// Retry number, starting at 1.
    attempt: u32,
    /// Backoff before the retry.
    delay: Duration,
    /// Error that triggered the retry.
    reason: String,
  },
  /// One health monitor tick.
  HealthCheck {
    /// Running or paused pipelines.
    active_pipeline_count: usize,
    /// Sum of the latest memory samples of active pipelines.
    total_memory: u64,
  },
  /// Memory usage crossed the warning ratio.
  MemoryWarning {
    /// Latest sample.
    usage: u64,
    /// Configured limit.
    limit: u64,
  },
  /// Memory usage crossed the critical ratio.
  MemoryCritical {
    /// Latest sample.
    usage: u64,
    /// Configured limit.
    limit: u64,
  },
  /// Processing rate since start.
  Throughput {
    /// Records per second.
    records_per_second: f64,
  },
  /// An execution unit of an active pipeline is gone.
  LivenessLost {
    /// The missing unit.
    stage: PipelineStage,
  },
}

/// One event, optionally scoped to a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
  /// Pipeline the event belongs to; `None` for monitor-wide events.
  pub pipeline_id: Option<PipelineId>,
  /// Measurements.
  pub kind: EventKind,
}

impl TelemetryEvent {
  /// Creates an event for a pipeline.
  pub fn new(pipeline_id: PipelineId, kind: EventKind) -> Self {
    Self {
      pipeline_id: Some(pipeline_id),
      kind,
    }
  }

  /// Creates an event that is not tied to a pipeline.
  pub fn global(kind: EventKind) -> Self {
    Self {
      pipeline_id: None,
      kind,
    }
  }

  /// `pipeline.start` for `pipeline_id`.
  pub fn pipeline_start(pipeline_id: PipelineId) -> Self {
    Self::new(pipeline_id, EventKind::PipelineStart)
  }

  /// Dotted event name.
  pub fn name(&self) -> &'static str {
    match &self.kind {
      EventKind::PipelineStart => "pipeline.start",
      EventKind::PipelineStop { .. } => "pipeline.stop",
      EventKind::PipelineError { .. } => "pipeline.error",
      EventKind::BatchTransformed { .. } => "batch.transformed",
      EventKind::BufferNearFull { .. } => "buffer.near_full",
      EventKind::GroupRejected { .. } => "group.rejected",
      EventKind::CircuitTransition { .. } => "circuit.transition",
      EventKind::FetchRetry { .. } => "fetch.retry",
      EventKind::HealthCheck { .. } => "health.check",
      EventKind::MemoryWarning { .. } => "memory.warning",
      EventKind::MemoryCritical { .. } => "memory.critical",
      EventKind::Throughput { .. } => "throughput",
      EventKind::LivenessLost { .. } => "liveness.lost",
    }
  }
}

/// Receives telemetry events.
pub trait Reporter: Send + Sync {
  /// Delivers one event. Must not block.
  fn report(&self, event: TelemetryEvent);
}

/// Reporter handle passed to every component.
pub type SharedReporter = Arc<dyn Reporter>;

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
  fn report(&self, _event: TelemetryEvent) {}
}

/// Logs events through `tracing` and records metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
  fn report(&self, event: TelemetryEvent) {
    let id = event
      .pipeline_id
      .as_ref()
      .map(|id| id.as_str().to_string())
      .unwrap_or_default();
    let name = event.name();
    match event.kind {
      EventKind::PipelineStart => {
        tracing::info!(pipeline_id = %id, event = name, "pipeline started");
      }
      EventKind::PipelineStop { elapsed, records } => {
        tracing::info!(pipeline_id = %id, event = name, ?elapsed, records, "pipeline stopped");
      }
      EventKind::PipelineError { elapsed, reason } => {
        crate::metrics::record_pipeline_error(&id);
        tracing::error!(pipeline_id = %id, event = name, ?elapsed, %reason, "pipeline failed");
      }
      EventKind::BatchTransformed {
        records_in,
        records_out,
        failed_count,
        rejected_count,
        duration,
      } => {
        crate::metrics::record_records_in(&id, records_in);
        crate::metrics::record_records_out(&id, records_out);
        crate::metrics::record_transform_failures(&id, failed_count);
        crate::metrics::record_batch_duration(&id, duration.as_secs_f64());
        tracing::debug!(
          pipeline_id = %id,
          event = name,
          records_in,
          records_out,
          failed_count,
          rejected_count,
          ?duration,
          "batch transformed"
        );
      }
      EventKind::BufferNearFull { buffered, capacity } => {
        tracing::debug!(pipeline_id = %id, event = name, buffered, capacity, "output buffer near full");
      }
      EventKind::GroupRejected {
        grouping,
        key,
        rejected_count,
      } => {
        crate::metrics::record_group_rejections(&id, &grouping, 1);
        tracing::debug!(pipeline_id = %id, event = name, %grouping, %key, rejected_count, "group key rejected");
      }
      EventKind::CircuitTransition {
        from,
        to,
        usage,
        limit,
      } => {
        crate::metrics::record_breaker_state(&id, to);
        tracing::warn!(
          pipeline_id = %id,
          event = name,
          from = from.as_str(),
          to = to.as_str(),
          usage,
          limit,
          "memory circuit breaker transition"
        );
      }
      EventKind::FetchRetry {
        attempt,
        delay,
        reason,
      } => {
        crate::metrics::record_fetch_retry(&id);
        tracing::warn!(pipeline_id = %id, event = name, attempt, ?delay, %reason, "retrying fetch");
      }
      EventKind::HealthCheck {
        active_pipeline_count,
        total_memory,
      } => {
        crate::metrics::record_active_pipelines(active_pipeline_count);
        tracing::trace!(event = name, active_pipeline_count, total_memory, "health check");
      }
      EventKind::MemoryWarning { usage, limit } => {
        crate::metrics::record_memory_usage(&id, usage);
        tracing::warn!(pipeline_id = %id, event = name, usage, limit, "memory usage above warning ratio");
      }
      EventKind::MemoryCritical { usage, limit } => {
        crate::metrics::record_memory_usage(&id, usage);
        tracing::error!(pipeline_id = %id, event = name, usage, limit, "memory usage above critical ratio");
      }
      EventKind::Throughput { records_per_second } => {
        tracing::trace!(pipeline_id = %id, event = name, records_per_second, "throughput");
      }
      EventKind::LivenessLost { stage } => {
        tracing::warn!(pipeline_id = %id, event = name, %stage, "execution unit no longer alive");
      }
    }
  }
}

/// Fans events out to subscribers. Events are dropped when nobody listens.
#[derive(Debug, Clone)]
pub struct BroadcastReporter {
  sender: broadcast::Sender<TelemetryEvent>,
}

impl BroadcastReporter {
  /// Creates a reporter whose subscribers may lag by up to `capacity` events.
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  /// Subscribes to subsequent events.
  pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
    self.sender.subscribe()
  }
}

impl Reporter for BroadcastReporter {
  fn report(&self, event: TelemetryEvent) {
    let _ = self.sender.send(event);
  }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingReporter {
  events: Mutex<Vec<TelemetryEvent>>,
}

impl CollectingReporter {
  /// Creates an empty collector.
  pub fn new() -> Self {
    Self::default()
  }

  /// Copies the events collected so far.
  pub fn events(&self) -> Vec<TelemetryEvent> {
    self.events.lock().map(|events| events.clone()).unwrap_or_default()
  }

  /// Events with the given dotted name.
  pub fn named(&self, name: &str) -> Vec<TelemetryEvent> {
    self
      .events()
      .into_iter()
      .filter(|event| event.name() == name)
      .collect()
  }

  /// Number of events with the given dotted name.
  pub fn count(&self, name: &str) -> usize {
    self.named(name).len()
  }
}

impl Reporter for CollectingReporter {
  fn report(&self, event: TelemetryEvent) {
    if let Ok(mut events) = self.events.lock() {
      events.push(event);
    }
  }
}

/// Installs a `tracing-subscriber` fmt subscriber at `level`.
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(level: Level) -> bool {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_target(false)
    .try_init()
    .is_ok()
}

/// Reporter used by a pipeline: the given one when telemetry is enabled,
/// otherwise a [`NoopReporter`].
pub(crate) fn for_pipeline(reporter: &SharedReporter, enabled: bool) -> SharedReporter {
  if enabled {
    reporter.clone()
  } else {
    Arc::new(NoopReporter)
  }
}
