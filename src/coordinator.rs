//! # Pipeline Coordinator
//!
//! Public entry point: validates a configuration, wires a Producer to an
//! Aggregate Stage, registers the pair and hands the caller a lazily pulled
//! output stream.
//!
//! ```text
//!  SourceAdapter <- Producer --chunks(1)--> AggregateStage --buffer_size--> PipelineStream
//!                      ^                        |
//!                      +-------- demand --------+
//! ```
//!
//! Every pipeline also gets a watchdog task that enforces the optional overall
//! timeout (terminal status `timed_out`) and reports failures to the
//! Coordinator's [`FailureBudget`]. Once the budget is exhausted, `start`
//! refuses new pipelines until old failures leave the window.
//!
//! # Example
//!
//! ```rust
//! use futures::StreamExt;
//! use serde_json::json;
//! use std::sync::Arc;
//! use streamgate::config::{AggregationSpec, PipelineConfig};
//! use streamgate::coordinator::Coordinator;
//! use streamgate::source::VecSource;
//! use streamgate::stage::StreamItem;
//! use streamgate::transform::IdentityTransform;
//!
//! # tokio_test::block_on(async {
//! let coordinator = Coordinator::new();
//! let source = VecSource::from_values((1..=4).map(|i| json!({ "amount": i })));
//! let config = PipelineConfig::default()
//!   .with_chunk_size(2)
//!   .with_aggregation(AggregationSpec::sum("total", "amount"));
//!
//! let (id, mut stream) = coordinator
//!   .start(config, Arc::new(source), Arc::new(IdentityTransform))
//!   .await
//!   .unwrap();
//!
//! let mut records = 0;
//! let mut last = None;
//! while let Some(item) = stream.next().await {
//!   match item.unwrap() {
//!     StreamItem::Record(_) => records += 1,
//!     StreamItem::Snapshot(snapshot) => last = Some(snapshot),
//!   }
//! }
//! assert_eq!(records, 4);
//! assert_eq!(last.unwrap().global("total"), Some(&json!(10)));
//! # let _ = id;
//! # });
//! ```

use crate::config::PipelineConfig;
use crate::control::PipelineControl;
use crate::error::{ConfigError, PipelineError, PipelineStage};
use crate::health::{HealthMonitor, HealthMonitorConfig, HealthMonitorHandle};
use crate::memory::{MemoryProbe, ProcessMemoryProbe};
use crate::producer::Producer;
use crate::registry::{PipelineId, PipelineStatus, Registration, Registry};
use crate::source::SourceAdapter;
use crate::stage::{AggregateStage, StageCommand, StreamResult};
use crate::supervision::{FailureBudget, SupervisionPolicy};
use crate::telemetry::{self, SharedReporter, TracingReporter};
use crate::transform::RecordTransform;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Capacity of a stage's command channel.
const STAGE_COMMAND_CAPACITY: usize = 8;

/// How long finished pipelines stay in the registry by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30);

/// Answer to [`Coordinator::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatusReport {
  /// Current status.
  pub status: PipelineStatus,
  /// Fraction processed, when the source total is known.
  pub progress: Option<f64>,
  /// Latest memory sample in bytes.
  pub memory_usage: u64,
  /// Records consumed by the Aggregate Stage.
  pub records_processed: u64,
  /// Records whose transform failed.
  pub failed_count: u64,
  /// Group rejections.
  pub rejected_count: u64,
  /// Completed fetch rounds.
  pub fetch_rounds: u64,
  /// Why the pipeline ended, when it did not complete.
  pub failure_reason: Option<String>,
}

/// Starts, cancels and inspects pipelines.
pub struct Coordinator {
  registry: Registry,
  reporter: SharedReporter,
  probe: Arc<dyn MemoryProbe>,
  budget: Arc<FailureBudget>,
  cancel_grace: Duration,
  retention: Option<Duration>,
}

impl Default for Coordinator {
  fn default() -> Self {
    Self::new()
  }
}

impl Coordinator {
  /// Creates a coordinator with its own registry, tracing telemetry and a
  /// process memory probe.
  pub fn new() -> Self {
    Self {
      registry: Registry::new(),
      reporter: Arc::new(TracingReporter),
      probe: Arc::new(ProcessMemoryProbe::new()),
      budget: Arc::new(FailureBudget::new(SupervisionPolicy::default())),
      cancel_grace: Duration::from_secs(1),
      retention: Some(DEFAULT_RETENTION),
    }
  }

  /// Shares an existing registry.
  pub fn with_registry(mut self, registry: Registry) -> Self {
    self.registry = registry;
    self
  }

  /// Sets the telemetry reporter used by every pipeline.
  pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
    self.reporter = reporter;
    self
  }

  /// Sets the memory probe every Producer consults.
  pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
    self.probe = probe;
    self
  }

  /// Sets the failure budget policy.
  pub fn with_supervision(mut self, policy: SupervisionPolicy) -> Self {
    self.budget = Arc::new(FailureBudget::new(policy));
    self
  }

  /// Sets how long cancelled units get to unwind before they are aborted.
  pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
    self.cancel_grace = grace;
    self
  }

  /// Sets how long a finished pipeline stays queryable through `status`
  /// before its registry entry is dropped. `None` keeps entries until
  /// something else prunes them.
  pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
    self.retention = retention;
    self
  }

  /// The registry shared by this coordinator's pipelines.
  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  /// Validates `config`, starts a Producer and Aggregate Stage over `source`
  /// and returns the pipeline id with its output stream.
  ///
  /// Nothing is registered or spawned when validation fails.
  pub async fn start(
    &self,
    config: PipelineConfig,
    source: Arc<dyn SourceAdapter>,
    transform: Arc<dyn RecordTransform>,
  ) -> Result<(PipelineId, PipelineStream), PipelineError> {
    config.validate()?;
    self.budget.check(Instant::now())?;

    let total_records = match source.count().await {
      Some(Ok(total)) => Some(total),
      Some(Err(error)) => {
        warn!(%error, "source count unavailable; progress will not be reported");
        None
      }
      None => None,
    };

    let id = PipelineId::generate();
    let control = PipelineControl::new();
    let reporter = telemetry::for_pipeline(&self.reporter, config.enable_telemetry);
    let (output_tx, output_rx) = mpsc::channel(config.buffer_size);
    let (command_tx, command_rx) = mpsc::channel(STAGE_COMMAND_CAPACITY);

    self.registry.register(
      id.clone(),
      Registration::new(control.clone(), config.memory_limit)
        .with_total_records(total_records)
        .with_metadata(config.metadata.clone())
        .with_stage_commands(command_tx),
    )?;

    let producer = Producer::new(id.clone(), &config, source, control.clone())
      .with_registry(self.registry.clone())
      .with_reporter(reporter.clone())
      .with_memory_probe(self.probe.clone())
      .with_total_records(total_records);
    let (demand, chunks, producer_task) = producer.spawn();
    self.registry.attach(&id, PipelineStage::Producer, producer_task)?;

    let stage = AggregateStage::new(id.clone(), &config, transform, control.clone())
      .with_registry(self.registry.clone())
      .with_reporter(reporter);
    let stage_task = stage.spawn(demand, chunks, output_tx, command_rx);
    self.registry.attach(&id, PipelineStage::Aggregator, stage_task)?;

    self.spawn_watchdog(id.clone(), config.timeout);
    info!(
      pipeline_id = %id,
      chunk_size = config.chunk_size,
      max_demand = config.max_demand,
      buffer_size = config.buffer_size,
      total_records = ?total_records,
      "pipeline started"
    );

    Ok((
      id.clone(),
      PipelineStream {
        id,
        inner: ReceiverStream::new(output_rx),
        control,
      },
    ))
  }

  fn spawn_watchdog(&self, id: PipelineId, timeout: Option<Duration>) {
    let registry = self.registry.clone();
    let budget = self.budget.clone();
    let grace = self.cancel_grace;
    let retention = self.retention;
    tokio::spawn(async move {
      let terminal = match timeout {
        Some(timeout) => {
          tokio::select! {
            status = registry.wait_for_terminal(&id) => status,
            _ = tokio::time::sleep(timeout) => {
              let reason = format!("timed out after {timeout:?}");
              if let Ok(true) = registry.terminate(&id, PipelineStatus::TimedOut, Some(reason), grace) {
                warn!(pipeline_id = %id, ?timeout, "pipeline timed out");
              }
              registry.wait_for_terminal(&id).await
            }
          }
        }
        None => registry.wait_for_terminal(&id).await,
      };
      if let Ok(PipelineStatus::Failed) = terminal {
        budget.record_failure(Instant::now());
      }
      debug!(pipeline_id = %id, status = ?terminal, "watchdog finished");
      if let (Ok(_), Some(retention)) = (terminal, retention) {
        tokio::time::sleep(retention).await;
        if registry.remove_terminal(&id) {
          debug!(pipeline_id = %id, "finished pipeline removed from registry");
        }
      }
    });
  }

  /// Stops a pipeline and marks it `cancelled`.
  ///
  /// Idempotent: cancelling a terminal pipeline is a no-op. Fails only when
  /// the id is unknown.
  pub fn cancel(&self, id: &PipelineId) -> Result<(), PipelineError> {
    if self
      .registry
      .terminate(id, PipelineStatus::Cancelled, None, self.cancel_grace)?
    {
      info!(pipeline_id = %id, "pipeline cancelled");
    }
    Ok(())
  }

  /// Status, progress and memory of a pipeline.
  pub fn status(&self, id: &PipelineId) -> Result<PipelineStatusReport, PipelineError> {
    let info = self.registry.lookup(id)?;
    Ok(PipelineStatusReport {
      status: info.status,
      progress: info.progress(),
      memory_usage: info.memory_usage,
      records_processed: info.records_processed,
      failed_count: info.failed_count,
      rejected_count: info.rejected_count,
      fetch_rounds: info.fetch_rounds,
      failure_reason: info.failure_reason,
    })
  }

  /// Read-only copy of a running pipeline's aggregation state.
  ///
  /// Served by the stage between chunks, so it may wait while the stage is
  /// blocked on a full output buffer.
  pub async fn snapshot(
    &self,
    id: &PipelineId,
  ) -> Result<crate::aggregate::AggregationSnapshot, PipelineError> {
    self.registry.lookup(id)?;
    let commands = self
      .registry
      .stage_commands(id)
      .ok_or_else(|| PipelineError::StageUnavailable(id.clone()))?;
    let (reply, response) = oneshot::channel();
    commands
      .send(StageCommand::Snapshot(reply))
      .await
      .map_err(|_| PipelineError::StageUnavailable(id.clone()))?;
    response
      .await
      .map_err(|_| PipelineError::StageUnavailable(id.clone()))
  }

  /// Starts a [`HealthMonitor`] over this coordinator's registry.
  pub fn spawn_health_monitor(
    &self,
    config: HealthMonitorConfig,
  ) -> Result<HealthMonitorHandle, ConfigError> {
    Ok(
      HealthMonitor::new(self.registry.clone(), config)?
        .with_reporter(self.reporter.clone())
        .spawn(),
    )
  }
}

/// Output of a pipeline: transformed records, then a final snapshot.
///
/// A failed, killed or timed-out pipeline ends the stream with its error.
/// After cancellation, records still buffered are discarded.
#[derive(Debug)]
pub struct PipelineStream {
  id: PipelineId,
  inner: ReceiverStream<StreamResult>,
  control: PipelineControl,
}

impl PipelineStream {
  /// Id of the pipeline feeding this stream.
  pub fn id(&self) -> &PipelineId {
    &self.id
  }
}

impl Stream for PipelineStream {
  type Item = StreamResult;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    loop {
      match Pin::new(&mut this.inner).poll_next(cx) {
        Poll::Ready(Some(Ok(_))) if this.control.is_cancelled() => continue,
        other => return other,
      }
    }
  }
}
