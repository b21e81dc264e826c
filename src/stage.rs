//! # Aggregate Stage
//!
//! Consumer side of a pipeline: pulls chunks from the [`Producer`](crate::producer::Producer),
//! transforms and aggregates each record, and relays results into the bounded
//! output buffer the caller reads from.
//!
//! ## Demand window
//!
//! The stage keeps at most `max_demand` records outstanding upstream and asks
//! for more only once outstanding demand falls to `min_demand`. Every request
//! is additionally capped by the free space in the output buffer minus what is
//! already outstanding, so records in flight always fit downstream. The stage
//! therefore never asks for more than the caller is ready to take. While the
//! caller is not reading and nothing is outstanding, the stage waits for
//! buffer space instead of requesting.
//!
//! ## Record handling
//!
//! - A transform error or panic skips the record and increments
//!   `failed_count`; the batch continues.
//! - Grouping rejections are counted and reported as `group.rejected`; the
//!   record is still emitted.
//! - After each chunk the stage reports `batch.transformed`, publishes its
//!   counters to the registry and fires `buffer.near_full` when the output
//!   buffer reaches 90% of capacity (re-armed below 50%).
//!
//! When the source is exhausted the stage emits a final
//! [`StreamItem::Snapshot`] and completes. The aggregation state is owned by
//! the stage alone; [`StageCommand::Snapshot`] requests a read-only copy.

use crate::aggregate::{AggregationSnapshot, AggregationState};
use crate::config::PipelineConfig;
use crate::control::{PipelineControl, WorkerExit, WorkerResult};
use crate::error::{PipelineError, PipelineStage};
use crate::producer::{Chunk, ProducerHandle, ProducerMessage};
use crate::record::Record;
use crate::registry::{MetricsUpdate, PipelineId, PipelineStatus, Registry};
use crate::telemetry::{EventKind, NoopReporter, SharedReporter, TelemetryEvent};
use crate::transform::RecordTransform;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Item of a pipeline's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
  /// A transformed record.
  Record(Record),
  /// Aggregation state; the last item of a completed stream.
  Snapshot(AggregationSnapshot),
}

impl StreamItem {
  /// The record, if this item is one.
  pub fn into_record(self) -> Option<Record> {
    match self {
      StreamItem::Record(record) => Some(record),
      StreamItem::Snapshot(_) => None,
    }
  }

  /// The snapshot, if this item is one.
  pub fn into_snapshot(self) -> Option<AggregationSnapshot> {
    match self {
      StreamItem::Snapshot(snapshot) => Some(snapshot),
      StreamItem::Record(_) => None,
    }
  }
}

/// Result carried by the output buffer.
pub type StreamResult = Result<StreamItem, PipelineError>;

/// Request served by a running stage.
#[derive(Debug)]
pub enum StageCommand {
  /// Reply with a copy of the current aggregation state.
  Snapshot(oneshot::Sender<AggregationSnapshot>),
}

/// Outstanding upstream demand.
#[derive(Debug, Clone, Copy)]
struct DemandWindow {
  outstanding: usize,
  max_demand: usize,
  min_demand: usize,
}

impl DemandWindow {
  fn new(max_demand: usize, min_demand: usize) -> Self {
    Self {
      outstanding: 0,
      max_demand,
      min_demand,
    }
  }

  /// How many records to request given `free` output slots.
  fn grant(&self, free: usize) -> usize {
    if self.outstanding > self.min_demand {
      return 0;
    }
    self
      .max_demand
      .saturating_sub(self.outstanding)
      .min(free.saturating_sub(self.outstanding))
  }

  fn received(&mut self, n: usize) {
    self.outstanding = self.outstanding.saturating_sub(n);
  }
}

enum Delivery {
  Sent,
  Closed,
  Cancelled,
}

/// Transform/aggregate consumer of one pipeline.
pub struct AggregateStage {
  id: PipelineId,
  state: AggregationState,
  transform: Arc<dyn RecordTransform>,
  window: DemandWindow,
  buffer_size: usize,
  timeout: Option<Duration>,
  registry: Option<Registry>,
  reporter: SharedReporter,
  control: PipelineControl,
  near_full: bool,
}

impl AggregateStage {
  /// Creates a stage with the aggregations and bounds of `config`.
  pub fn new(
    id: PipelineId,
    config: &PipelineConfig,
    transform: Arc<dyn RecordTransform>,
    control: PipelineControl,
  ) -> Self {
    Self {
      id,
      state: AggregationState::new(config),
      transform,
      window: DemandWindow::new(config.max_demand, config.effective_min_demand()),
      buffer_size: config.buffer_size,
      timeout: config.timeout,
      registry: None,
      reporter: Arc::new(NoopReporter),
      control,
      near_full: false,
    }
  }

  /// Publishes counters to `registry`.
  pub fn with_registry(mut self, registry: Registry) -> Self {
    self.registry = Some(registry);
    self
  }

  /// Sets the telemetry reporter.
  pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
    self.reporter = reporter;
    self
  }

  /// Spawns the stage task. `output` must have capacity `buffer_size`.
  pub fn spawn(
    self,
    producer: ProducerHandle,
    upstream: mpsc::Receiver<ProducerMessage>,
    output: mpsc::Sender<StreamResult>,
    commands: mpsc::Receiver<StageCommand>,
  ) -> JoinHandle<WorkerResult> {
    tokio::spawn(self.run(producer, upstream, output, commands))
  }

  async fn run(
    mut self,
    producer: ProducerHandle,
    mut upstream: mpsc::Receiver<ProducerMessage>,
    output: mpsc::Sender<StreamResult>,
    mut commands: mpsc::Receiver<StageCommand>,
  ) -> WorkerResult {
    let watermark = self
      .window
      .max_demand
      .saturating_sub(self.window.min_demand)
      .clamp(1, output.max_capacity().min(self.buffer_size).max(1));

    loop {
      let grant = self.window.grant(output.capacity());
      if grant > 0 {
        if !producer.ask(grant).await {
          return self.upstream_closed(&output, &mut upstream);
        }
        self.window.outstanding += grant;
      } else if self.window.outstanding == 0 {
        // Nothing in flight and no room downstream: wait for the caller.
        tokio::select! {
          biased;
          _ = self.control.cancelled() => return Ok(self.on_cancel(&output, &mut upstream)),
          Some(command) = commands.recv() => self.serve(command),
          permits = output.reserve_many(watermark) => match permits {
            Ok(permits) => drop(permits),
            Err(_) => return Ok(WorkerExit::Cancelled),
          },
        }
        continue;
      }

      tokio::select! {
        biased;
        _ = self.control.cancelled() => return Ok(self.on_cancel(&output, &mut upstream)),
        Some(command) = commands.recv() => self.serve(command),
        message = upstream.recv() => match message {
          Some(ProducerMessage::Chunk(chunk)) => {
            self.window.received(chunk.records.len());
            match self.process(chunk, &output).await {
              Delivery::Sent => {}
              Delivery::Closed => {
                debug!(pipeline_id = %self.id, "output stream dropped by consumer");
                return Ok(WorkerExit::Cancelled);
              }
              Delivery::Cancelled => return Ok(self.on_cancel(&output, &mut upstream)),
            }
          }
          Some(ProducerMessage::Done) => {
            let snapshot = StreamItem::Snapshot(self.state.snapshot());
            return match self.deliver(&output, Ok(snapshot)).await {
              Delivery::Sent => {
                debug!(pipeline_id = %self.id, records_out = self.state.records_out(), "stage completed");
                Ok(WorkerExit::Completed)
              }
              Delivery::Closed => Ok(WorkerExit::Cancelled),
              Delivery::Cancelled => Ok(self.on_cancel(&output, &mut upstream)),
            };
          }
          Some(ProducerMessage::Failed(error)) => {
            self.deliver(&output, Err(error.clone())).await;
            return Err(error);
          }
          None => return self.upstream_closed(&output, &mut upstream),
        },
      }
    }
  }

  fn serve(&self, command: StageCommand) {
    match command {
      StageCommand::Snapshot(reply) => {
        let _ = reply.send(self.state.snapshot());
      }
    }
  }

  async fn process(&mut self, chunk: Chunk, output: &mpsc::Sender<StreamResult>) -> Delivery {
    let started = Instant::now();
    let records_in = chunk.records.len() as u64;
    let (mut records_out, mut failed_count, mut rejected_count) = (0u64, 0u64, 0u64);
    self.state.record_received(records_in);

    for (index, record) in chunk.records.into_iter().enumerate() {
      let transform = &self.transform;
      let outcome = catch_unwind(AssertUnwindSafe(|| transform.transform(record)));
      let mut record = match outcome {
        Ok(Ok(record)) => record,
        Ok(Err(error)) => {
          debug!(pipeline_id = %self.id, offset = chunk.offset + index as u64, %error, "record skipped");
          self.state.record_failed();
          failed_count += 1;
          continue;
        }
        Err(_) => {
          warn!(pipeline_id = %self.id, offset = chunk.offset + index as u64, "transform panicked; record skipped");
          self.state.record_failed();
          failed_count += 1;
          continue;
        }
      };

      for rejection in self.state.apply(&mut record) {
        rejected_count += 1;
        self.report(EventKind::GroupRejected {
          grouping: rejection.grouping,
          key: rejection.key,
          rejected_count: rejection.rejected_count,
        });
      }

      match self.deliver(output, Ok(StreamItem::Record(record))).await {
        Delivery::Sent => {
          self.state.record_emitted();
          records_out += 1;
        }
        other => return other,
      }
    }

    self.report(EventKind::BatchTransformed {
      records_in,
      records_out,
      failed_count,
      rejected_count,
      duration: started.elapsed(),
    });
    self.watch_buffer(output);
    self.publish_metrics();
    Delivery::Sent
  }

  async fn deliver(&self, output: &mpsc::Sender<StreamResult>, item: StreamResult) -> Delivery {
    tokio::select! {
      biased;
      _ = self.control.cancelled() => Delivery::Cancelled,
      sent = output.send(item) => match sent {
        Ok(()) => Delivery::Sent,
        Err(_) => Delivery::Closed,
      },
    }
  }

  fn watch_buffer(&mut self, output: &mpsc::Sender<StreamResult>) {
    let capacity = output.max_capacity();
    let buffered = capacity.saturating_sub(output.capacity());
    if !self.near_full && buffered * 10 >= capacity * 9 {
      self.near_full = true;
      self.report(EventKind::BufferNearFull { buffered, capacity });
    } else if self.near_full && buffered * 2 < capacity {
      self.near_full = false;
    }
  }

  fn publish_metrics(&self) {
    if let Some(registry) = &self.registry {
      let _ = registry.update_metrics(
        &self.id,
        MetricsUpdate::Stage {
          records_in: self.state.records_in(),
          records_out: self.state.records_out(),
          failed_count: self.state.failed_count(),
          rejected_count: self.state.rejected_count(),
        },
      );
    }
  }

  /// Unwinds after cancellation, pushing the termination reason into the
  /// stream when the pipeline failed, was killed or timed out and space allows.
  fn on_cancel(
    &self,
    output: &mpsc::Sender<StreamResult>,
    upstream: &mut mpsc::Receiver<ProducerMessage>,
  ) -> WorkerExit {
    self.publish_metrics();
    let mut failure = None;
    while let Ok(message) = upstream.try_recv() {
      if let ProducerMessage::Failed(error) = message {
        failure = Some(error);
      }
    }
    let reason = failure.or_else(|| self.termination_reason());
    if let Some(error) = reason {
      let _ = output.try_send(Err(error));
    }
    debug!(pipeline_id = %self.id, "stage cancelled");
    WorkerExit::Cancelled
  }

  fn termination_reason(&self) -> Option<PipelineError> {
    self.registry.as_ref().and_then(|registry| {
      let info = registry.lookup(&self.id).ok()?;
      match info.status {
        PipelineStatus::Killed => Some(PipelineError::Killed(
          info.failure_reason.unwrap_or_else(|| "memory pressure".to_string()),
        )),
        PipelineStatus::TimedOut => Some(PipelineError::Timeout(
          self.timeout.unwrap_or(info.elapsed),
        )),
        _ => None,
      }
    })
  }

  fn upstream_closed(
    &self,
    output: &mpsc::Sender<StreamResult>,
    upstream: &mut mpsc::Receiver<ProducerMessage>,
  ) -> WorkerResult {
    if self.control.is_cancelled() {
      return Ok(self.on_cancel(output, upstream));
    }
    Err(PipelineError::Crashed {
      stage: PipelineStage::Producer,
      reason: "producer stopped without signalling completion".to_string(),
    })
  }

  fn report(&self, kind: EventKind) {
    self
      .reporter
      .report(TelemetryEvent::new(self.id.clone(), kind));
  }
}
