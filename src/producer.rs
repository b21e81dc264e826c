//! # Producer
//!
//! Demand-driven reader that pulls pages from a [`SourceAdapter`] and hands
//! them to the Aggregate Stage.
//!
//! The Producer owns its read position exclusively. It runs as one tokio task
//! and only ever fetches when the stage has outstanding demand:
//!
//! 1. Wait for demand (a count of records) on the demand channel. Leftover
//!    demand carries over between rounds.
//! 2. Wait while the pipeline is paused by the Health Monitor.
//! 3. Sample memory and consult the [`MemoryCircuitBreaker`]. An open breaker
//!    withholds production and re-samples every `memory_check_interval`; a
//!    degraded breaker halves the chunk size.
//! 4. Fetch `min(demand, chunk_size)` records at the current offset, retrying
//!    transient failures with exponential backoff.
//! 5. Hand the chunk over on a capacity-one channel, which blocks until the
//!    stage takes it.
//!
//! An empty page ends production with [`ProducerMessage::Done`], even when the
//! source reported a smaller total up front. A permanent failure sends
//! [`ProducerMessage::Failed`] downstream and ends the task with the error.
//! Every wait is raced against the pipeline's cancellation token.

use crate::config::PipelineConfig;
use crate::control::{PipelineControl, WorkerExit, WorkerResult};
use crate::error::{PipelineError, SourceError};
use crate::memory::{BreakerState, MemoryCircuitBreaker, MemoryProbe, ProcessMemoryProbe};
use crate::record::Record;
use crate::registry::{MetricsUpdate, PipelineId, PipelineStatus, Registry};
use crate::retry::RetryPolicy;
use crate::source::SourceAdapter;
use crate::telemetry::{EventKind, NoopReporter, SharedReporter, TelemetryEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the demand channel. The Producer drains it on every round.
const DEMAND_CHANNEL_CAPACITY: usize = 16;

/// Records fetched in one round, starting at `offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
  /// Source offset of the first record.
  pub offset: u64,
  /// Records in source order.
  pub records: Vec<Record>,
}

/// Message from the Producer to the Aggregate Stage.
#[derive(Debug, Clone)]
pub enum ProducerMessage {
  /// A page of records.
  Chunk(Chunk),
  /// The source is exhausted.
  Done,
  /// Production failed permanently.
  Failed(PipelineError),
}

/// Demand side of a running Producer.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
  demand: mpsc::Sender<usize>,
}

impl ProducerHandle {
  /// Requests `n` more records. Returns false once the Producer is gone.
  pub async fn ask(&self, n: usize) -> bool {
    n == 0 || self.demand.send(n).await.is_ok()
  }
}

#[derive(Debug)]
struct ProducerState {
  offset: u64,
  pending: usize,
  produced: u64,
  breaker: BreakerState,
  past_count: bool,
}

/// Demand-driven source reader.
pub struct Producer {
  id: PipelineId,
  source: Arc<dyn SourceAdapter>,
  chunk_size: usize,
  breaker: MemoryCircuitBreaker,
  memory_check_interval: Duration,
  retry: RetryPolicy,
  fetch_timeout: Option<Duration>,
  total_records: Option<u64>,
  probe: Arc<dyn MemoryProbe>,
  registry: Option<Registry>,
  reporter: SharedReporter,
  control: PipelineControl,
}

impl Producer {
  /// Creates a Producer for `source` with the bounds of `config`.
  pub fn new(
    id: PipelineId,
    config: &PipelineConfig,
    source: Arc<dyn SourceAdapter>,
    control: PipelineControl,
  ) -> Self {
    Self {
      id,
      source,
      chunk_size: config.chunk_size,
      breaker: MemoryCircuitBreaker::new(config.memory_limit, config.degraded_memory_ratio),
      memory_check_interval: config.memory_check_interval,
      retry: RetryPolicy::from_config(config),
      fetch_timeout: config.fetch_timeout,
      total_records: None,
      probe: Arc::new(ProcessMemoryProbe::new()),
      registry: None,
      reporter: Arc::new(NoopReporter),
      control,
    }
  }

  /// Publishes status and metrics to `registry`.
  pub fn with_registry(mut self, registry: Registry) -> Self {
    self.registry = Some(registry);
    self
  }

  /// Sets the telemetry reporter.
  pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
    self.reporter = reporter;
    self
  }

  /// Sets the memory probe consulted before each fetch.
  pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
    self.probe = probe;
    self
  }

  /// Records the source's reported total. The count is advisory: the stream
  /// still ends only on an empty page, so a count that went stale between
  /// `count()` and the last fetch loses nothing.
  pub fn with_total_records(mut self, total: Option<u64>) -> Self {
    self.total_records = total;
    self
  }

  /// Spawns the Producer task.
  ///
  /// Returns the demand handle, the receiving end of the chunk hand-off and
  /// the task handle.
  pub fn spawn(self) -> (ProducerHandle, mpsc::Receiver<ProducerMessage>, JoinHandle<WorkerResult>) {
    let (demand_tx, demand_rx) = mpsc::channel(DEMAND_CHANNEL_CAPACITY);
    let (chunk_tx, chunk_rx) = mpsc::channel(1);
    let handle = tokio::spawn(self.run(demand_rx, chunk_tx));
    (ProducerHandle { demand: demand_tx }, chunk_rx, handle)
  }

  async fn run(
    self,
    mut demand: mpsc::Receiver<usize>,
    chunks: mpsc::Sender<ProducerMessage>,
  ) -> WorkerResult {
    let started = Instant::now();
    self.report(EventKind::PipelineStart);
    debug!(pipeline_id = %self.id, chunk_size = self.chunk_size, "producer started");

    let mut state = ProducerState {
      offset: 0,
      pending: 0,
      produced: 0,
      breaker: BreakerState::Closed,
      past_count: false,
    };
    let result = self.produce(&mut state, &mut demand, &chunks).await;
    match &result {
      Ok(exit) => {
        debug!(pipeline_id = %self.id, ?exit, produced = state.produced, "producer stopped");
        self.report(EventKind::PipelineStop {
          elapsed: started.elapsed(),
          records: state.produced,
        });
      }
      Err(error) => {
        warn!(pipeline_id = %self.id, %error, offset = state.offset, "producer failed");
        self.report(EventKind::PipelineError {
          elapsed: started.elapsed(),
          reason: error.to_string(),
        });
        self
          .send(&chunks, ProducerMessage::Failed(error.clone()))
          .await;
      }
    }
    result
  }

  async fn produce(
    &self,
    state: &mut ProducerState,
    demand: &mut mpsc::Receiver<usize>,
    chunks: &mpsc::Sender<ProducerMessage>,
  ) -> WorkerResult {
    loop {
      if state.pending == 0 {
        tokio::select! {
          biased;
          _ = self.control.cancelled() => return Ok(WorkerExit::Cancelled),
          requested = demand.recv() => match requested {
            Some(n) => state.pending += n,
            None => return Ok(WorkerExit::Cancelled),
          },
        }
      }
      while let Ok(n) = demand.try_recv() {
        state.pending += n;
      }
      if state.pending == 0 {
        continue;
      }

      if !self.wait_while_paused().await {
        return Ok(WorkerExit::Cancelled);
      }
      let Some(chunk_limit) = self.admit(state).await else {
        return Ok(WorkerExit::Cancelled);
      };

      let limit = state.pending.min(chunk_limit);
      let Some(mut records) = self.fetch_with_retry(state.offset, limit).await? else {
        return Ok(WorkerExit::Cancelled);
      };
      if records.is_empty() {
        return Ok(self.finish(chunks).await);
      }
      // Never hand over more than was asked for, even if the source over-delivers.
      records.truncate(limit);

      let fetched = records.len();
      if let Some(total) = self.total_records
        && !state.past_count
        && state.offset + fetched as u64 > total
      {
        state.past_count = true;
        warn!(pipeline_id = %self.id, total, offset = state.offset, "source returned records past its reported count");
      }
      let chunk = Chunk {
        offset: state.offset,
        records,
      };
      state.offset += fetched as u64;
      state.pending -= fetched;
      state.produced += fetched as u64;
      self.update_metrics(MetricsUpdate::FetchRound {
        records: fetched as u64,
      });
      debug!(pipeline_id = %self.id, offset = chunk.offset, fetched, pending = state.pending, "chunk fetched");

      if !self.send(chunks, ProducerMessage::Chunk(chunk)).await {
        return Ok(WorkerExit::Cancelled);
      }
    }
  }

  async fn finish(&self, chunks: &mpsc::Sender<ProducerMessage>) -> WorkerExit {
    if self.send(chunks, ProducerMessage::Done).await {
      WorkerExit::Completed
    } else {
      WorkerExit::Cancelled
    }
  }

  /// Blocks while the pause flag is set, sampling memory meanwhile so the
  /// Health Monitor can observe recovery. Returns false on cancellation.
  async fn wait_while_paused(&self) -> bool {
    let mut pause = self.control.subscribe_pause();
    loop {
      if !*pause.borrow_and_update() {
        return true;
      }
      tokio::select! {
        biased;
        _ = self.control.cancelled() => return false,
        changed = pause.changed() => {
          if changed.is_err() {
            return false;
          }
        }
        _ = tokio::time::sleep(self.memory_check_interval) => {
          self.sample_memory();
        }
      }
    }
  }

  fn sample_memory(&self) -> u64 {
    let usage = self.probe.sample();
    self.update_metrics(MetricsUpdate::Memory(usage));
    usage
  }

  /// Runs the circuit breaker until it admits a fetch. Returns the chunk size
  /// to use, or `None` on cancellation.
  async fn admit(&self, state: &mut ProducerState) -> Option<usize> {
    loop {
      let usage = self.sample_memory();
      let next = self.breaker.evaluate(usage);
      if next != state.breaker {
        self.on_breaker_transition(state.breaker, next, usage);
        state.breaker = next;
      }
      if next != BreakerState::Open {
        return Some(self.breaker.effective_chunk_size(next, self.chunk_size));
      }
      tokio::select! {
        biased;
        _ = self.control.cancelled() => return None,
        _ = tokio::time::sleep(self.memory_check_interval) => {}
      }
    }
  }

  fn on_breaker_transition(&self, from: BreakerState, to: BreakerState, usage: u64) {
    self.report(EventKind::CircuitTransition {
      from,
      to,
      usage,
      limit: self.breaker.limit(),
    });
    let Some(registry) = &self.registry else {
      return;
    };
    if to == BreakerState::Open {
      let _ = registry.update_status(&self.id, PipelineStatus::Paused, None);
    } else if from == BreakerState::Open && !self.control.is_paused() {
      let _ = registry.update_status(&self.id, PipelineStatus::Running, None);
    }
  }

  /// Fetches one page, retrying transient failures. `Ok(None)` means the
  /// pipeline was cancelled while fetching or backing off.
  async fn fetch_with_retry(
    &self,
    offset: u64,
    limit: usize,
  ) -> Result<Option<Vec<Record>>, PipelineError> {
    let mut retries = 0;
    loop {
      let result = tokio::select! {
        biased;
        _ = self.control.cancelled() => return Ok(None),
        result = self.fetch_once(offset, limit) => result,
      };
      match result {
        Ok(records) => return Ok(Some(records)),
        Err(error) if error.is_transient() && self.retry.should_retry(retries) => {
          retries += 1;
          let delay = self.retry.delay(retries);
          warn!(pipeline_id = %self.id, offset, attempt = retries, ?delay, %error, "transient fetch failure");
          self.report(EventKind::FetchRetry {
            attempt: retries,
            delay,
            reason: error.to_string(),
          });
          tokio::select! {
            biased;
            _ = self.control.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
          }
        }
        Err(error) => {
          return Err(PipelineError::SourceFetch {
            source: error,
            attempts: retries + 1,
          });
        }
      }
    }
  }

  async fn fetch_once(&self, offset: u64, limit: usize) -> Result<Vec<Record>, SourceError> {
    match self.fetch_timeout {
      Some(timeout) => tokio::time::timeout(timeout, self.source.fetch(offset, limit))
        .await
        .unwrap_or_else(|_| Err(SourceError::transient(format!("fetch timed out after {timeout:?}")))),
      None => self.source.fetch(offset, limit).await,
    }
  }

  async fn send(&self, chunks: &mpsc::Sender<ProducerMessage>, message: ProducerMessage) -> bool {
    tokio::select! {
      biased;
      _ = self.control.cancelled() => false,
      sent = chunks.send(message) => sent.is_ok(),
    }
  }

  fn update_metrics(&self, update: MetricsUpdate) {
    if let Some(registry) = &self.registry {
      let _ = registry.update_metrics(&self.id, update);
    }
  }

  fn report(&self, kind: EventKind) {
    self
      .reporter
      .report(TelemetryEvent::new(self.id.clone(), kind));
  }
}
