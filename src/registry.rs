//! # Pipeline Registry
//!
//! Concurrent table of running and recently finished pipelines.
//!
//! The registry is the only state written by more than one actor: the
//! Producer and Aggregate Stage publish metrics, the Health Monitor pauses and
//! kills, the Coordinator cancels. Entries live in a [`DashMap`], so writes are
//! serialized per key while reads of other entries proceed concurrently.
//! Callers never hold an entry guard across an `.await`.
//!
//! ## Status reconciliation
//!
//! Both execution units of a pipeline are [`attach`](Registry::attach)ed after
//! spawning. A watcher task awaits each unit's `JoinHandle` and reconciles the
//! entry when it ends:
//!
//! - both units completed normally: `completed`
//! - a unit returned an error or panicked: `failed`, with the reason recorded,
//!   and the peer unit is cancelled
//! - a unit unwound early while the entry was still active (the caller dropped
//!   the output stream): `cancelled`
//!
//! Terminal statuses are never overwritten. Status changes are published on a
//! per-entry `watch` channel; [`Registry::wait_for_terminal`] awaits them.
//!
//! ## Example
//!
//! ```rust
//! use streamgate::control::PipelineControl;
//! use streamgate::registry::{PipelineId, PipelineStatus, Registration, Registry};
//!
//! let registry = Registry::new();
//! let id = PipelineId::generate();
//! registry
//!   .register(id.clone(), Registration::new(PipelineControl::new(), 1_000_000))
//!   .unwrap();
//! assert_eq!(registry.lookup(&id).unwrap().status, PipelineStatus::Running);
//! assert_eq!(registry.list_active().len(), 1);
//! ```

use crate::control::{PipelineControl, WorkerExit, WorkerResult};
use crate::error::{PipelineError, PipelineStage};
use crate::stage::StageCommand;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Unique identifier of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
  /// Generates a random (v4 UUID) id.
  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4().to_string())
  }

  /// The id as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for PipelineId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for PipelineId {
  fn from(id: &str) -> Self {
    Self(id.to_string())
  }
}

impl From<String> for PipelineId {
  fn from(id: String) -> Self {
    Self(id)
  }
}

/// Lifecycle status of a pipeline.
///
/// `running -> (paused <-> running) -> completed | failed | killed | cancelled | timed_out`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
  /// Producing and aggregating.
  Running,
  /// Production withheld by the circuit breaker or the Health Monitor.
  Paused,
  /// Both units ran to the end of the source.
  Completed,
  /// A unit failed or crashed.
  Failed,
  /// Terminated by the Health Monitor.
  Killed,
  /// Cancelled by the caller.
  Cancelled,
  /// The configured timeout elapsed.
  TimedOut,
}

impl PipelineStatus {
  /// No further transition occurs from a terminal status.
  pub fn is_terminal(&self) -> bool {
    !self.is_active()
  }

  /// Running or paused.
  pub fn is_active(&self) -> bool {
    matches!(self, PipelineStatus::Running | PipelineStatus::Paused)
  }

  /// Stable lowercase name.
  pub fn as_str(&self) -> &'static str {
    match self {
      PipelineStatus::Running => "running",
      PipelineStatus::Paused => "paused",
      PipelineStatus::Completed => "completed",
      PipelineStatus::Failed => "failed",
      PipelineStatus::Killed => "killed",
      PipelineStatus::Cancelled => "cancelled",
      PipelineStatus::TimedOut => "timed_out",
    }
  }
}

impl fmt::Display for PipelineStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Liveness of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
  /// Registered but not yet attached.
  Pending,
  /// Task is running.
  Alive,
  /// Task returned without error, or was aborted after termination.
  Finished,
  /// Task returned an error or panicked.
  Crashed,
}

/// Metric published by an execution unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricsUpdate {
  /// The Producer completed one fetch round of `records` records.
  FetchRound {
    /// Records in the fetched page.
    records: u64,
  },
  /// Absolute Aggregate Stage counters.
  Stage {
    /// Records received from upstream.
    records_in: u64,
    /// Records emitted downstream.
    records_out: u64,
    /// Transform failures.
    failed_count: u64,
    /// Group rejections.
    rejected_count: u64,
  },
  /// Latest memory sample in bytes.
  Memory(u64),
}

/// Everything the registry needs to create an entry.
#[derive(Debug, Clone)]
pub struct Registration {
  /// Signals shared by the pipeline's units.
  pub control: PipelineControl,
  /// Memory limit the Health Monitor measures usage against.
  pub memory_limit: u64,
  /// Total source records, when known.
  pub total_records: Option<u64>,
  /// Caller labels.
  pub metadata: BTreeMap<String, String>,
  /// Command channel of the Aggregate Stage.
  pub stage_commands: Option<mpsc::Sender<StageCommand>>,
}

impl Registration {
  /// Creates a registration with no metadata, total or stage channel.
  pub fn new(control: PipelineControl, memory_limit: u64) -> Self {
    Self {
      control,
      memory_limit,
      total_records: None,
      metadata: BTreeMap::new(),
      stage_commands: None,
    }
  }

  /// Sets the known source total.
  pub fn with_total_records(mut self, total: Option<u64>) -> Self {
    self.total_records = total;
    self
  }

  /// Sets the metadata labels.
  pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
    self.metadata = metadata;
    self
  }

  /// Sets the stage command channel.
  pub fn with_stage_commands(mut self, commands: mpsc::Sender<StageCommand>) -> Self {
    self.stage_commands = Some(commands);
    self
  }
}

/// Read-only copy of a registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineInfo {
  /// Pipeline id.
  pub id: PipelineId,
  /// Current status.
  pub status: PipelineStatus,
  /// Wall-clock start time.
  pub started_at: DateTime<Utc>,
  /// Time since start, frozen once terminal.
  pub elapsed: Duration,
  /// Records consumed by the Aggregate Stage.
  pub records_processed: u64,
  /// Records emitted to the output stream.
  pub records_emitted: u64,
  /// Records fetched by the Producer.
  pub records_fetched: u64,
  /// Completed fetch rounds.
  pub fetch_rounds: u64,
  /// Transform failures.
  pub failed_count: u64,
  /// Group rejections.
  pub rejected_count: u64,
  /// Latest memory sample in bytes.
  pub memory_usage: u64,
  /// Configured memory limit in bytes.
  pub memory_limit: u64,
  /// Total source records, when known.
  pub total_records: Option<u64>,
  /// Why the pipeline ended, for failed/killed/timed-out pipelines.
  pub failure_reason: Option<String>,
  /// Caller labels.
  pub metadata: BTreeMap<String, String>,
  /// Producer liveness.
  pub producer: UnitStatus,
  /// Aggregate Stage liveness.
  pub aggregator: UnitStatus,
}

impl PipelineInfo {
  /// Fraction of the source processed, in `[0, 1]`.
  ///
  /// `None` while the total is unknown; `1.0` once completed.
  pub fn progress(&self) -> Option<f64> {
    if self.status == PipelineStatus::Completed {
      return Some(1.0);
    }
    match self.total_records {
      Some(0) => Some(0.0),
      Some(total) => Some((self.records_processed as f64 / total as f64).min(1.0)),
      None => None,
    }
  }

  /// Records processed per second since start.
  pub fn throughput(&self) -> f64 {
    let seconds = self.elapsed.as_secs_f64();
    if seconds <= 0.0 {
      0.0
    } else {
      self.records_processed as f64 / seconds
    }
  }

  /// `memory_usage / memory_limit`.
  pub fn memory_ratio(&self) -> f64 {
    if self.memory_limit == 0 {
      0.0
    } else {
      self.memory_usage as f64 / self.memory_limit as f64
    }
  }

  /// Liveness of one unit.
  pub fn unit(&self, stage: PipelineStage) -> UnitStatus {
    match stage {
      PipelineStage::Producer => self.producer,
      PipelineStage::Aggregator => self.aggregator,
    }
  }
}

#[derive(Debug)]
struct Unit {
  status: UnitStatus,
  completed: bool,
  abort: Option<AbortHandle>,
}

impl Unit {
  fn pending() -> Self {
    Self {
      status: UnitStatus::Pending,
      completed: false,
      abort: None,
    }
  }
}

#[derive(Debug)]
struct Entry {
  control: PipelineControl,
  status: watch::Sender<PipelineStatus>,
  started_at: DateTime<Utc>,
  started: Instant,
  finished: Option<Instant>,
  records_processed: u64,
  records_emitted: u64,
  records_fetched: u64,
  fetch_rounds: u64,
  failed_count: u64,
  rejected_count: u64,
  memory_usage: u64,
  memory_limit: u64,
  total_records: Option<u64>,
  failure_reason: Option<String>,
  metadata: BTreeMap<String, String>,
  producer: Unit,
  aggregator: Unit,
  stage_commands: Option<mpsc::Sender<StageCommand>>,
}

impl Entry {
  fn status(&self) -> PipelineStatus {
    *self.status.borrow()
  }

  fn unit_mut(&mut self, stage: PipelineStage) -> &mut Unit {
    match stage {
      PipelineStage::Producer => &mut self.producer,
      PipelineStage::Aggregator => &mut self.aggregator,
    }
  }

  /// Applies a transition if allowed. Returns true when the status changed.
  fn transition(&mut self, next: PipelineStatus, reason: Option<String>) -> bool {
    let current = self.status();
    if current.is_terminal() || current == next {
      return false;
    }
    if next.is_terminal() {
      self.finished = Some(Instant::now());
      if reason.is_some() {
        self.failure_reason = reason;
      }
      // Snapshots are served only while the entry is active.
      self.stage_commands = None;
    }
    self.status.send_replace(next);
    true
  }

  fn info(&self, id: &PipelineId) -> PipelineInfo {
    let elapsed = match self.finished {
      Some(finished) => finished.saturating_duration_since(self.started),
      None => self.started.elapsed(),
    };
    PipelineInfo {
      id: id.clone(),
      status: self.status(),
      started_at: self.started_at,
      elapsed,
      records_processed: self.records_processed,
      records_emitted: self.records_emitted,
      records_fetched: self.records_fetched,
      fetch_rounds: self.fetch_rounds,
      failed_count: self.failed_count,
      rejected_count: self.rejected_count,
      memory_usage: self.memory_usage,
      memory_limit: self.memory_limit,
      total_records: self.total_records,
      failure_reason: self.failure_reason.clone(),
      metadata: self.metadata.clone(),
      producer: self.producer.status,
      aggregator: self.aggregator.status,
    }
  }
}

/// Shared handle to the pipeline table. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct Registry {
  entries: Arc<DashMap<PipelineId, Entry>>,
}

impl Registry {
  /// Creates an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds a `running` entry. Both units start out `pending`.
  pub fn register(&self, id: PipelineId, registration: Registration) -> Result<(), PipelineError> {
    use dashmap::mapref::entry::Entry as MapEntry;
    match self.entries.entry(id.clone()) {
      MapEntry::Occupied(_) => Err(PipelineError::Duplicate(id)),
      MapEntry::Vacant(slot) => {
        let (status, _) = watch::channel(PipelineStatus::Running);
        slot.insert(Entry {
          control: registration.control,
          status,
          started_at: Utc::now(),
          started: Instant::now(),
          finished: None,
          records_processed: 0,
          records_emitted: 0,
          records_fetched: 0,
          fetch_rounds: 0,
          failed_count: 0,
          rejected_count: 0,
          memory_usage: 0,
          memory_limit: registration.memory_limit,
          total_records: registration.total_records,
          failure_reason: None,
          metadata: registration.metadata,
          producer: Unit::pending(),
          aggregator: Unit::pending(),
          stage_commands: registration.stage_commands,
        });
        debug!(pipeline_id = %id, "pipeline registered");
        Ok(())
      }
    }
  }

  /// Hands an execution unit's task to the registry for supervision.
  ///
  /// A watcher task reconciles the entry's status when the unit ends.
  pub fn attach(
    &self,
    id: &PipelineId,
    stage: PipelineStage,
    handle: JoinHandle<WorkerResult>,
  ) -> Result<(), PipelineError> {
    {
      let mut entry = self
        .entries
        .get_mut(id)
        .ok_or_else(|| PipelineError::NotFound(id.clone()))?;
      let unit = entry.unit_mut(stage);
      unit.status = UnitStatus::Alive;
      unit.abort = Some(handle.abort_handle());
    }
    let registry = self.clone();
    let id = id.clone();
    tokio::spawn(async move {
      let outcome = handle.await;
      registry.unit_terminated(&id, stage, outcome);
    });
    Ok(())
  }

  fn unit_terminated(
    &self,
    id: &PipelineId,
    stage: PipelineStage,
    outcome: Result<WorkerResult, JoinError>,
  ) {
    let Some(mut entry) = self.entries.get_mut(id) else {
      return;
    };
    let control = entry.control.clone();
    let mut cancel_peer = false;
    match outcome {
      Ok(Ok(exit)) => {
        let unit = entry.unit_mut(stage);
        unit.status = UnitStatus::Finished;
        unit.completed = exit == WorkerExit::Completed;
        if entry.producer.completed && entry.aggregator.completed {
          if entry.transition(PipelineStatus::Completed, None) {
            info!(pipeline_id = %id, "pipeline completed");
          }
        } else if exit == WorkerExit::Cancelled && entry.transition(PipelineStatus::Cancelled, None) {
          info!(pipeline_id = %id, %stage, "pipeline cancelled by its consumer");
          cancel_peer = true;
        }
      }
      Ok(Err(error)) => {
        entry.unit_mut(stage).status = UnitStatus::Crashed;
        if entry.transition(PipelineStatus::Failed, Some(error.to_string())) {
          warn!(pipeline_id = %id, %stage, %error, "pipeline failed");
        }
        cancel_peer = true;
      }
      Err(join_error) if join_error.is_cancelled() => {
        entry.unit_mut(stage).status = UnitStatus::Finished;
        let reason = format!("{stage} aborted");
        if entry.transition(PipelineStatus::Failed, Some(reason)) {
          warn!(pipeline_id = %id, %stage, "execution unit aborted");
        }
        cancel_peer = true;
      }
      Err(join_error) => {
        entry.unit_mut(stage).status = UnitStatus::Crashed;
        let error = PipelineError::Crashed {
          stage,
          reason: panic_message(join_error),
        };
        if entry.transition(PipelineStatus::Failed, Some(error.to_string())) {
          warn!(pipeline_id = %id, %stage, %error, "execution unit crashed");
        }
        cancel_peer = true;
      }
    }
    drop(entry);
    if cancel_peer {
      control.cancel();
    }
  }

  /// Moves an entry to `status`, recording `reason` for terminal statuses.
  ///
  /// Returns `Ok(false)` when the entry is already terminal or already in
  /// `status`; terminal statuses are never overwritten.
  pub fn update_status(
    &self,
    id: &PipelineId,
    status: PipelineStatus,
    reason: Option<String>,
  ) -> Result<bool, PipelineError> {
    let mut entry = self
      .entries
      .get_mut(id)
      .ok_or_else(|| PipelineError::NotFound(id.clone()))?;
    let changed = entry.transition(status, reason);
    if changed {
      debug!(pipeline_id = %id, %status, "pipeline status changed");
    }
    Ok(changed)
  }

  /// Records a metric published by an execution unit.
  pub fn update_metrics(&self, id: &PipelineId, update: MetricsUpdate) -> Result<(), PipelineError> {
    let mut entry = self
      .entries
      .get_mut(id)
      .ok_or_else(|| PipelineError::NotFound(id.clone()))?;
    match update {
      MetricsUpdate::FetchRound { records } => {
        entry.fetch_rounds += 1;
        entry.records_fetched += records;
      }
      MetricsUpdate::Stage {
        records_in,
        records_out,
        failed_count,
        rejected_count,
      } => {
        entry.records_processed = records_in;
        entry.records_emitted = records_out;
        entry.failed_count = failed_count;
        entry.rejected_count = rejected_count;
      }
      MetricsUpdate::Memory(usage) => entry.memory_usage = usage,
    }
    Ok(())
  }

  /// Snapshot of one entry.
  pub fn lookup(&self, id: &PipelineId) -> Result<PipelineInfo, PipelineError> {
    self
      .entries
      .get(id)
      .map(|entry| entry.info(id))
      .ok_or_else(|| PipelineError::NotFound(id.clone()))
  }

  /// Current status of one entry.
  pub fn status(&self, id: &PipelineId) -> Option<PipelineStatus> {
    self.entries.get(id).map(|entry| entry.status())
  }

  /// Entries that are running or paused.
  pub fn list_active(&self) -> Vec<PipelineInfo> {
    self.collect(|status| status.is_active())
  }

  /// Entries with the given status.
  pub fn list_by_status(&self, status: PipelineStatus) -> Vec<PipelineInfo> {
    self.collect(|s| s == status)
  }

  /// Every entry, terminal ones included until pruned.
  pub fn list_all(&self) -> Vec<PipelineInfo> {
    self.collect(|_| true)
  }

  fn collect(&self, filter: impl Fn(PipelineStatus) -> bool) -> Vec<PipelineInfo> {
    let mut infos: Vec<PipelineInfo> = self
      .entries
      .iter()
      .filter(|entry| filter(entry.value().status()))
      .map(|entry| entry.value().info(entry.key()))
      .collect();
    infos.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
    infos
  }

  /// Watches an entry's status.
  pub fn subscribe(&self, id: &PipelineId) -> Result<watch::Receiver<PipelineStatus>, PipelineError> {
    self
      .entries
      .get(id)
      .map(|entry| entry.status.subscribe())
      .ok_or_else(|| PipelineError::NotFound(id.clone()))
  }

  /// Resolves with the entry's terminal status.
  pub async fn wait_for_terminal(&self, id: &PipelineId) -> Result<PipelineStatus, PipelineError> {
    let mut rx = self.subscribe(id)?;
    let result = rx.wait_for(|status| status.is_terminal()).await.map(|status| *status);
    match result {
      Ok(status) => Ok(status),
      // The entry was pruned; it was terminal by then.
      Err(_) => {
        let last = *rx.borrow();
        if last.is_terminal() {
          Ok(last)
        } else {
          Err(PipelineError::NotFound(id.clone()))
        }
      }
    }
  }

  /// Control handle of an entry.
  pub fn control(&self, id: &PipelineId) -> Option<PipelineControl> {
    self.entries.get(id).map(|entry| entry.control.clone())
  }

  /// Stage command channel of an active entry.
  pub fn stage_commands(&self, id: &PipelineId) -> Option<mpsc::Sender<StageCommand>> {
    self.entries.get(id).and_then(|entry| entry.stage_commands.clone())
  }

  /// Asks the Producer to withhold production and marks the entry `paused`.
  pub fn pause(&self, id: &PipelineId) -> Result<bool, PipelineError> {
    let mut entry = self
      .entries
      .get_mut(id)
      .ok_or_else(|| PipelineError::NotFound(id.clone()))?;
    if entry.status().is_terminal() {
      return Ok(false);
    }
    entry.control.pause();
    Ok(entry.transition(PipelineStatus::Paused, None))
  }

  /// Lifts a pause set by [`pause`](Self::pause).
  pub fn resume(&self, id: &PipelineId) -> Result<bool, PipelineError> {
    let mut entry = self
      .entries
      .get_mut(id)
      .ok_or_else(|| PipelineError::NotFound(id.clone()))?;
    if entry.status().is_terminal() || !entry.control.resume() {
      return Ok(false);
    }
    entry.transition(PipelineStatus::Running, None);
    Ok(true)
  }

  /// Moves an active entry to a terminal `status`, signals both units to stop
  /// and aborts them if they are still running after `grace`.
  ///
  /// Returns `Ok(false)` if the entry was already terminal.
  pub fn terminate(
    &self,
    id: &PipelineId,
    status: PipelineStatus,
    reason: Option<String>,
    grace: Duration,
  ) -> Result<bool, PipelineError> {
    let (control, aborts) = {
      let mut entry = self
        .entries
        .get_mut(id)
        .ok_or_else(|| PipelineError::NotFound(id.clone()))?;
      if !entry.transition(status, reason) {
        return Ok(false);
      }
      let aborts: Vec<AbortHandle> = [&entry.producer, &entry.aggregator]
        .into_iter()
        .filter(|unit| unit.status == UnitStatus::Alive)
        .filter_map(|unit| unit.abort.clone())
        .collect();
      (entry.control.clone(), aborts)
    };
    info!(pipeline_id = %id, %status, "terminating pipeline");
    control.cancel();
    if !aborts.is_empty() {
      match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
          runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            for abort in aborts {
              abort.abort();
            }
          });
        }
        Err(_) => aborts.iter().for_each(AbortHandle::abort),
      }
    }
    Ok(true)
  }

  /// Removes terminal entries that ended at least `retention` ago.
  pub fn prune_terminal(&self, retention: Duration) -> usize {
    let before = self.entries.len();
    self.entries.retain(|_, entry| match entry.finished {
      Some(finished) => finished.elapsed() < retention,
      None => true,
    });
    before.saturating_sub(self.entries.len())
  }

  /// Removes `id` if it has reached a terminal status. Returns whether an
  /// entry was removed.
  pub fn remove_terminal(&self, id: &PipelineId) -> bool {
    self
      .entries
      .remove_if(id, |_, entry| entry.finished.is_some())
      .is_some()
  }

  /// Number of entries.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// True when no entries exist.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

fn panic_message(error: JoinError) -> String {
  match error.try_into_panic() {
    Ok(payload) => match payload.downcast::<String>() {
      Ok(message) => *message,
      Err(payload) => payload
        .downcast::<&'static str>()
        .map(|message| (*message).to_string())
        .unwrap_or_else(|_| "panic".to_string()),
    },
    Err(error) => error.to_string(),
  }
}
