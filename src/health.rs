//! # Health Monitor
//!
//! Periodic supervisor shared by every pipeline of a registry.
//!
//! Each tick walks the active registry entries and:
//!
//! - **Liveness**: flags entries whose execution units crashed or stopped
//!   while the entry is still active (`liveness.lost`). Status reconciliation
//!   itself is the registry's job; this is for alerting.
//! - **Memory**: computes `usage / limit`. At `warning_ratio` it emits
//!   `memory.warning` only. At `critical_ratio` it emits `memory.critical` and
//!   pauses the pipeline; if usage is still critical after `grace_period` the
//!   pipeline is terminated as `killed`. Dropping below `critical_ratio`
//!   resumes a pipeline the monitor paused.
//! - **Throughput**: emits `records_processed / elapsed` per pipeline.
//!
//! It then emits one `health.check` event and prunes terminal entries older
//! than `retention`.
//!
//! [`HealthMonitor::check_at`] runs one tick synchronously for a given
//! instant; [`HealthMonitor::spawn`] runs ticks on an interval until stopped.

use crate::error::{ConfigError, PipelineStage};
use crate::registry::{PipelineId, PipelineInfo, PipelineStatus, Registry, UnitStatus};
use crate::telemetry::{EventKind, SharedReporter, TelemetryEvent, TracingReporter};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Health Monitor settings.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
  /// Time between ticks.
  pub interval: Duration,
  /// Usage ratio that triggers a warning.
  pub warning_ratio: f64,
  /// Usage ratio that triggers pause-then-kill.
  pub critical_ratio: f64,
  /// How long a pipeline may stay critical while paused before it is killed.
  pub grace_period: Duration,
  /// How long killed units get to unwind before they are aborted.
  pub kill_grace: Duration,
  /// How long terminal entries stay readable; `None` keeps them forever.
  pub retention: Option<Duration>,
}

impl Default for HealthMonitorConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(1),
      warning_ratio: 0.8,
      critical_ratio: 0.95,
      grace_period: Duration::from_secs(5),
      kill_grace: Duration::from_secs(1),
      retention: Some(Duration::from_secs(30)),
    }
  }
}

impl HealthMonitorConfig {
  /// Sets the tick interval.
  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// Sets the warning and critical ratios.
  pub fn with_thresholds(mut self, warning_ratio: f64, critical_ratio: f64) -> Self {
    self.warning_ratio = warning_ratio;
    self.critical_ratio = critical_ratio;
    self
  }

  /// Sets the grace period before a critical pipeline is killed.
  pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
    self.grace_period = grace_period;
    self
  }

  /// Sets the unwind time granted to killed units.
  pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
    self.kill_grace = kill_grace;
    self
  }

  /// Sets the terminal entry retention.
  pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
    self.retention = retention;
    self
  }

  /// Checks ratios and durations.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.interval.is_zero() {
      return Err(ConfigError::ZeroDuration("interval"));
    }
    if !(self.warning_ratio > 0.0 && self.warning_ratio <= self.critical_ratio) {
      return Err(ConfigError::InvalidThreshold(format!(
        "warning_ratio ({}) must be in (0, critical_ratio ({})]",
        self.warning_ratio, self.critical_ratio
      )));
    }
    if !self.critical_ratio.is_finite() {
      return Err(ConfigError::InvalidThreshold(format!(
        "critical_ratio must be finite, got {}",
        self.critical_ratio
      )));
    }
    Ok(())
  }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
  /// Running or paused pipelines.
  pub active_pipelines: usize,
  /// Sum of their latest memory samples.
  pub total_memory: u64,
  /// Pipelines above the warning ratio (but below critical).
  pub warnings: Vec<PipelineId>,
  /// Pipelines above the critical ratio.
  pub critical: Vec<PipelineId>,
  /// Pipelines paused during this tick.
  pub paused: Vec<PipelineId>,
  /// Pipelines resumed during this tick.
  pub resumed: Vec<PipelineId>,
  /// Pipelines killed during this tick.
  pub killed: Vec<PipelineId>,
  /// Units found dead while their pipeline is active.
  pub liveness_lost: Vec<(PipelineId, PipelineStage)>,
  /// Terminal entries pruned.
  pub pruned: usize,
}

/// Periodic supervisor over a [`Registry`].
pub struct HealthMonitor {
  registry: Registry,
  reporter: SharedReporter,
  config: HealthMonitorConfig,
  critical_since: HashMap<PipelineId, Instant>,
  paused_by_monitor: HashSet<PipelineId>,
}

impl HealthMonitor {
  /// Creates a monitor over `registry`.
  pub fn new(registry: Registry, config: HealthMonitorConfig) -> Result<Self, ConfigError> {
    config.validate()?;
    Ok(Self {
      registry,
      reporter: Arc::new(TracingReporter),
      config,
      critical_since: HashMap::new(),
      paused_by_monitor: HashSet::new(),
    })
  }

  /// Sets the telemetry reporter.
  pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
    self.reporter = reporter;
    self
  }

  /// Runs one tick now.
  pub fn check(&mut self) -> HealthReport {
    self.check_at(Instant::now())
  }

  /// Runs one tick as of `now`.
  pub fn check_at(&mut self, now: Instant) -> HealthReport {
    let active = self.registry.list_active();
    let mut report = HealthReport {
      active_pipelines: active.len(),
      total_memory: active.iter().map(|info| info.memory_usage).sum(),
      ..HealthReport::default()
    };

    for info in &active {
      self.check_liveness(info, &mut report);
      self.check_memory(info, now, &mut report);
      self.emit(
        Some(&info.id),
        EventKind::Throughput {
          records_per_second: info.throughput(),
        },
      );
    }

    let live: HashSet<&PipelineId> = active.iter().map(|info| &info.id).collect();
    self.critical_since.retain(|id, _| live.contains(id));
    self.paused_by_monitor.retain(|id| live.contains(id));

    self.emit(
      None,
      EventKind::HealthCheck {
        active_pipeline_count: report.active_pipelines,
        total_memory: report.total_memory,
      },
    );
    if let Some(retention) = self.config.retention {
      report.pruned = self.registry.prune_terminal(retention);
    }
    report
  }

  fn check_liveness(&self, info: &PipelineInfo, report: &mut HealthReport) {
    for stage in PipelineStage::ALL {
      let lost = match (stage, info.unit(stage)) {
        (_, UnitStatus::Crashed) => true,
        // The stage finishing ends the pipeline; an active entry means it should still run.
        (PipelineStage::Aggregator, UnitStatus::Finished) => true,
        _ => false,
      };
      if lost {
        warn!(pipeline_id = %info.id, %stage, "execution unit is not alive");
        self.emit(Some(&info.id), EventKind::LivenessLost { stage });
        report.liveness_lost.push((info.id.clone(), stage));
      }
    }
  }

  fn check_memory(&mut self, info: &PipelineInfo, now: Instant, report: &mut HealthReport) {
    let ratio = info.memory_ratio();
    let usage = info.memory_usage;
    let limit = info.memory_limit;

    if ratio >= self.config.critical_ratio {
      report.critical.push(info.id.clone());
      self.emit(Some(&info.id), EventKind::MemoryCritical { usage, limit });
      match self.critical_since.get(&info.id).copied() {
        None => {
          self.critical_since.insert(info.id.clone(), now);
          if self.registry.pause(&info.id).unwrap_or(false)
            || info.status == PipelineStatus::Paused
          {
            self.paused_by_monitor.insert(info.id.clone());
            report.paused.push(info.id.clone());
            warn!(pipeline_id = %info.id, usage, limit, "memory critical; pipeline paused");
          }
        }
        Some(since) if now.saturating_duration_since(since) >= self.config.grace_period => {
          let reason = format!(
            "memory usage {usage} bytes stayed at or above {:.0}% of the {limit} byte limit for {:?}",
            self.config.critical_ratio * 100.0,
            self.config.grace_period
          );
          let killed = self
            .registry
            .terminate(&info.id, PipelineStatus::Killed, Some(reason), self.config.kill_grace)
            .unwrap_or(false);
          self.critical_since.remove(&info.id);
          self.paused_by_monitor.remove(&info.id);
          if killed {
            warn!(pipeline_id = %info.id, usage, limit, "pipeline killed after grace period");
            report.killed.push(info.id.clone());
          }
        }
        Some(_) => {}
      }
      return;
    }

    self.critical_since.remove(&info.id);
    if self.paused_by_monitor.remove(&info.id) && self.registry.resume(&info.id).unwrap_or(false) {
      info!(pipeline_id = %info.id, usage, limit, "memory recovered; pipeline resumed");
      report.resumed.push(info.id.clone());
    }
    if ratio >= self.config.warning_ratio {
      report.warnings.push(info.id.clone());
      self.emit(Some(&info.id), EventKind::MemoryWarning { usage, limit });
    }
  }

  fn emit(&self, id: Option<&PipelineId>, kind: EventKind) {
    let event = match id {
      Some(id) => TelemetryEvent::new(id.clone(), kind),
      None => TelemetryEvent::global(kind),
    };
    self.reporter.report(event);
  }

  /// Runs ticks every `interval` on a tokio task until stopped.
  pub fn spawn(mut self) -> HealthMonitorHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let join = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.config.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          biased;
          _ = token.cancelled() => break,
          _ = ticker.tick() => {
            self.check();
          }
        }
      }
    });
    HealthMonitorHandle { cancel, join }
  }
}

/// Handle to a spawned [`HealthMonitor`].
#[derive(Debug)]
pub struct HealthMonitorHandle {
  cancel: CancellationToken,
  join: JoinHandle<()>,
}

impl HealthMonitorHandle {
  /// Stops the monitor and waits for its task to exit.
  pub async fn stop(self) {
    self.cancel.cancel();
    let _ = self.join.await;
  }

  /// True until the monitor task exits.
  pub fn is_running(&self) -> bool {
    !self.join.is_finished()
  }
}
