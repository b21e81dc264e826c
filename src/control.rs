//! Stop and pause signals shared by the execution units of one pipeline.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// How an execution unit left its run loop without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
  /// The unit ran to the natural end of the stream.
  Completed,
  /// The unit observed a stop signal, or its peer went away, and unwound early.
  Cancelled,
}

/// Result returned by every execution unit task.
pub type WorkerResult = Result<WorkerExit, crate::error::PipelineError>;

/// Cooperative control handle for one pipeline.
///
/// Cloning is cheap; every clone observes the same signals. The Producer and the
/// Aggregate Stage check `cancelled()` at each suspension point. Only the
/// Producer honours the pause flag.
#[derive(Debug, Clone)]
pub struct PipelineControl {
  cancel: CancellationToken,
  pause: Arc<watch::Sender<bool>>,
}

impl Default for PipelineControl {
  fn default() -> Self {
    Self::new()
  }
}

impl PipelineControl {
  /// Creates a running, unpaused control.
  pub fn new() -> Self {
    let (pause, _) = watch::channel(false);
    Self {
      cancel: CancellationToken::new(),
      pause: Arc::new(pause),
    }
  }

  /// Signals every unit to stop.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// True once `cancel` was called.
  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Resolves when `cancel` is called.
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.cancel.cancelled()
  }

  /// Asks the Producer to withhold production. Returns false if already paused.
  pub fn pause(&self) -> bool {
    !self.pause.send_replace(true)
  }

  /// Lifts a pause. Returns false if not paused.
  pub fn resume(&self) -> bool {
    self.pause.send_replace(false)
  }

  /// Current pause flag.
  pub fn is_paused(&self) -> bool {
    *self.pause.borrow()
  }

  /// Subscribes to pause flag changes.
  pub fn subscribe_pause(&self) -> watch::Receiver<bool> {
    self.pause.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_pause_resume_are_idempotent() {
    let control = PipelineControl::new();
    assert!(!control.is_paused());
    assert!(control.pause());
    assert!(!control.pause());
    assert!(control.is_paused());
    assert!(control.resume());
    assert!(!control.resume());
  }

  #[tokio::test]
  async fn test_cancel_wakes_clones() {
    let control = PipelineControl::new();
    let clone = control.clone();
    let waiter = tokio::spawn(async move { clone.cancelled().await });
    control.cancel();
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .unwrap()
      .unwrap();
    assert!(control.is_cancelled());
  }

  #[tokio::test]
  async fn test_pause_subscribers_see_changes() {
    let control = PipelineControl::new();
    let mut rx = control.subscribe_pause();
    control.pause();
    rx.changed().await.unwrap();
    assert!(*rx.borrow());
  }
}
