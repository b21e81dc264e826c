use crate::control::{PipelineControl, WorkerExit, WorkerResult};
use crate::error::{PipelineError, PipelineStage, SourceError};
use crate::registry::{MetricsUpdate, PipelineId, PipelineStatus, Registration, Registry, UnitStatus};
use std::time::Duration;
use tokio::time::timeout;

fn register(registry: &Registry) -> (PipelineId, PipelineControl) {
  let id = PipelineId::generate();
  let control = PipelineControl::new();
  registry
    .register(id.clone(), Registration::new(control.clone(), 1000))
    .unwrap();
  (id, control)
}

async fn wait_terminal(registry: &Registry, id: &PipelineId) -> PipelineStatus {
  timeout(Duration::from_secs(2), registry.wait_for_terminal(id))
    .await
    .expect("terminal status in time")
    .unwrap()
}

fn unit(result: WorkerResult) -> tokio::task::JoinHandle<WorkerResult> {
  tokio::spawn(async move { result })
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
  let registry = Registry::new();
  let (id, control) = register(&registry);
  assert!(matches!(
    registry.register(id.clone(), Registration::new(control, 1)),
    Err(PipelineError::Duplicate(dup)) if dup == id
  ));
}

#[tokio::test]
async fn test_both_units_completing_marks_completed() {
  let registry = Registry::new();
  let (id, _control) = register(&registry);
  registry
    .attach(&id, PipelineStage::Producer, unit(Ok(WorkerExit::Completed)))
    .unwrap();
  registry
    .attach(&id, PipelineStage::Aggregator, unit(Ok(WorkerExit::Completed)))
    .unwrap();
  assert_eq!(wait_terminal(&registry, &id).await, PipelineStatus::Completed);
  let info = registry.lookup(&id).unwrap();
  assert_eq!(info.producer, UnitStatus::Finished);
  assert_eq!(info.aggregator, UnitStatus::Finished);
  assert_eq!(info.progress(), Some(1.0));
}

#[tokio::test]
async fn test_unit_error_marks_failed_and_cancels_peer() {
  let registry = Registry::new();
  let (id, control) = register(&registry);
  let error = PipelineError::SourceFetch {
    source: SourceError::permanent("relation does not exist"),
    attempts: 1,
  };
  registry
    .attach(&id, PipelineStage::Producer, unit(Err(error)))
    .unwrap();
  assert_eq!(wait_terminal(&registry, &id).await, PipelineStatus::Failed);
  let info = registry.lookup(&id).unwrap();
  assert!(info.failure_reason.unwrap().contains("relation does not exist"));
  assert_eq!(info.producer, UnitStatus::Crashed);
  assert!(control.is_cancelled());
}

#[tokio::test]
async fn test_panic_is_recorded_as_crash() {
  let registry = Registry::new();
  let (id, _control) = register(&registry);
  let handle = tokio::spawn(async {
    if true {
      panic!("stage exploded");
    }
    Ok::<_, PipelineError>(WorkerExit::Completed)
  });
  registry.attach(&id, PipelineStage::Aggregator, handle).unwrap();
  assert_eq!(wait_terminal(&registry, &id).await, PipelineStatus::Failed);
  let info = registry.lookup(&id).unwrap();
  assert_eq!(info.aggregator, UnitStatus::Crashed);
  let reason = info.failure_reason.unwrap();
  assert!(reason.contains("aggregator crashed"));
  assert!(reason.contains("stage exploded"));
}

#[tokio::test]
async fn test_early_unwind_while_active_marks_cancelled() {
  let registry = Registry::new();
  let (id, control) = register(&registry);
  registry
    .attach(&id, PipelineStage::Aggregator, unit(Ok(WorkerExit::Cancelled)))
    .unwrap();
  assert_eq!(wait_terminal(&registry, &id).await, PipelineStatus::Cancelled);
  assert!(control.is_cancelled());
}

#[tokio::test]
async fn test_terminal_status_is_never_overwritten() {
  let registry = Registry::new();
  let (id, _control) = register(&registry);
  assert!(registry.update_status(&id, PipelineStatus::Paused, None).unwrap());
  assert!(registry.update_status(&id, PipelineStatus::Running, None).unwrap());
  assert!(
    registry
      .update_status(&id, PipelineStatus::Killed, Some("memory".into()))
      .unwrap()
  );
  assert!(!registry.update_status(&id, PipelineStatus::Completed, None).unwrap());
  assert!(!registry.update_status(&id, PipelineStatus::Running, None).unwrap());
  let info = registry.lookup(&id).unwrap();
  assert_eq!(info.status, PipelineStatus::Killed);
  assert_eq!(info.failure_reason.as_deref(), Some("memory"));
}

#[tokio::test]
async fn test_pause_and_resume_drive_control_and_status() {
  let registry = Registry::new();
  let (id, control) = register(&registry);
  assert!(registry.pause(&id).unwrap());
  assert!(control.is_paused());
  assert_eq!(registry.status(&id), Some(PipelineStatus::Paused));
  assert!(registry.resume(&id).unwrap());
  assert!(!control.is_paused());
  assert_eq!(registry.status(&id), Some(PipelineStatus::Running));
  assert!(!registry.resume(&id).unwrap());
}

#[tokio::test]
async fn test_terminate_aborts_stuck_units_after_grace() {
  let registry = Registry::new();
  let (id, control) = register(&registry);
  let stuck = tokio::spawn(async {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok::<_, PipelineError>(WorkerExit::Completed)
  });
  registry.attach(&id, PipelineStage::Producer, stuck).unwrap();

  assert!(
    registry
      .terminate(&id, PipelineStatus::Killed, Some("memory".into()), Duration::from_millis(10))
      .unwrap()
  );
  assert!(control.is_cancelled());
  assert!(
    !registry
      .terminate(&id, PipelineStatus::Cancelled, None, Duration::ZERO)
      .unwrap()
  );

  timeout(Duration::from_secs(1), async {
    while registry.lookup(&id).unwrap().producer == UnitStatus::Alive {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .unwrap();
  assert_eq!(registry.status(&id), Some(PipelineStatus::Killed));
}

#[tokio::test]
async fn test_metrics_and_progress() {
  let registry = Registry::new();
  let id = PipelineId::generate();
  registry
    .register(
      id.clone(),
      Registration::new(PipelineControl::new(), 1000).with_total_records(Some(200)),
    )
    .unwrap();
  registry
    .update_metrics(&id, MetricsUpdate::FetchRound { records: 50 })
    .unwrap();
  registry
    .update_metrics(
      &id,
      MetricsUpdate::Stage {
        records_in: 50,
        records_out: 48,
        failed_count: 2,
        rejected_count: 0,
      },
    )
    .unwrap();
  registry.update_metrics(&id, MetricsUpdate::Memory(900)).unwrap();

  let info = registry.lookup(&id).unwrap();
  assert_eq!(info.fetch_rounds, 1);
  assert_eq!(info.records_processed, 50);
  assert_eq!(info.progress(), Some(0.25));
  assert!((info.memory_ratio() - 0.9).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_lookup_unknown_id() {
  let registry = Registry::new();
  let id = PipelineId::from("missing");
  assert!(matches!(registry.lookup(&id), Err(PipelineError::NotFound(_))));
  assert!(matches!(
    registry.update_metrics(&id, MetricsUpdate::Memory(1)),
    Err(PipelineError::NotFound(_))
  ));
}

#[tokio::test]
async fn test_queries_by_status_and_pruning() {
  let registry = Registry::new();
  let (running, _) = register(&registry);
  let (done, _) = register(&registry);
  registry
    .update_status(&done, PipelineStatus::Completed, None)
    .unwrap();

  let active: Vec<_> = registry.list_active().into_iter().map(|info| info.id).collect();
  assert_eq!(active, vec![running.clone()]);
  assert_eq!(registry.list_by_status(PipelineStatus::Completed).len(), 1);
  assert_eq!(registry.list_all().len(), 2);

  assert_eq!(registry.prune_terminal(Duration::from_secs(60)), 0);
  assert_eq!(registry.prune_terminal(Duration::ZERO), 1);
  assert_eq!(registry.len(), 1);
  assert!(registry.lookup(&running).is_ok());
}

#[tokio::test]
async fn test_remove_terminal_leaves_active_entries() {
  let registry = Registry::new();
  let (running, _) = register(&registry);
  let (done, _) = register(&registry);
  registry.update_status(&done, PipelineStatus::Cancelled, None).unwrap();

  assert!(!registry.remove_terminal(&running));
  assert!(registry.remove_terminal(&done));
  assert!(!registry.remove_terminal(&done));
  assert!(registry.lookup(&done).is_err());
  assert_eq!(registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers() {
  let registry = Registry::new();
  let ids: Vec<_> = (0..8).map(|_| register(&registry).0).collect();
  let mut tasks = Vec::new();
  for id in ids.clone() {
    for _ in 0..4 {
      let registry = registry.clone();
      let id = id.clone();
      tasks.push(tokio::spawn(async move {
        for _ in 0..100 {
          registry
            .update_metrics(&id, MetricsUpdate::FetchRound { records: 1 })
            .unwrap();
          let _ = registry.list_active();
        }
      }));
    }
  }
  for task in tasks {
    task.await.unwrap();
  }
  for id in ids {
    assert_eq!(registry.lookup(&id).unwrap().fetch_rounds, 400);
  }
}
