use crate::config::{AggregationSpec, GroupedAggregationSpec, PipelineConfig};
use crate::control::{PipelineControl, WorkerExit, WorkerResult};
use crate::error::TransformError;
use crate::memory::ManualMemoryProbe;
use crate::producer::Producer;
use crate::record::Record;
use crate::registry::PipelineId;
use crate::source::{SourceAdapter, VecSource};
use crate::stage::{AggregateStage, StageCommand, StreamItem, StreamResult};
use crate::telemetry::{CollectingReporter, EventKind};
use crate::test_support::{StalledSource, numbered, rec};
use crate::transform::{IdentityTransform, RecordTransform};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Harness {
  output: mpsc::Receiver<StreamResult>,
  commands: mpsc::Sender<StageCommand>,
  stage: JoinHandle<WorkerResult>,
  reporter: Arc<CollectingReporter>,
  control: PipelineControl,
}

fn spawn(config: &PipelineConfig, source: Arc<dyn SourceAdapter>, transform: Arc<dyn RecordTransform>) -> Harness {
  let id = PipelineId::from("stage-test");
  let control = PipelineControl::new();
  let reporter = Arc::new(CollectingReporter::new());
  let (demand, upstream, _producer) = Producer::new(id.clone(), config, source, control.clone())
    .with_memory_probe(Arc::new(ManualMemoryProbe::new(0)))
    .spawn();
  let (output_tx, output) = mpsc::channel(config.buffer_size);
  let (commands, command_rx) = mpsc::channel(4);
  let stage = AggregateStage::new(id, config, transform, control.clone())
    .with_reporter(reporter.clone())
    .spawn(demand, upstream, output_tx, command_rx);
  Harness {
    output,
    commands,
    stage,
    reporter,
    control,
  }
}

async fn drain(output: &mut mpsc::Receiver<StreamResult>) -> (Vec<Record>, Option<crate::aggregate::AggregationSnapshot>) {
  let mut records = Vec::new();
  let mut snapshot = None;
  while let Some(item) = timeout(Duration::from_secs(2), output.recv()).await.unwrap() {
    match item.unwrap() {
      StreamItem::Record(record) => records.push(record),
      StreamItem::Snapshot(last) => snapshot = Some(last),
    }
  }
  (records, snapshot)
}

fn failing_every_tenth(record: Record) -> Result<Record, TransformError> {
  match record.get("id").and_then(Value::as_u64) {
    Some(id) if id % 10 == 9 => Err(TransformError::new(format!("bad record {id}"))),
    _ => Ok(record),
  }
}

#[tokio::test]
async fn test_failed_transforms_are_skipped_and_counted() {
  let config = PipelineConfig::default().with_chunk_size(25);
  let mut harness = spawn(
    &config,
    Arc::new(VecSource::new(numbered(100))),
    Arc::new(failing_every_tenth),
  );
  let (records, snapshot) = drain(&mut harness.output).await;
  assert_eq!(records.len(), 90);
  let snapshot = snapshot.expect("final snapshot");
  assert_eq!(snapshot.failed_count, 10);
  assert_eq!(snapshot.records_in, 100);
  assert_eq!(snapshot.records_out, 90);
  assert_eq!(harness.stage.await.unwrap().unwrap(), WorkerExit::Completed);

  let failed: u64 = harness
    .reporter
    .named("batch.transformed")
    .into_iter()
    .map(|event| match event.kind {
      EventKind::BatchTransformed { failed_count, .. } => failed_count,
      _ => 0,
    })
    .sum();
  assert_eq!(failed, 10);
}

#[tokio::test]
async fn test_panicking_transform_is_counted_as_failure() {
  let config = PipelineConfig::default().with_chunk_size(10);
  let transform = |record: Record| -> Result<Record, TransformError> {
    if record.get("id") == Some(&json!(3)) {
      panic!("transform bug");
    }
    Ok(record)
  };
  let mut harness = spawn(&config, Arc::new(VecSource::new(numbered(5))), Arc::new(transform));
  let (records, snapshot) = drain(&mut harness.output).await;
  assert_eq!(records.len(), 4);
  assert_eq!(snapshot.unwrap().failed_count, 1);
}

#[tokio::test]
async fn test_records_preserve_fetch_order() {
  let config = PipelineConfig::default().with_chunk_size(7);
  let mut harness = spawn(
    &config,
    Arc::new(VecSource::new(numbered(50))),
    Arc::new(IdentityTransform),
  );
  let (records, _) = drain(&mut harness.output).await;
  let ids: Vec<u64> = records.iter().filter_map(|r| r["id"].as_u64()).collect();
  assert_eq!(ids, (0..50).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_demand_is_bounded_by_output_buffer() {
  let config = PipelineConfig::default()
    .with_chunk_size(5)
    .with_max_demand(10)
    .with_buffer_size(10);
  let source = Arc::new(VecSource::new(numbered(100)));
  let mut harness = spawn(&config, source.clone(), Arc::new(IdentityTransform));

  tokio::time::sleep(Duration::from_millis(100)).await;
  let requested: usize = source.fetch_calls().iter().map(|(_, limit)| limit).sum();
  assert_eq!(requested, 10);
  assert_eq!(harness.reporter.count("buffer.near_full"), 1);

  let (records, snapshot) = drain(&mut harness.output).await;
  assert_eq!(records.len(), 100);
  assert_eq!(snapshot.unwrap().records_out, 100);
}

#[tokio::test]
async fn test_rejected_group_records_are_still_emitted() {
  let config = PipelineConfig::default().with_grouped_aggregation(
    GroupedAggregationSpec::new("by_territory", ["territory"])
      .with_aggregation(AggregationSpec::count("orders"))
      .with_max_groups(1),
  );
  let source = VecSource::new(vec![
    rec(json!({"territory": "A"})),
    rec(json!({"territory": "A"})),
    rec(json!({"territory": "B"})),
  ]);
  let mut harness = spawn(&config, Arc::new(source), Arc::new(IdentityTransform));
  let (records, snapshot) = drain(&mut harness.output).await;
  assert_eq!(records.len(), 3);
  let snapshot = snapshot.unwrap();
  let grouping = snapshot.grouping("by_territory").unwrap();
  assert_eq!(grouping.len(), 1);
  assert_eq!(grouping.rejected_count, 1);
  assert_eq!(grouping.group(&[json!("A")]).unwrap().values["orders"], json!(2));
  assert_eq!(harness.reporter.count("group.rejected"), 1);
}

#[tokio::test]
async fn test_snapshot_command_is_served_while_waiting() {
  let config = PipelineConfig::default();
  let harness = spawn(&config, Arc::new(StalledSource), Arc::new(IdentityTransform));
  let (reply, response) = oneshot::channel();
  harness
    .commands
    .send(StageCommand::Snapshot(reply))
    .await
    .unwrap();
  let snapshot = timeout(Duration::from_secs(1), response).await.unwrap().unwrap();
  assert_eq!(snapshot.records_in, 0);
  harness.control.cancel();
}

#[tokio::test]
async fn test_dropping_the_output_cancels_the_stage() {
  let config = PipelineConfig::default().with_chunk_size(5).with_buffer_size(5).with_max_demand(5).with_min_demand(2);
  let harness = spawn(
    &config,
    Arc::new(VecSource::new(numbered(100))),
    Arc::new(IdentityTransform),
  );
  drop(harness.output);
  let exit = timeout(Duration::from_secs(1), harness.stage).await.unwrap().unwrap();
  assert_eq!(exit.unwrap(), WorkerExit::Cancelled);
}

#[tokio::test]
async fn test_cancel_unwinds_stage() {
  let config = PipelineConfig::default();
  let harness = spawn(&config, Arc::new(StalledSource), Arc::new(IdentityTransform));
  harness.control.cancel();
  let exit = timeout(Duration::from_secs(1), harness.stage).await.unwrap().unwrap();
  assert_eq!(exit.unwrap(), WorkerExit::Cancelled);
}
