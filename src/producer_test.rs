use crate::config::PipelineConfig;
use crate::control::{PipelineControl, WorkerExit};
use crate::error::{FetchErrorKind, PipelineError};
use crate::memory::ManualMemoryProbe;
use crate::producer::{Producer, ProducerMessage};
use crate::registry::PipelineId;
use crate::source::{SourceAdapter, VecSource};
use crate::telemetry::{CollectingReporter, EventKind};
use crate::test_support::{FlakySource, StalledSource, numbered};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const LIMIT: u64 = 1_000_000;

fn config(chunk_size: usize) -> PipelineConfig {
  PipelineConfig::default()
    .with_chunk_size(chunk_size)
    .with_memory_limit(LIMIT)
    .with_memory_check_interval(Duration::from_millis(10))
    .with_retries(3, Duration::from_millis(1), Duration::from_millis(5))
}

fn producer(config: &PipelineConfig, source: Arc<dyn SourceAdapter>) -> (Producer, PipelineControl, ManualMemoryProbe) {
  let control = PipelineControl::new();
  let probe = ManualMemoryProbe::new(0);
  let producer = Producer::new(PipelineId::from("producer-test"), config, source, control.clone())
    .with_memory_probe(Arc::new(probe.clone()));
  (producer, control, probe)
}

async fn next(rx: &mut mpsc::Receiver<ProducerMessage>) -> ProducerMessage {
  timeout(Duration::from_secs(2), rx.recv())
    .await
    .expect("producer message")
    .expect("channel open")
}

async fn next_chunk_len(rx: &mut mpsc::Receiver<ProducerMessage>) -> usize {
  match next(rx).await {
    ProducerMessage::Chunk(chunk) => chunk.records.len(),
    other => panic!("expected chunk, got {other:?}"),
  }
}

async fn assert_quiet(rx: &mut mpsc::Receiver<ProducerMessage>) {
  assert!(
    timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
    "producer emitted without demand"
  );
}

#[tokio::test]
async fn test_chunks_follow_chunk_size_and_end_on_empty_page() {
  let source = Arc::new(VecSource::new(numbered(1500)));
  let (producer, _control, _probe) = producer(&config(500), source.clone());
  let producer = producer.with_total_records(Some(1500));
  let (demand, mut rx, task) = producer.spawn();

  assert!(demand.ask(1500).await);
  for _ in 0..3 {
    assert_eq!(next_chunk_len(&mut rx).await, 500);
  }
  assert_quiet(&mut rx).await;
  assert!(demand.ask(1).await);
  assert!(matches!(next(&mut rx).await, ProducerMessage::Done));
  assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Completed);
  assert_eq!(source.fetch_calls(), vec![(0, 500), (500, 500), (1000, 500), (1500, 1)]);
}

#[tokio::test]
async fn test_undercounted_source_is_read_to_the_end() {
  // Rows were appended after count() was taken.
  let source = Arc::new(VecSource::new(numbered(10)));
  let (producer, _control, _probe) = producer(&config(2), source.clone());
  let producer = producer.with_total_records(Some(5));
  let (demand, mut rx, task) = producer.spawn();

  assert!(demand.ask(20).await);
  let mut received = 0;
  for _ in 0..5 {
    received += next_chunk_len(&mut rx).await;
  }
  assert_eq!(received, 10);
  assert!(matches!(next(&mut rx).await, ProducerMessage::Done));
  assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Completed);
  assert_eq!(source.fetch_calls().last(), Some(&(10, 2)));
}

#[tokio::test]
async fn test_empty_fetch_ends_stream_without_count() {
  let source = Arc::new(VecSource::new(numbered(3)).with_count(false));
  let (producer, _control, _probe) = producer(&config(2), source.clone());
  let (demand, mut rx, task) = producer.spawn();

  assert!(demand.ask(10).await);
  assert_eq!(next_chunk_len(&mut rx).await, 2);
  assert_eq!(next_chunk_len(&mut rx).await, 1);
  assert!(matches!(next(&mut rx).await, ProducerMessage::Done));
  assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Completed);
  assert_eq!(source.fetch_calls().len(), 3);
}

#[tokio::test]
async fn test_never_emits_more_than_outstanding_demand() {
  let source = Arc::new(VecSource::new(numbered(100)));
  let (producer, _control, _probe) = producer(&config(5), source.clone());
  let (demand, mut rx, _task) = producer.spawn();

  assert!(demand.ask(7).await);
  assert_eq!(next_chunk_len(&mut rx).await, 5);
  assert_eq!(next_chunk_len(&mut rx).await, 2);
  assert_quiet(&mut rx).await;

  assert!(demand.ask(3).await);
  assert_eq!(next_chunk_len(&mut rx).await, 3);
  assert_eq!(source.fetch_calls(), vec![(0, 5), (5, 2), (7, 3)]);
}

#[tokio::test]
async fn test_open_breaker_withholds_then_resumes_without_loss() {
  let source = Arc::new(VecSource::new(numbered(10)));
  let reporter = Arc::new(CollectingReporter::new());
  let (producer, _control, probe) = producer(&config(10), source.clone());
  probe.set(LIMIT);
  let (demand, mut rx, _task) = producer.with_reporter(reporter.clone()).spawn();

  assert!(demand.ask(10).await);
  assert_quiet(&mut rx).await;
  assert!(source.fetch_calls().is_empty());

  probe.set(0);
  assert_eq!(next_chunk_len(&mut rx).await, 10);
  let transitions: Vec<_> = reporter
    .named("circuit.transition")
    .into_iter()
    .map(|event| match event.kind {
      EventKind::CircuitTransition { to, .. } => to.as_str(),
      _ => unreachable!(),
    })
    .collect();
  assert_eq!(transitions, vec!["open", "closed"]);
}

#[tokio::test]
async fn test_degraded_breaker_halves_chunk_size() {
  let source = Arc::new(VecSource::new(numbered(1000)));
  let (producer, _control, probe) = producer(&config(500), source.clone());
  probe.set(LIMIT * 85 / 100);
  let (demand, mut rx, _task) = producer.spawn();

  assert!(demand.ask(500).await);
  assert_eq!(next_chunk_len(&mut rx).await, 250);
  assert_eq!(next_chunk_len(&mut rx).await, 250);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
  let source = Arc::new(FlakySource::transient(numbered(4), 2));
  let reporter = Arc::new(CollectingReporter::new());
  let (producer, _control, _probe) = producer(&config(4), source.clone());
  let (demand, mut rx, _task) = producer.with_reporter(reporter.clone()).spawn();

  assert!(demand.ask(4).await);
  assert_eq!(next_chunk_len(&mut rx).await, 4);
  assert_eq!(source.attempts(), 3);
  assert_eq!(reporter.count("fetch.retry"), 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_downstream() {
  let source = Arc::new(FlakySource::transient(numbered(4), u32::MAX));
  let reporter = Arc::new(CollectingReporter::new());
  let (producer, _control, _probe) = producer(&config(4), source.clone());
  let (demand, mut rx, task) = producer.with_reporter(reporter.clone()).spawn();

  assert!(demand.ask(4).await);
  match next(&mut rx).await {
    ProducerMessage::Failed(PipelineError::SourceFetch { attempts, .. }) => assert_eq!(attempts, 4),
    other => panic!("expected failure, got {other:?}"),
  }
  assert!(task.await.unwrap().is_err());
  assert_eq!(source.attempts(), 4);
  assert_eq!(reporter.count("pipeline.error"), 1);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
  let source = Arc::new(FlakySource::permanent(numbered(4)));
  let (producer, _control, _probe) = producer(&config(4), source.clone());
  let (demand, mut rx, task) = producer.spawn();

  assert!(demand.ask(4).await);
  assert!(matches!(
    next(&mut rx).await,
    ProducerMessage::Failed(PipelineError::SourceFetch { attempts: 1, .. })
  ));
  assert!(matches!(
    task.await.unwrap(),
    Err(PipelineError::SourceFetch { attempts: 1, .. })
  ));
}

#[tokio::test]
async fn test_fetch_timeout_counts_as_transient() {
  let config = config(4)
    .with_retries(0, Duration::from_millis(1), Duration::from_millis(1))
    .with_fetch_timeout(Some(Duration::from_millis(20)));
  let (producer, _control, _probe) = producer(&config, Arc::new(StalledSource));
  let (demand, mut rx, _task) = producer.spawn();

  assert!(demand.ask(4).await);
  match next(&mut rx).await {
    ProducerMessage::Failed(PipelineError::SourceFetch { source, .. }) => {
      assert_eq!(source.kind, FetchErrorKind::Transient);
    }
    other => panic!("expected timeout failure, got {other:?}"),
  }
}

#[tokio::test]
async fn test_pause_withholds_production() {
  let source = Arc::new(VecSource::new(numbered(10)));
  let (producer, control, _probe) = producer(&config(10), source);
  control.pause();
  let (demand, mut rx, _task) = producer.spawn();

  assert!(demand.ask(10).await);
  assert_quiet(&mut rx).await;
  control.resume();
  assert_eq!(next_chunk_len(&mut rx).await, 10);
}

#[tokio::test]
async fn test_cancel_stops_waiting_producer() {
  let (producer, control, _probe) = producer(&config(10), Arc::new(StalledSource));
  let (demand, _rx, task) = producer.spawn();

  assert!(demand.ask(10).await);
  tokio::time::sleep(Duration::from_millis(20)).await;
  control.cancel();
  let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
  assert_eq!(exit.unwrap(), WorkerExit::Cancelled);
}
