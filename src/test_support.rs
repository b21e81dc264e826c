//! Shared fixtures for unit tests.

use crate::error::SourceError;
use crate::record::Record;
use crate::source::SourceAdapter;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub(crate) fn rec(value: Value) -> Record {
  match value {
    Value::Object(map) => map,
    other => panic!("expected an object, got {other}"),
  }
}

pub(crate) fn numbered(n: usize) -> Vec<Record> {
  (0..n).map(|i| rec(json!({ "id": i, "amount": i }))).collect()
}

/// Fails the first `failures` fetches with a transient error, then serves
/// `records`.
pub(crate) struct FlakySource {
  pub(crate) records: Vec<Record>,
  pub(crate) failures: u32,
  pub(crate) permanent: bool,
  pub(crate) attempts: AtomicU32,
}

impl FlakySource {
  pub(crate) fn transient(records: Vec<Record>, failures: u32) -> Self {
    Self {
      records,
      failures,
      permanent: false,
      attempts: AtomicU32::new(0),
    }
  }

  pub(crate) fn permanent(records: Vec<Record>) -> Self {
    Self {
      records,
      failures: u32::MAX,
      permanent: true,
      attempts: AtomicU32::new(0),
    }
  }

  pub(crate) fn attempts(&self) -> u32 {
    self.attempts.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl SourceAdapter for FlakySource {
  async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<Record>, SourceError> {
    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
    if attempt < self.failures {
      return Err(if self.permanent {
        SourceError::permanent("relation does not exist")
      } else {
        SourceError::transient("connection reset")
      });
    }
    let start = (offset as usize).min(self.records.len());
    let end = (start + limit).min(self.records.len());
    Ok(self.records[start..end].to_vec())
  }
}

/// Never answers a fetch.
pub(crate) struct StalledSource;

#[async_trait]
impl SourceAdapter for StalledSource {
  async fn fetch(&self, _offset: u64, _limit: usize) -> Result<Vec<Record>, SourceError> {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(Vec::new())
  }
}
