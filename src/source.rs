//! Source adapters.
//!
//! A [`SourceAdapter`] serves pages of records by `(offset, limit)`. The Producer
//! is the only caller. An empty page ends the stream. An optional
//! [`SourceAdapter::count`] lets `status` report progress as a fraction; it is
//! never trusted to end the stream, since rows may be inserted after it is read.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use streamgate::source::{SourceAdapter, VecSource};
//!
//! # tokio_test::block_on(async {
//! let source = VecSource::from_values((0..3).map(|i| json!({"id": i})));
//! let page = source.fetch(1, 5).await.unwrap();
//! assert_eq!(page.len(), 2);
//! # });
//! ```

use crate::error::SourceError;
use crate::record::Record;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

/// Paged access to an external data source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
  /// Returns up to `limit` records starting at `offset`. An empty page means
  /// the source is exhausted.
  async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<Record>, SourceError>;

  /// Total number of records, when the source can tell cheaply.
  async fn count(&self) -> Option<Result<u64, SourceError>> {
    None
  }
}

/// Serves pages from an in-memory vector.
#[derive(Debug, Default)]
pub struct VecSource {
  records: Vec<Record>,
  expose_count: bool,
  fetches: Mutex<Vec<(u64, usize)>>,
}

impl VecSource {
  /// Creates a source over `records` that reports its count.
  pub fn new(records: Vec<Record>) -> Self {
    Self {
      records,
      expose_count: true,
      fetches: Mutex::new(Vec::new()),
    }
  }

  /// Creates a source from JSON values. Non-object values are skipped.
  pub fn from_values<I>(values: I) -> Self
  where
    I: IntoIterator<Item = Value>,
  {
    Self::new(
      values
        .into_iter()
        .filter_map(|value| match value {
          Value::Object(map) => Some(map),
          _ => None,
        })
        .collect(),
    )
  }

  /// Whether `count()` reports the number of records.
  pub fn with_count(mut self, expose_count: bool) -> Self {
    self.expose_count = expose_count;
    self
  }

  /// Every `(offset, limit)` served so far, in call order.
  pub fn fetch_calls(&self) -> Vec<(u64, usize)> {
    self
      .fetches
      .lock()
      .map(|fetches| fetches.clone())
      .unwrap_or_default()
  }

  /// Number of records held.
  pub fn len(&self) -> usize {
    self.records.len()
  }

  /// True when the source holds no records.
  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

#[async_trait]
impl SourceAdapter for VecSource {
  async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<Record>, SourceError> {
    if let Ok(mut fetches) = self.fetches.lock() {
      fetches.push((offset, limit));
    }
    let start = usize::try_from(offset)
      .unwrap_or(usize::MAX)
      .min(self.records.len());
    let end = start.saturating_add(limit).min(self.records.len());
    Ok(self.records[start..end].to_vec())
  }

  async fn count(&self) -> Option<Result<u64, SourceError>> {
    self.expose_count.then(|| Ok(self.records.len() as u64))
  }
}
