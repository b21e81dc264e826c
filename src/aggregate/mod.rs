//! # Aggregation State
//!
//! Per-pipeline aggregation state owned exclusively by its Aggregate Stage.
//!
//! [`AggregationState::apply`] folds one transformed record into the global
//! aggregations and every configured grouping. The state is never shared;
//! other components see it only through an [`AggregationSnapshot`], a
//! read-only copy requested over the stage's command channel.
//!
//! Updates are per record, so results are identical however the input is
//! split into chunks.
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use streamgate::aggregate::AggregationState;
//! use streamgate::config::{AggregationSpec, GroupedAggregationSpec, PipelineConfig};
//!
//! let config = PipelineConfig::default()
//!   .with_aggregation(AggregationSpec::sum("revenue", "amount"))
//!   .with_grouped_aggregation(
//!     GroupedAggregationSpec::new("by_territory", ["territory"])
//!       .with_aggregation(AggregationSpec::count("orders")),
//!   );
//! let mut state = AggregationState::new(&config);
//! for (territory, amount) in [("A", 10), ("B", 5), ("A", 1)] {
//!   let mut record = json!({ "territory": territory, "amount": amount })
//!     .as_object()
//!     .cloned()
//!     .unwrap();
//!   state.apply(&mut record);
//! }
//! let snapshot = state.snapshot();
//! assert_eq!(snapshot.global("revenue"), Some(&json!(16)));
//! assert_eq!(snapshot.grouping("by_territory").unwrap().len(), 2);
//! ```

mod accumulator;
mod grouped;

pub use accumulator::{Accumulator, AggregateSet, Aggregator, Scalar};
pub use grouped::{GroupOutcome, GroupRow, GroupedAggregation, GroupedSnapshot};

use crate::config::PipelineConfig;
use crate::record::Record;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// A record refused by one grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
  /// Grouping that refused the record.
  pub grouping: String,
  /// Rendered group key.
  pub key: String,
  /// Cumulative rejections of that grouping.
  pub rejected_count: u64,
}

/// Global and grouped aggregations of one pipeline, plus stage counters.
#[derive(Debug, Clone)]
pub struct AggregationState {
  global: AggregateSet,
  groupings: Vec<GroupedAggregation>,
  records_in: u64,
  records_out: u64,
  failed_count: u64,
  rejected_count: u64,
}

impl AggregationState {
  /// Creates empty state for the aggregations in `config`.
  pub fn new(config: &PipelineConfig) -> Self {
    Self {
      global: AggregateSet::new(&config.aggregations),
      groupings: config
        .grouped_aggregations
        .iter()
        .cloned()
        .map(GroupedAggregation::new)
        .collect(),
      records_in: 0,
      records_out: 0,
      failed_count: 0,
      rejected_count: 0,
    }
  }

  /// Counts records received from upstream, before transformation.
  pub fn record_received(&mut self, count: u64) {
    self.records_in += count;
  }

  /// Counts one record whose transform failed.
  pub fn record_failed(&mut self) {
    self.failed_count += 1;
  }

  /// Counts one record emitted downstream.
  pub fn record_emitted(&mut self) {
    self.records_out += 1;
  }

  /// Folds a transformed record into every aggregation.
  ///
  /// A grouping at its bound leaves the record out of that grouping only; the
  /// record still reaches the global aggregations and the output. After the
  /// update each global `running_total` value is written into the record under
  /// the aggregation's name.
  pub fn apply(&mut self, record: &mut Record) -> Vec<Rejection> {
    let mut rejections = Vec::new();
    for grouping in &mut self.groupings {
      if let GroupOutcome::Rejected(key) = grouping.update(record) {
        self.rejected_count += 1;
        rejections.push(Rejection {
          grouping: grouping.name().to_string(),
          key,
          rejected_count: grouping.rejected_count(),
        });
      }
    }
    self.global.update(record);
    for (name, value) in self.global.running_totals() {
      record.insert(name.to_string(), value);
    }
    rejections
  }

  /// Records received from upstream.
  pub fn records_in(&self) -> u64 {
    self.records_in
  }

  /// Records emitted downstream.
  pub fn records_out(&self) -> u64 {
    self.records_out
  }

  /// Records whose transform failed.
  pub fn failed_count(&self) -> u64 {
    self.failed_count
  }

  /// Group rejections across all groupings.
  pub fn rejected_count(&self) -> u64 {
    self.rejected_count
  }

  /// Read-only copy of the current state.
  pub fn snapshot(&self) -> AggregationSnapshot {
    AggregationSnapshot {
      records_in: self.records_in,
      records_out: self.records_out,
      failed_count: self.failed_count,
      rejected_count: self.rejected_count,
      global: self.global.values(),
      grouped: self
        .groupings
        .iter()
        .map(|grouping| (grouping.name().to_string(), grouping.snapshot()))
        .collect(),
    }
  }
}

/// Point-in-time copy of an [`AggregationState`].
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct AggregationSnapshot {
  /// Records received from upstream.
  pub records_in: u64,
  /// Records emitted downstream.
  pub records_out: u64,
  /// Records whose transform failed.
  pub failed_count: u64,
  /// Group rejections across all groupings.
  pub rejected_count: u64,
  /// Global aggregation values by name.
  pub global: BTreeMap<String, Value>,
  /// Grouped aggregations by grouping name.
  pub grouped: BTreeMap<String, GroupedSnapshot>,
}

impl AggregationSnapshot {
  /// A global aggregation value.
  pub fn global(&self, name: &str) -> Option<&Value> {
    self.global.get(name)
  }

  /// A grouping snapshot.
  pub fn grouping(&self, name: &str) -> Option<&GroupedSnapshot> {
    self.grouped.get(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{AggregationSpec, GroupedAggregationSpec};
  use serde_json::json;

  #[test]
  fn test_running_total_is_stamped_into_records() {
    let config =
      PipelineConfig::default().with_aggregation(AggregationSpec::running_total("cumulative", "amount"));
    let mut state = AggregationState::new(&config);
    let mut stamped = Vec::new();
    for amount in [1, 2, 3] {
      let mut record = json!({ "amount": amount }).as_object().cloned().unwrap();
      state.apply(&mut record);
      stamped.push(record["cumulative"].clone());
    }
    assert_eq!(stamped, vec![json!(1), json!(3), json!(6)]);
  }

  #[test]
  fn test_rejections_are_reported_per_grouping() {
    let config = PipelineConfig::default()
      .with_aggregation(AggregationSpec::count("n"))
      .with_grouped_aggregation(GroupedAggregationSpec::new("a", ["k"]).with_max_groups(1))
      .with_grouped_aggregation(GroupedAggregationSpec::new("b", ["k"]).with_max_groups(5));
    let mut state = AggregationState::new(&config);
    let mut first = json!({"k": 1}).as_object().cloned().unwrap();
    let mut second = json!({"k": 2}).as_object().cloned().unwrap();
    assert!(state.apply(&mut first).is_empty());
    let rejections = state.apply(&mut second);
    assert_eq!(
      rejections,
      vec![Rejection {
        grouping: "a".into(),
        key: "2".into(),
        rejected_count: 1
      }]
    );
    let snapshot = state.snapshot();
    assert_eq!(snapshot.global("n"), Some(&json!(2)));
    assert_eq!(snapshot.grouping("a").unwrap().len(), 1);
    assert_eq!(snapshot.grouping("b").unwrap().len(), 2);
    assert_eq!(snapshot.rejected_count, 1);
  }

  #[test]
  fn test_counters() {
    let mut state = AggregationState::new(&PipelineConfig::default());
    state.record_received(3);
    state.record_failed();
    state.record_emitted();
    state.record_emitted();
    let snapshot = state.snapshot();
    assert_eq!(
      (snapshot.records_in, snapshot.records_out, snapshot.failed_count),
      (3, 2, 1)
    );
  }
}
