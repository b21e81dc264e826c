//! Grouped aggregation with a bounded number of keys.

use super::accumulator::AggregateSet;
use crate::config::{GroupedAggregationSpec, SortOrder};
use crate::record::Record;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Result of offering a record to a grouping.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
  /// The record was folded into an existing or new group.
  Accumulated,
  /// The record's key would exceed `max_groups`; carries the rendered key.
  Rejected(String),
}

#[derive(Debug, Clone)]
struct Group {
  key: Vec<Value>,
  aggregates: AggregateSet,
}

/// One grouping's state: groups keyed by the values of the `group_by` fields.
#[derive(Debug, Clone)]
pub struct GroupedAggregation {
  spec: GroupedAggregationSpec,
  groups: HashMap<Vec<String>, Group>,
  rejected_count: u64,
}

impl GroupedAggregation {
  /// Creates an empty grouping.
  pub fn new(spec: GroupedAggregationSpec) -> Self {
    Self {
      spec,
      groups: HashMap::new(),
      rejected_count: 0,
    }
  }

  /// Grouping name.
  pub fn name(&self) -> &str {
    &self.spec.name
  }

  /// Distinct groups accumulated so far.
  pub fn len(&self) -> usize {
    self.groups.len()
  }

  /// True before the first record is accumulated.
  pub fn is_empty(&self) -> bool {
    self.groups.is_empty()
  }

  /// Records refused at the cardinality bound.
  pub fn rejected_count(&self) -> u64 {
    self.rejected_count
  }

  /// Folds a record into its group.
  ///
  /// A missing key field contributes `null` to the key. Once `max_groups`
  /// distinct keys exist, records with a new key are rejected while existing
  /// groups keep accumulating.
  pub fn update(&mut self, record: &Record) -> GroupOutcome {
    let key: Vec<Value> = self
      .spec
      .group_by
      .iter()
      .map(|field| field.resolve(record).cloned().unwrap_or(Value::Null))
      .collect();
    let canonical: Vec<String> = key.iter().map(Value::to_string).collect();

    if let Some(group) = self.groups.get_mut(&canonical) {
      group.aggregates.update(record);
      return GroupOutcome::Accumulated;
    }
    if self.groups.len() >= self.spec.max_groups {
      self.rejected_count += 1;
      return GroupOutcome::Rejected(render_key(&key));
    }
    let mut aggregates = AggregateSet::new(&self.spec.aggregations);
    aggregates.update(record);
    self.groups.insert(canonical, Group { key, aggregates });
    GroupOutcome::Accumulated
  }

  /// Sorted read-only copy of the grouping.
  pub fn snapshot(&self) -> GroupedSnapshot {
    let mut groups: Vec<GroupRow> = self
      .groups
      .values()
      .map(|group| GroupRow {
        key: group.key.clone(),
        values: group.aggregates.values(),
      })
      .collect();
    groups.sort_by(|a, b| compare_keys(&a.key, &b.key));
    if self.spec.sort == SortOrder::Desc {
      groups.reverse();
    }
    GroupedSnapshot {
      groups,
      rejected_count: self.rejected_count,
    }
  }
}

/// One group in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupRow {
  /// Values of the `group_by` fields, in declaration order.
  pub key: Vec<Value>,
  /// Aggregation values by name.
  pub values: BTreeMap<String, Value>,
}

/// Snapshot of one grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct GroupedSnapshot {
  /// Groups sorted by key.
  pub groups: Vec<GroupRow>,
  /// Records refused at the cardinality bound.
  pub rejected_count: u64,
}

impl GroupedSnapshot {
  /// Looks a group up by its key values.
  pub fn group(&self, key: &[Value]) -> Option<&GroupRow> {
    self.groups.iter().find(|row| row.key == key)
  }

  /// Number of groups.
  pub fn len(&self) -> usize {
    self.groups.len()
  }

  /// True when no group was accumulated.
  pub fn is_empty(&self) -> bool {
    self.groups.is_empty()
  }
}

fn render_key(key: &[Value]) -> String {
  key
    .iter()
    .map(|value| match value {
      Value::String(s) => s.clone(),
      other => other.to_string(),
    })
    .collect::<Vec<_>>()
    .join(",")
}

fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
  a.iter()
    .zip(b)
    .map(|(x, y)| compare_values(x, y))
    .find(|ordering| ordering.is_ne())
    .unwrap_or_else(|| a.len().cmp(&b.len()))
}

fn type_rank(value: &Value) -> u8 {
  match value {
    Value::Null => 0,
    Value::Bool(_) => 1,
    Value::Number(_) => 2,
    Value::String(_) => 3,
    Value::Array(_) => 4,
    Value::Object(_) => 5,
  }
}

/// Total order over JSON values: null < bool < number < string < array < object.
fn compare_values(a: &Value, b: &Value) -> Ordering {
  match (a, b) {
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    (Value::Number(x), Value::Number(y)) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.total_cmp(&y)
    }
    (Value::String(x), Value::String(y)) => x.cmp(y),
    _ => type_rank(a)
      .cmp(&type_rank(b))
      .then_with(|| a.to_string().cmp(&b.to_string())),
  }
}
