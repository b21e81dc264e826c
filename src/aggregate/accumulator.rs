//! Incremental accumulators for single aggregation functions.

use crate::config::{AggregateFunction, AggregationSpec};
use crate::record::{Record, as_number};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// A numeric input or result. Integers stay exact until a float is mixed in
/// or the running value leaves the `i128` range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
  /// Exact integer.
  Int(i128),
  /// Floating-point value.
  Float(f64),
}

impl Scalar {
  /// Reads a JSON number, keeping integers exact.
  pub fn from_json(value: &Value) -> Option<Self> {
    let Value::Number(number) = value else {
      return None;
    };
    if let Some(n) = number.as_i64() {
      Some(Scalar::Int(n.into()))
    } else if let Some(n) = number.as_u64() {
      Some(Scalar::Int(n.into()))
    } else {
      as_number(value).map(Scalar::Float)
    }
  }

  /// Lossy conversion used once exactness is gone.
  pub fn as_f64(self) -> f64 {
    match self {
      Scalar::Int(n) => n as f64,
      Scalar::Float(x) => x,
    }
  }

  fn add(self, other: Scalar) -> Scalar {
    match (self, other) {
      (Scalar::Int(a), Scalar::Int(b)) => match a.checked_add(b) {
        Some(sum) => Scalar::Int(sum),
        None => Scalar::Float(a as f64 + b as f64),
      },
      (a, b) => Scalar::Float(a.as_f64() + b.as_f64()),
    }
  }

  fn less_than(self, other: Scalar) -> bool {
    match (self, other) {
      (Scalar::Int(a), Scalar::Int(b)) => a < b,
      (a, b) => a.as_f64() < b.as_f64(),
    }
  }

  /// JSON form. Integers outside the `i64`/`u64` range fall back to a float.
  pub fn to_json(self) -> Value {
    match self {
      Scalar::Int(n) => {
        if let Ok(n) = i64::try_from(n) {
          Value::from(n)
        } else if let Ok(n) = u64::try_from(n) {
          Value::from(n)
        } else {
          number(n as f64)
        }
      }
      Scalar::Float(x) => number(x),
    }
  }
}

/// Running state of one aggregation function.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
  /// Records (or present values) seen.
  Count(u64),
  /// Sum of numeric values.
  Sum(Scalar),
  /// Sum and count of numeric values.
  Avg {
    /// Sum of values.
    sum: Scalar,
    /// Number of values.
    count: u64,
  },
  /// Smallest value, if any.
  Min(Option<Scalar>),
  /// Largest value, if any.
  Max(Option<Scalar>),
  /// Cumulative sum.
  RunningTotal(Scalar),
}

impl Accumulator {
  /// Empty state for a function.
  pub fn new(function: AggregateFunction) -> Self {
    let zero = Scalar::Int(0);
    match function {
      AggregateFunction::Count => Accumulator::Count(0),
      AggregateFunction::Sum => Accumulator::Sum(zero),
      AggregateFunction::Avg => Accumulator::Avg { sum: zero, count: 0 },
      AggregateFunction::Min => Accumulator::Min(None),
      AggregateFunction::Max => Accumulator::Max(None),
      AggregateFunction::RunningTotal => Accumulator::RunningTotal(zero),
    }
  }

  /// Folds one numeric value in. Count ignores the value itself.
  pub fn push(&mut self, value: Scalar) {
    match self {
      Accumulator::Count(n) => *n += 1,
      Accumulator::Sum(sum) | Accumulator::RunningTotal(sum) => *sum = sum.add(value),
      Accumulator::Avg { sum, count } => {
        *sum = sum.add(value);
        *count += 1;
      }
      Accumulator::Min(min) => {
        if min.is_none_or(|m| value.less_than(m)) {
          *min = Some(value);
        }
      }
      Accumulator::Max(max) => {
        if max.is_none_or(|m| m.less_than(value)) {
          *max = Some(value);
        }
      }
    }
  }

  /// Current value as JSON. Empty avg/min/max are null; avg is always a float.
  pub fn value(&self) -> Value {
    match self {
      Accumulator::Count(n) => Value::from(*n),
      Accumulator::Sum(sum) | Accumulator::RunningTotal(sum) => sum.to_json(),
      Accumulator::Avg { count: 0, .. } => Value::Null,
      Accumulator::Avg { sum, count } => number(sum.as_f64() / *count as f64),
      Accumulator::Min(value) | Accumulator::Max(value) => value.map_or(Value::Null, Scalar::to_json),
    }
  }
}

fn number(value: f64) -> Value {
  Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// One named aggregation bound to its accumulator.
#[derive(Debug, Clone)]
pub struct Aggregator {
  spec: AggregationSpec,
  state: Accumulator,
}

impl Aggregator {
  /// Creates an empty aggregator.
  pub fn new(spec: AggregationSpec) -> Self {
    let state = Accumulator::new(spec.function);
    Self { spec, state }
  }

  /// Aggregation name.
  pub fn name(&self) -> &str {
    &self.spec.name
  }

  /// Aggregation function.
  pub fn function(&self) -> AggregateFunction {
    self.spec.function
  }

  /// Updates the accumulator from one record.
  ///
  /// `count` without a field counts every record; with a field it counts
  /// records where the field is present and not null. Every other function
  /// ignores records whose field is missing or not numeric.
  pub fn update(&mut self, record: &Record) {
    let resolved = self.spec.field.as_ref().map(|field| field.resolve(record));
    match (self.spec.function, resolved) {
      (AggregateFunction::Count, None) => self.state.push(Scalar::Int(1)),
      (AggregateFunction::Count, Some(Some(value))) if !value.is_null() => self.state.push(Scalar::Int(1)),
      (AggregateFunction::Count, _) => {}
      (_, Some(Some(value))) => {
        if let Some(n) = Scalar::from_json(value) {
          self.state.push(n);
        }
      }
      _ => {}
    }
  }

  /// Current value.
  pub fn value(&self) -> Value {
    self.state.value()
  }
}

/// The aggregations of one scope (global or a single group).
#[derive(Debug, Clone, Default)]
pub struct AggregateSet {
  aggregators: Vec<Aggregator>,
}

impl AggregateSet {
  /// Creates empty aggregators for `specs`.
  pub fn new(specs: &[AggregationSpec]) -> Self {
    Self {
      aggregators: specs.iter().cloned().map(Aggregator::new).collect(),
    }
  }

  /// Updates every aggregator from one record.
  pub fn update(&mut self, record: &Record) {
    for aggregator in &mut self.aggregators {
      aggregator.update(record);
    }
  }

  /// Current values by aggregation name.
  pub fn values(&self) -> BTreeMap<String, Value> {
    self
      .aggregators
      .iter()
      .map(|aggregator| (aggregator.name().to_string(), aggregator.value()))
      .collect()
  }

  /// Current `running_total` values, in declaration order.
  pub fn running_totals(&self) -> impl Iterator<Item = (&str, Value)> + '_ {
    self
      .aggregators
      .iter()
      .filter(|aggregator| aggregator.function() == AggregateFunction::RunningTotal)
      .map(|aggregator| (aggregator.name(), aggregator.value()))
  }

  /// True when no aggregations are configured.
  pub fn is_empty(&self) -> bool {
    self.aggregators.is_empty()
  }
}
