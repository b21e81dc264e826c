//! Records and field paths.
//!
//! A record is a JSON object as returned by a source adapter page. Aggregations
//! and groupings address fields with a [`FieldPath`], a dotted path that may
//! descend into nested objects and arrays (`customer.addresses.0.city`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One row moving through a pipeline.
pub type Record = Map<String, Value>;

/// Dotted path addressing a (possibly nested) field of a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FieldPath {
  segments: Vec<String>,
}

impl FieldPath {
  /// Parses a dotted path. Empty segments are ignored.
  pub fn new(path: &str) -> Self {
    Self {
      segments: path
        .split('.')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect(),
    }
  }

  /// Builds a path from pre-split segments.
  pub fn from_segments<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      segments: segments.into_iter().map(Into::into).collect(),
    }
  }

  /// Path segments, outermost first.
  pub fn segments(&self) -> &[String] {
    &self.segments
  }

  /// True when the path has no segments and therefore never resolves.
  pub fn is_empty(&self) -> bool {
    self.segments.is_empty()
  }

  /// Resolves the path against a record.
  ///
  /// Object segments are looked up by key; array segments must parse as an
  /// index. Returns `None` as soon as a segment does not resolve.
  pub fn resolve<'a>(&self, record: &'a Record) -> Option<&'a Value> {
    let (first, rest) = self.segments.split_first()?;
    let mut current = record.get(first)?;
    for segment in rest {
      current = match current {
        Value::Object(map) => map.get(segment)?,
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
        _ => return None,
      };
    }
    Some(current)
  }
}

impl From<&str> for FieldPath {
  fn from(path: &str) -> Self {
    FieldPath::new(path)
  }
}

impl From<String> for FieldPath {
  fn from(path: String) -> Self {
    FieldPath::new(&path)
  }
}

impl From<FieldPath> for String {
  fn from(path: FieldPath) -> Self {
    path.to_string()
  }
}

impl fmt::Display for FieldPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.segments.join("."))
  }
}

/// Reads a JSON value as a number. Strings, booleans and nulls are not numeric.
pub fn as_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(number) => number.as_f64(),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(value: Value) -> Record {
    match value {
      Value::Object(map) => map,
      _ => panic!("test record must be an object"),
    }
  }

  #[test]
  fn test_resolve_top_level() {
    let r = record(json!({"territory": "A", "amount": 10}));
    assert_eq!(FieldPath::new("territory").resolve(&r), Some(&json!("A")));
    assert_eq!(FieldPath::new("missing").resolve(&r), None);
  }

  #[test]
  fn test_resolve_nested_object_and_array() {
    let r = record(json!({
      "customer": {"addresses": [{"city": "Oslo"}, {"city": "Bergen"}]}
    }));
    assert_eq!(
      FieldPath::new("customer.addresses.1.city").resolve(&r),
      Some(&json!("Bergen"))
    );
    assert_eq!(FieldPath::new("customer.addresses.9.city").resolve(&r), None);
    assert_eq!(FieldPath::new("customer.addresses.x").resolve(&r), None);
  }

  #[test]
  fn test_resolve_through_scalar_fails() {
    let r = record(json!({"amount": 5}));
    assert_eq!(FieldPath::new("amount.cents").resolve(&r), None);
  }

  #[test]
  fn test_empty_path_never_resolves() {
    let r = record(json!({"": 1}));
    let path = FieldPath::new("");
    assert!(path.is_empty());
    assert_eq!(path.resolve(&r), None);
  }

  #[test]
  fn test_serde_as_string() {
    let path: FieldPath = serde_json::from_value(json!("a.b")).unwrap();
    assert_eq!(path.segments(), &["a".to_string(), "b".to_string()]);
    assert_eq!(serde_json::to_value(&path).unwrap(), json!("a.b"));
  }

  #[test]
  fn test_as_number() {
    assert_eq!(as_number(&json!(2)), Some(2.0));
    assert_eq!(as_number(&json!(2.5)), Some(2.5));
    assert_eq!(as_number(&json!("2")), None);
    assert_eq!(as_number(&Value::Null), None);
  }
}
