//! Per-record transforms applied by the Aggregate Stage.
//!
//! A transform must be free of side effects on pipeline state. Returning an
//! error (or panicking) skips that record only; the stage counts it in
//! `failed_count` and continues.

use crate::error::TransformError;
use crate::record::Record;

/// Maps one record to one output record.
pub trait RecordTransform: Send + Sync {
  /// Transforms a record.
  fn transform(&self, record: Record) -> Result<Record, TransformError>;
}

impl<F> RecordTransform for F
where
  F: Fn(Record) -> Result<Record, TransformError> + Send + Sync,
{
  fn transform(&self, record: Record) -> Result<Record, TransformError> {
    self(record)
  }
}

/// Passes records through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl RecordTransform for IdentityTransform {
  fn transform(&self, record: Record) -> Result<Record, TransformError> {
    Ok(record)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{Value, json};

  #[test]
  fn test_closure_transform() {
    let double = |mut record: Record| -> Result<Record, TransformError> {
      let amount = record
        .get("amount")
        .and_then(Value::as_i64)
        .ok_or_else(|| TransformError::new("amount missing"))?;
      record.insert("amount".into(), json!(amount * 2));
      Ok(record)
    };
    let mut input = Record::new();
    input.insert("amount".into(), json!(4));
    let output = double.transform(input).unwrap();
    assert_eq!(output["amount"], json!(8));
    assert!(double.transform(Record::new()).is_err());
  }

  #[test]
  fn test_identity() {
    let mut input = Record::new();
    input.insert("k".into(), json!("v"));
    assert_eq!(IdentityTransform.transform(input.clone()).unwrap(), input);
  }
}
