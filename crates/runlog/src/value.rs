// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Values accepted by `Run::log`.
//!
//! [`LogValue`] is closed. Two traits leave room for callers' own types:
//! [`ReducesToScalar`] for framework tensors that may collapse to a number,
//! and [`CustomValue`] for structured values registered under their own type
//! name.

use std::fmt;

use serde_json::Value;

use crate::error::RunError;
use crate::file::File;

/// A tensor-like value that may be reduced to a single number.
pub trait ReducesToScalar: Send + Sync {
    /// Dimensions; empty for a 0-d value.
    fn shape(&self) -> Vec<usize>;

    /// `None` unless the value holds exactly one element.
    fn to_scalar(&self) -> Option<f64>;
}

/// A structured value that ships on the data stream under its own type name.
pub trait CustomValue: Send + Sync {
    fn type_name(&self) -> &str;

    fn to_json(&self) -> Value;
}

pub enum LogValue {
    Int(i64),
    Float(f64),
    Tensor(Box<dyn ReducesToScalar>),
    Json(Value),
    Custom(Box<dyn CustomValue>),
    File(File),
    List(Vec<LogValue>),
}

impl fmt::Debug for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::Int(v) => f.debug_tuple("Int").field(v).finish(),
            LogValue::Float(v) => f.debug_tuple("Float").field(v).finish(),
            LogValue::Tensor(t) => f.debug_tuple("Tensor").field(&t.shape()).finish(),
            LogValue::Json(v) => f.debug_tuple("Json").field(v).finish(),
            LogValue::Custom(c) => f.debug_tuple("Custom").field(&c.type_name()).finish(),
            LogValue::File(file) => f.debug_tuple("File").field(file).finish(),
            LogValue::List(items) => f.debug_tuple("List").field(items).finish(),
        }
    }
}

impl LogValue {
    /// Numbers become `Int`/`Float`, a top-level array becomes a `List`,
    /// anything else stays JSON.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    LogValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    LogValue::Float(f)
                } else {
                    LogValue::Json(Value::Number(n))
                }
            }
            Value::Array(items) => LogValue::List(items.into_iter().map(Self::json_item).collect()),
            other => LogValue::Json(other),
        }
    }

    // Nested arrays inside a list stay JSON so they are not scattered twice.
    fn json_item(value: Value) -> Self {
        match value {
            Value::Array(_) => LogValue::Json(value),
            other => Self::from_json(other),
        }
    }
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for LogValue {
            fn from(v: $t) -> Self {
                LogValue::Int(i64::from(v))
            }
        })*
    };
}

from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for LogValue {
    fn from(v: f32) -> Self {
        LogValue::Float(f64::from(v))
    }
}

impl From<f64> for LogValue {
    fn from(v: f64) -> Self {
        LogValue::Float(v)
    }
}

impl From<bool> for LogValue {
    fn from(v: bool) -> Self {
        LogValue::Json(Value::Bool(v))
    }
}

impl From<&str> for LogValue {
    fn from(v: &str) -> Self {
        LogValue::Json(Value::String(v.to_string()))
    }
}

impl From<String> for LogValue {
    fn from(v: String) -> Self {
        LogValue::Json(Value::String(v))
    }
}

impl From<Value> for LogValue {
    fn from(v: Value) -> Self {
        LogValue::from_json(v)
    }
}

impl From<File> for LogValue {
    fn from(v: File) -> Self {
        LogValue::File(v)
    }
}

impl From<Box<dyn ReducesToScalar>> for LogValue {
    fn from(v: Box<dyn ReducesToScalar>) -> Self {
        LogValue::Tensor(v)
    }
}

impl From<Box<dyn CustomValue>> for LogValue {
    fn from(v: Box<dyn CustomValue>) -> Self {
        LogValue::Custom(v)
    }
}

impl<T: Into<LogValue>> From<Vec<T>> for LogValue {
    fn from(v: Vec<T>) -> Self {
        LogValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// One `log()` call: field names to values, in insertion order.
#[derive(Debug, Default)]
pub struct Payload {
    fields: Vec<(String, LogValue)>,
}

impl Payload {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<LogValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<LogValue>) {
        self.fields.push((name.into(), value.into()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn into_fields(self) -> Vec<(String, LogValue)> {
        self.fields
    }
}

impl<K: Into<String>, V: Into<LogValue>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Only a JSON object is a valid payload.
impl TryFrom<Value> for Payload {
    type Error = RunError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(RunError::Usage(format!(
                "log payload must be a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_numbers() {
        assert!(matches!(LogValue::from_json(json!(3)), LogValue::Int(3)));
        assert!(matches!(LogValue::from_json(json!(0.5)), LogValue::Float(f) if f == 0.5));
        assert!(matches!(LogValue::from_json(json!("a")), LogValue::Json(_)));
        assert!(matches!(LogValue::from_json(json!(true)), LogValue::Json(_)));
    }

    #[test]
    fn test_from_json_scatters_only_top_level() {
        match LogValue::from_json(json!([1, [2, 3], "x"])) {
            LogValue::List(items) => {
                assert_eq!(items.len(), 3);
                assert!(matches!(items[0], LogValue::Int(1)));
                assert!(matches!(&items[1], LogValue::Json(Value::Array(a)) if a.len() == 2));
                assert!(matches!(&items[2], LogValue::Json(Value::String(s)) if s == "x"));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_from_object() {
        let payload = Payload::try_from(json!({"loss": 0.1, "note": "ok"})).unwrap();
        assert_eq!(payload.len(), 2);
        let mut names: Vec<&str> = payload.names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["loss", "note"]);
    }

    #[test]
    fn test_payload_rejects_non_object() {
        let err = Payload::try_from(json!([1, 2])).unwrap_err();
        assert!(matches!(err, RunError::Usage(ref m) if m.contains("array")));
    }

    #[test]
    fn test_builder_keeps_order() {
        let payload = Payload::new().with("b", 1).with("a", 2.5).with("c", "x");
        assert_eq!(payload.names().collect::<Vec<_>>(), vec!["b", "a", "c"]);
    }
}
