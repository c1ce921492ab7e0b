//! Wire-form values.
//!
//! The untyped, JSON-ish shape a value has before normalization and after
//! `unwrap`. Conversions to and from `serde_json::Value` are lossless for
//! everything JSON can express; byte strings and timestamps only occur on
//! the stored side of the boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An untyped field value as it arrives on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Unsigned integers that may not fit `i64` are kept exact until
    /// coercion decides whether they are representable.
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// A timestamp as microseconds since the Unix epoch.
    DateTime(i64),
    Array(Vec<WireValue>),
    Object(BTreeMap<String, WireValue>),
}

impl WireValue {
    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Null)
    }
}

impl From<serde_json::Value> for WireValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => WireValue::Null,
            serde_json::Value::Bool(b) => WireValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    WireValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    WireValue::Uint(u)
                } else {
                    WireValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => WireValue::String(s),
            serde_json::Value::Array(items) => {
                WireValue::Array(items.into_iter().map(WireValue::from).collect())
            }
            serde_json::Value::Object(map) => WireValue::Object(
                map.into_iter().map(|(k, v)| (k, WireValue::from(v))).collect(),
            ),
        }
    }
}

impl From<WireValue> for serde_json::Value {
    fn from(value: WireValue) -> Self {
        match value {
            WireValue::Null => serde_json::Value::Null,
            WireValue::Bool(b) => serde_json::Value::Bool(b),
            WireValue::Int(i) => serde_json::Value::from(i),
            WireValue::Uint(u) => serde_json::Value::from(u),
            WireValue::Float(f) => {
                serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            WireValue::String(s) => serde_json::Value::String(s),
            // Byte strings have no JSON form; render them as an array of
            // numbers so diagnostics stay readable.
            WireValue::Bytes(b) => {
                serde_json::Value::Array(b.into_iter().map(serde_json::Value::from).collect())
            }
            WireValue::DateTime(micros) => serde_json::Value::from(micros),
            WireValue::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            WireValue::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}
