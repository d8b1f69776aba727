//! Core point and series types shared across the write, storage, and
//! query paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tag set for a point. A `BTreeMap` keeps tag keys in canonical order so
/// series keys are stable regardless of insertion order.
pub type Tags = BTreeMap<String, String>;

/// A single field value. JSON integers decode as `I64`, fractional
/// numbers as `F64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    String(String),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::I64(_) => FieldType::Integer,
            FieldValue::F64(_) => FieldType::Float,
            FieldValue::Bool(_) => FieldType::Boolean,
            FieldValue::String(_) => FieldType::String,
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        match self {
            FieldValue::I64(v) => serde_json::Value::from(*v),
            FieldValue::F64(v) => serde_json::Value::from(*v),
            FieldValue::Bool(v) => serde_json::Value::from(*v),
            FieldValue::String(v) => serde_json::Value::from(v.clone()),
        }
    }
}

/// The type of a measurement field, fixed by the first write observing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Float,
    Boolean,
    String,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::String => "string",
        };
        f.write_str(s)
    }
}

/// A fully normalized point, ready for routing and storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub name: String,
    #[serde(default)]
    pub tags: Tags,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub values: BTreeMap<String, FieldValue>,
}

impl Point {
    /// Canonical series key: measurement followed by `,key=value` pairs
    /// in tag-key order.
    pub fn series_key(&self) -> String {
        series_key(&self.name, &self.tags)
    }
}

/// Build the canonical series key for a measurement and tag set.
pub fn series_key(measurement: &str, tags: &Tags) -> String {
    let mut key = String::with_capacity(measurement.len() + tags.len() * 16);
    key.push_str(measurement);
    for (k, v) in tags {
        key.push(',');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

/// The measurement name of a series key.
pub fn measurement_of_key(series_key: &str) -> &str {
    match series_key.find(',') {
        Some(idx) => &series_key[..idx],
        None => series_key,
    }
}

/// FNV-1a 64-bit hash. The shard mapping and series identity depend on
/// this exact function; it must not change across versions.
pub fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Hash a series key for shard selection.
pub fn series_id_hash(series_key: &str) -> u64 {
    fnv1a64(series_key.as_bytes())
}
