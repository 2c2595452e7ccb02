// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Value coercion toward the target index's declared field types.
//!
//! Relational drivers hand us whatever their native types decode to: TINYINT(1)
//! flags arrive as `0`/`1`, decimals as strings, datetimes as
//! `YYYY-MM-DD HH:MM:SS`. The document store wants the type its mapping
//! declares. Unknown fields pass through untouched.

use std::sync::Arc;

use base64::Engine as _;
use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::{Number, Value};

use crate::mapping::IndexIdentity;

/// Declared type of a target field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Text,
    Keyword,
    Long,
    Integer,
    Short,
    Byte,
    Double,
    Float,
    Boolean,
    Date,
    Binary,
    /// Nested properties of an object field.
    Object(FieldTypes),
    Other(String),
}

impl FieldType {
    /// Map a store type name (`"keyword"`, `"long"`, ...) to a variant.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "text" => FieldType::Text,
            "keyword" | "string" => FieldType::Keyword,
            "long" => FieldType::Long,
            "integer" | "int" => FieldType::Integer,
            "short" => FieldType::Short,
            "byte" => FieldType::Byte,
            "double" | "scaled_float" => FieldType::Double,
            "float" | "half_float" => FieldType::Float,
            "boolean" | "bool" => FieldType::Boolean,
            "date" | "date_nanos" => FieldType::Date,
            "binary" => FieldType::Binary,
            "object" | "nested" => FieldType::Object(FieldTypes::default()),
            other => FieldType::Other(other.to_string()),
        }
    }
}

/// Field name → declared type.
pub type FieldTypes = IndexMap<String, FieldType>;

/// Coerce `value` toward `ty`. Values that cannot be converted pass through.
pub fn coerce(value: Value, ty: Option<&FieldType>) -> Value {
    let Some(ty) = ty else {
        return value;
    };
    if value.is_null() {
        return value;
    }
    match ty {
        FieldType::Text | FieldType::Keyword => match value {
            Value::String(_) => value,
            Value::Bool(b) => Value::String(b.to_string()),
            Value::Number(n) => Value::String(n.to_string()),
            other => Value::String(other.to_string()),
        },
        FieldType::Long | FieldType::Integer | FieldType::Short | FieldType::Byte => {
            to_integer(&value).map(Value::from).unwrap_or(value)
        }
        FieldType::Double | FieldType::Float => to_float(&value)
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(value),
        FieldType::Boolean => to_bool(&value).map(Value::Bool).unwrap_or(value),
        FieldType::Date => match &value {
            Value::String(s) => Value::String(normalize_date(s)),
            _ => value,
        },
        FieldType::Binary => match &value {
            Value::Array(bytes) => {
                let raw: Option<Vec<u8>> = bytes
                    .iter()
                    .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect();
                raw.map(|raw| Value::String(base64::engine::general_purpose::STANDARD.encode(raw)))
                    .unwrap_or(value)
            }
            _ => value,
        },
        FieldType::Object(_) => match &value {
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(|v| v.is_object() || v.is_array())
                .unwrap_or(value),
            _ => value,
        },
        FieldType::Other(_) => value,
    }
}

/// Coerce a value read from the source, given the field types of its index.
pub fn coerce_field(value: Value, field: &str, types: &FieldTypes) -> Value {
    coerce(value, lookup(types, field))
}

/// Case-insensitive type lookup.
pub fn lookup<'a>(types: &'a FieldTypes, field: &str) -> Option<&'a FieldType> {
    types
        .get(field)
        .or_else(|| types.iter().find(|(k, _)| k.eq_ignore_ascii_case(field)).map(|(_, v)| v))
}

fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
        }
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        // TINYINT(1) / BIT(1) flags
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "y" | "yes" => Some(true),
            "0" | "false" | "f" | "n" | "no" => Some(false),
            _ => None,
        },
        Value::Array(bytes) if bytes.len() == 1 => bytes[0].as_u64().map(|b| b != 0),
        _ => None,
    }
}

/// `2024-01-02 03:04:05` → `2024-01-02T03:04:05.000`. Date-only values are kept.
fn normalize_date(s: &str) -> String {
    let trimmed = s.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return d.format("%Y-%m-%d").to_string();
    }
    s.to_string()
}

/// Immutable per-index snapshots of declared field types.
///
/// Snapshots are fetched once per index and swapped whole; readers never see
/// a partially filled map.
#[derive(Debug, Default)]
pub struct FieldTypeCache {
    snapshots: DashMap<IndexIdentity, Arc<FieldTypes>>,
}

impl FieldTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: &IndexIdentity) -> Option<Arc<FieldTypes>> {
        self.snapshots.get(index).map(|s| Arc::clone(s.value()))
    }

    pub fn insert(&self, index: IndexIdentity, types: FieldTypes) -> Arc<FieldTypes> {
        let snapshot = Arc::new(types);
        self.snapshots.insert(index, Arc::clone(&snapshot));
        snapshot
    }

    /// Forget a snapshot, e.g. after the index mapping changed.
    pub fn invalidate(&self, index: &IndexIdentity) {
        self.snapshots.remove(index);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
