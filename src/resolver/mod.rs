// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Nested-field resolution.
//!
//! An object field with a sub-query is resolved by running that query with the
//! parent's field values bound to its placeholders, then shaping the rows:
//!
//! | kind          | result                                                   |
//! |---------------|----------------------------------------------------------|
//! | `array`       | first column of every row                                |
//! | `object`      | first row as an object (`LIMIT 1` added), `null` if none |
//! | `objectArray` | every row as an object, `[]` if none                     |
//! | `joining`     | first column of every row joined by the separator        |
//! | `objectFlat`  | like `object`, but merged into the document              |
//!
//! Queries run on one engine-wide pool bounded by a semaphore. Several object
//! fields of the same row resolve concurrently; the first failure cancels the
//! rest and fails the row.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::coerce::{self, FieldType, FieldTypes};
use crate::error::SyncError;
use crate::event::Row;
use crate::mapping::{DocumentMapping, ObjectFieldKind, ObjectFieldSpec};
use crate::metrics;
use crate::sink::scalar_text;
use crate::source::{RowSource, SourceError};

pub struct NestedFieldResolver {
    source: Arc<dyn RowSource>,
    permits: Arc<Semaphore>,
}

impl NestedFieldResolver {
    /// `workers` bounds concurrent object-field queries across all rows.
    pub fn new(source: Arc<dyn RowSource>, workers: usize) -> Self {
        Self {
            source,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn source(&self) -> &Arc<dyn RowSource> {
        &self.source
    }

    /// Resolve one object field with explicit bind values.
    ///
    /// Fields without a sub-query resolve to `null`; those are reshaped inline
    /// with [`shape_inline`] instead.
    pub async fn resolve(
        &self,
        data_source: &str,
        field: &ObjectFieldSpec,
        binds: &[Value],
        types: &FieldTypes,
    ) -> Result<Value, SyncError> {
        run(self.source.as_ref(), &self.permits, data_source, field, binds, types).await
    }

    /// Resolve every sub-query object field of `mapping` for one parent row
    /// (keyed by output field names) and write the results into `delta`.
    pub async fn resolve_into(
        &self,
        mapping: &Arc<DocumentMapping>,
        parent: &Row,
        types: &Arc<FieldTypes>,
        delta: &mut Row,
    ) -> Result<(), SyncError> {
        let queried: Vec<usize> = mapping
            .object_fields
            .values()
            .enumerate()
            .filter(|(_, f)| f.child.is_some())
            .map(|(i, _)| i)
            .collect();

        match queried.as_slice() {
            [] => Ok(()),
            [only] => {
                let Some((_, field)) = mapping.object_fields.get_index(*only) else {
                    return Ok(());
                };
                let binds = field.child.as_ref().map(|c| c.binds_from_parent(parent)).unwrap_or_default();
                let value = self.resolve(&mapping.data_source_key, field, &binds, types).await?;
                put_object_value(delta, field, value);
                Ok(())
            }
            many => {
                let mut tasks: JoinSet<(usize, Result<Value, SyncError>)> = JoinSet::new();
                for &i in many {
                    let mapping = Arc::clone(mapping);
                    let source = Arc::clone(&self.source);
                    let permits = Arc::clone(&self.permits);
                    let types = Arc::clone(types);
                    let parent = parent.clone();
                    tasks.spawn(async move {
                        let Some((_, field)) = mapping.object_fields.get_index(i) else {
                            return (i, Ok(Value::Null));
                        };
                        let binds = field.child.as_ref().map(|c| c.binds_from_parent(&parent)).unwrap_or_default();
                        let result = run(source.as_ref(), &permits, &mapping.data_source_key, field, &binds, &types).await;
                        (i, result)
                    });
                }

                let mut values: Vec<Option<Value>> = vec![None; mapping.object_fields.len()];
                while let Some(joined) = tasks.join_next().await {
                    let (i, result) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            tasks.abort_all();
                            return Err(SyncError::resolution(
                                "object field task",
                                SourceError::Backend(e.to_string()),
                            ));
                        }
                    };
                    match result {
                        Ok(value) => values[i] = Some(value),
                        Err(e) => {
                            tasks.abort_all();
                            return Err(e);
                        }
                    }
                }

                // Declaration order, whatever order the queries finished in
                for (field, value) in mapping.object_fields.values().zip(values) {
                    if let Some(value) = value {
                        put_object_value(delta, field, value);
                    }
                }
                Ok(())
            }
        }
    }
}

async fn run(
    source: &dyn RowSource,
    permits: &Semaphore,
    data_source: &str,
    field: &ObjectFieldSpec,
    binds: &[Value],
    types: &FieldTypes,
) -> Result<Value, SyncError> {
    let Some(child) = &field.child else {
        return Ok(Value::Null);
    };
    let single_row = matches!(field.kind, ObjectFieldKind::Object | ObjectFieldKind::ObjectFlat);
    let sql = if single_row && !child.has_limit {
        format!("{} LIMIT 1", child.sql)
    } else {
        child.sql.clone()
    };

    let _permit = permits.acquire().await.map_err(|_| SyncError::ShuttingDown)?;
    let _timer = metrics::LatencyTimer::new("resolver", "query");
    let rows = match source.query(data_source, &sql, binds).await {
        Ok(rows) => rows,
        Err(e) => {
            metrics::record_resolver_query(field.kind.as_str(), "error");
            return Err(SyncError::resolution(format!("object field `{}`", field.name), e));
        }
    };
    metrics::record_resolver_query(field.kind.as_str(), "success");
    debug!(field = %field.name, kind = field.kind.as_str(), rows = rows.len(), "Object field resolved");
    Ok(shape(field, rows, types))
}

/// Shape sub-query rows into the field's value, coercing columns toward the
/// declared types of the field's properties.
pub fn shape(field: &ObjectFieldSpec, rows: Vec<Row>, types: &FieldTypes) -> Value {
    let props = match coerce::lookup(types, &field.name) {
        _ if field.kind == ObjectFieldKind::ObjectFlat => Some(types),
        Some(FieldType::Object(props)) => Some(props),
        _ => None,
    };
    let coerce_col = |column: &str, value: Value| match props {
        Some(props) => coerce::coerce_field(value, column, props),
        None => value,
    };
    let as_object = |row: Row| -> Value {
        Value::Object(row.into_iter().map(|(k, v)| {
            let v = coerce_col(&k, v);
            (k, v)
        }).collect())
    };
    let first_column = |row: Row| row.into_iter().next().map(|(k, v)| coerce_col(&k, v));

    match field.kind {
        ObjectFieldKind::Array => Value::Array(rows.into_iter().filter_map(first_column).collect()),
        ObjectFieldKind::Object | ObjectFieldKind::ObjectFlat => {
            rows.into_iter().next().map(as_object).unwrap_or(Value::Null)
        }
        ObjectFieldKind::ObjectArray => Value::Array(rows.into_iter().map(as_object).collect()),
        ObjectFieldKind::Joining => {
            let separator = field.separator.as_deref().unwrap_or(",");
            let mut joined = String::new();
            for value in rows.into_iter().filter_map(first_column) {
                if let Some(text) = scalar_text(&value).or_else(|| (!value.is_null()).then(|| value.to_string())) {
                    joined.push_str(&text);
                    joined.push_str(separator);
                }
            }
            let trimmed = joined.strip_suffix(separator).unwrap_or(&joined);
            Value::String(trimmed.to_string())
        }
    }
}

/// Reshape a field's own column value for an object field without sub-query.
pub fn shape_inline(field: &ObjectFieldSpec, value: Value) -> Value {
    match (field.kind, value) {
        (_, Value::Null) => Value::Null,
        (ObjectFieldKind::Array, Value::String(s)) => match field.separator.as_deref().filter(|sep| !sep.is_empty()) {
            Some(sep) => Value::Array(
                s.split(sep)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ),
            None => serde_json::from_str::<Value>(&s)
                .ok()
                .filter(Value::is_array)
                .unwrap_or_else(|| Value::Array(vec![Value::String(s)])),
        },
        (ObjectFieldKind::Object | ObjectFieldKind::ObjectArray | ObjectFieldKind::ObjectFlat, Value::String(s)) => {
            serde_json::from_str::<Value>(&s).unwrap_or(Value::String(s))
        }
        (_, other) => other,
    }
}

/// Write a resolved value under the field's name, or merge its keys for
/// `objectFlat`. A flat field that resolved to nothing writes nothing.
pub fn put_object_value(delta: &mut Row, field: &ObjectFieldSpec, value: Value) {
    if field.kind == ObjectFieldKind::ObjectFlat {
        if let Value::Object(map) = value {
            delta.extend(map);
        }
    } else {
        delta.insert(field.name.clone(), value);
    }
}
