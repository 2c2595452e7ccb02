// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Decoded row-level change events.
//!
//! The transport that produced the event is not our concern: by the time a
//! [`ChangeEvent`] reaches the engine its rows are already ordered JSON maps
//! keyed by column name.
//!
//! # Old rows
//!
//! For `UPDATE` the old row carries the *previous* values of the columns that
//! changed. A column present in the old row with a value different from the
//! new row is considered changed; full pre-images work too since unchanged
//! columns compare equal.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// One relational row, column name → value, in column order.
pub type Row = serde_json::Map<String, Value>;

/// Row mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded change event for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source stream identity (the CDC destination name).
    pub source: String,
    /// Consumer group, when the transport has one.
    #[serde(default)]
    pub group: Option<String>,
    pub database: String,
    pub table: String,
    pub operation: Operation,
    /// New values; for DELETE the deleted row.
    pub new_rows: Vec<Row>,
    /// Previous values of changed columns, aligned with `new_rows`. UPDATE only.
    #[serde(default)]
    pub old_rows: Option<Vec<Row>>,
    /// Schema-change events carry no rows worth syncing.
    #[serde(default)]
    pub is_ddl: bool,
}

impl ChangeEvent {
    pub fn insert(source: &str, database: &str, table: &str, rows: Vec<Row>) -> Self {
        Self::new(source, database, table, Operation::Insert, rows, None)
    }

    pub fn update(source: &str, database: &str, table: &str, rows: Vec<Row>, old: Vec<Row>) -> Self {
        Self::new(source, database, table, Operation::Update, rows, Some(old))
    }

    pub fn delete(source: &str, database: &str, table: &str, rows: Vec<Row>) -> Self {
        Self::new(source, database, table, Operation::Delete, rows, None)
    }

    fn new(
        source: &str,
        database: &str,
        table: &str,
        operation: Operation,
        new_rows: Vec<Row>,
        old_rows: Option<Vec<Row>>,
    ) -> Self {
        Self {
            source: source.to_string(),
            group: None,
            database: database.to_string(),
            table: table.to_string(),
            operation,
            new_rows,
            old_rows,
            is_ddl: false,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Check row alignment. UPDATE must carry one old row per new row.
    pub fn validate(&self) -> Result<(), SyncError> {
        match (self.operation, &self.old_rows) {
            (Operation::Update, Some(old)) if old.len() != self.new_rows.len() => {
                Err(SyncError::MalformedEvent(format!(
                    "{}.{}: {} new rows but {} old rows",
                    self.database,
                    self.table,
                    self.new_rows.len(),
                    old.len()
                )))
            }
            (Operation::Update, None) => Err(SyncError::MalformedEvent(format!(
                "{}.{}: UPDATE without old rows",
                self.database, self.table
            ))),
            _ => Ok(()),
        }
    }

    /// Old row aligned with `new_rows[idx]`.
    pub fn old_row(&self, idx: usize) -> Option<&Row> {
        self.old_rows.as_ref().and_then(|rows| rows.get(idx))
    }
}

/// Case-insensitive column lookup. Exact match wins.
pub fn row_get<'a>(row: &'a Row, column: &str) -> Option<&'a Value> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    })
}

/// Column value or JSON null.
pub fn row_value(row: &Row, column: &str) -> Value {
    row_get(row, column).cloned().unwrap_or(Value::Null)
}

/// Lower-cased names of the columns an UPDATE changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    columns: HashSet<String>,
}

impl ChangeSet {
    pub fn between(new: &Row, old: &Row) -> Self {
        let columns = old
            .iter()
            .filter(|(col, prev)| row_get(new, col) != Some(*prev))
            .map(|(col, _)| col.to_ascii_lowercase())
            .collect();
        Self { columns }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains(&column.to_ascii_lowercase())
    }

    pub fn insert(&mut self, column: &str) {
        self.columns.insert(column.to_ascii_lowercase());
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }
}
