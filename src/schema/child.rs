// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object-field sub-queries.
//!
//! A child query reads one table and refers back to the parent document
//! through `${field}` placeholders:
//!
//! ```sql
//! SELECT r.role_name FROM user_role r WHERE r.user_id = '${_id}'
//! ```
//!
//! Placeholders are replaced by positional `?` binds; every `col = ${field}`
//! comparison is also recorded as a [`ParentBinding`] so that a change on the
//! child table can locate the parent documents it feeds.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::{parse, ColumnRef, RelationPair, SchemaError, SchemaGraph, TableSpec};
use crate::event::{row_value, Row};

/// Alias of the synthetic table standing for the parent document.
pub const PARENT_PSEUDO_TABLE: &str = "$_main";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"['"]?\$\{\s*([^}\s]+)\s*\}['"]?"#).expect("placeholder pattern")
});

static BINDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z0-9_.`]+)\s*=\s*['"]?\$\{\s*([^}\s]+)\s*\}['"]?"#).expect("binding pattern")
});

static LIMIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\blimit\b").expect("limit pattern"));

/// `child_column = ${parent_field}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentBinding {
    pub child_column: ColumnRef,
    /// Output field of the parent view, as declared there.
    pub parent_field: String,
}

/// Schema graph of an object-field sub-query.
#[derive(Debug, Clone)]
pub struct ChildSchemaGraph {
    pub graph: SchemaGraph,
    /// SQL with every placeholder replaced by `?`.
    pub sql: String,
    /// Parent field bound to each `?`, in textual order.
    pub binds: Vec<String>,
    pub bindings: Vec<ParentBinding>,
    /// The `$_main` pseudo-table; its relations mirror `bindings`.
    pub parent: TableSpec,
    pub has_limit: bool,
}

impl ChildSchemaGraph {
    /// The single table the sub-query reads.
    pub fn table(&self) -> &TableSpec {
        self.graph.main_table()
    }

    /// Columns the sub-query selects or binds on, used for change detection.
    pub fn watched_columns(&self) -> impl Iterator<Item = &str> {
        self.graph
            .fields
            .values()
            .flat_map(|f| f.columns.iter())
            .chain(self.bindings.iter().map(|b| &b.child_column))
            .map(|c| c.column.as_str())
    }

    /// Bind values for [`Self::sql`] taken from the parent document fields.
    pub fn binds_from_parent(&self, parent: &Row) -> Vec<Value> {
        self.binds.iter().map(|f| row_value(parent, f)).collect()
    }

    /// Parent keys a row of the child table stands for.
    ///
    /// Each binding contributes its column value as a candidate for its
    /// parent field. One partial parent row is returned per combination of
    /// distinct non-null candidates; a field with no such candidate matches
    /// no parent, so the result is empty. Feed each row to
    /// [`Self::binds_from_parent`] to get the bind values matching it.
    pub fn parent_keys_from_child(&self, child: &Row) -> Vec<Row> {
        let mut candidates: Vec<(&str, Vec<Value>)> = Vec::new();
        for binding in &self.bindings {
            let slot = match candidates
                .iter()
                .position(|(field, _)| field.eq_ignore_ascii_case(&binding.parent_field))
            {
                Some(i) => i,
                None => {
                    candidates.push((binding.parent_field.as_str(), Vec::new()));
                    candidates.len() - 1
                }
            };
            let value = row_value(child, &binding.child_column.column);
            let values = &mut candidates[slot].1;
            if !value.is_null() && !values.contains(&value) {
                values.push(value);
            }
        }

        let mut keys = vec![Row::new()];
        for (field, values) in &candidates {
            let mut next = Vec::with_capacity(keys.len() * values.len());
            for key in &keys {
                for value in values {
                    let mut key = key.clone();
                    key.insert((*field).to_string(), value.clone());
                    next.push(key);
                }
            }
            keys = next;
        }
        keys
    }
}

/// Parse an object-field sub-query against its parent view.
pub fn parse_child(sql: &str, parent: &SchemaGraph) -> Result<ChildSchemaGraph, SchemaError> {
    let mut binds = Vec::new();
    for cap in PLACEHOLDER.captures_iter(sql) {
        binds.push(parent_field(parent, &cap[1])?);
    }

    let substituted = PLACEHOLDER.replace_all(sql, "?").into_owned();
    let graph = parse(&substituted)?;
    if graph.tables.len() != 1 {
        return Err(SchemaError::Parse(format!(
            "object-field query must read exactly one table, found {}",
            graph.tables.len()
        )));
    }
    let child_alias = graph.main_alias().to_string();

    let mut bindings = Vec::new();
    for cap in BINDING.captures_iter(sql) {
        let column_expr = cap[1].replace('`', "");
        let (owner, column) = match column_expr.rsplit_once('.') {
            Some((owner, column)) => (owner.rsplit('.').next().unwrap_or(owner), column),
            None => (child_alias.as_str(), column_expr.as_str()),
        };
        if !owner.eq_ignore_ascii_case(&child_alias) {
            return Err(SchemaError::Parse(format!(
                "placeholder binding `{}` does not refer to table `{child_alias}`",
                &cap[1]
            )));
        }
        bindings.push(ParentBinding {
            child_column: ColumnRef::new(&child_alias, column),
            parent_field: parent_field(parent, &cap[2])?,
        });
    }
    if bindings.is_empty() {
        return Err(SchemaError::Parse(
            "object-field query has no `column = ${field}` reference to its parent".into(),
        ));
    }

    let mut pseudo = TableSpec::physical(
        PARENT_PSEUDO_TABLE.to_string(),
        None,
        PARENT_PSEUDO_TABLE.to_string(),
    );
    pseudo.relations = bindings
        .iter()
        .map(|b| RelationPair {
            left: ColumnRef::new(PARENT_PSEUDO_TABLE, &b.parent_field),
            right: b.child_column.clone(),
        })
        .collect();

    Ok(ChildSchemaGraph {
        has_limit: LIMIT.is_match(&substituted),
        graph,
        sql: substituted,
        binds,
        bindings,
        parent: pseudo,
    })
}

fn parent_field(parent: &SchemaGraph, name: &str) -> Result<String, SchemaError> {
    parent
        .field(name)
        .map(|f| f.name.clone())
        .ok_or_else(|| {
            SchemaError::Parse(format!(
                "placeholder ${{{name}}} does not name an output field of the parent query"
            ))
        })
}
