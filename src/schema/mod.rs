// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Schema graph of a declared view.
//!
//! A mapping declares its document shape as one SELECT. [`parse`] turns that
//! text into a [`SchemaGraph`]: which tables feed the document, how they are
//! joined, and which columns every output field is computed from. The sync
//! engine never looks at SQL text again; every decision is made against the
//! graph.
//!
//! ```
//! use index_sync::schema::parse;
//!
//! let graph = parse("SELECT a.id, a.name, b.tag FROM orders a JOIN tags b ON a.tag_id = b.id").unwrap();
//! assert_eq!(graph.main_table().table, "orders");
//! assert_eq!(graph.tables.len(), 2);
//! assert!(!graph.fields["name"].computed);
//! ```
//!
//! # Design
//!
//! - **Column provenance**: every [`FieldSpec`] lists the `(owner alias, column)`
//!   pairs it reads. Unqualified columns are attributed to the main table.
//! - **Relation pairs**: ON-clause equalities are attached to the joined
//!   (right-hand) table. Anything other than a conjunction of column
//!   equalities is rejected at load time.
//! - **Derived tables**: a subquery in FROM is parsed into its own graph; the
//!   outer [`TableSpec`] is backed by the subquery's main table.

mod child;
mod parser;
mod rewrite;

pub use child::{parse_child, ChildSchemaGraph, ParentBinding, PARENT_PSEUDO_TABLE};
pub use parser::parse;
pub use rewrite::{placeholder_expression, PlaceholderExpr};

use indexmap::IndexMap;
use sqlparser::ast::Query;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("SQL parse error: {0}")]
    Parse(String),
    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),
}

/// A column read by a field or a join condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    /// Alias of the table the column belongs to.
    pub owner: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(owner: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            column: column.into(),
        }
    }

    pub fn is_owned_by(&self, alias: &str) -> bool {
        self.owner.eq_ignore_ascii_case(alias)
    }

    pub fn same_as(&self, other: &ColumnRef) -> bool {
        self.is_owned_by(&other.owner) && self.column.eq_ignore_ascii_case(&other.column)
    }

    /// `alias.column`, as used in generated filter conditions.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.owner, self.column)
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.owner, self.column)
    }
}

/// One output field of the view.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Output name (alias, or the bare column name).
    pub name: String,
    /// Expression text as written.
    pub expr: String,
    /// Referenced columns in textual order.
    pub columns: Vec<ColumnRef>,
    /// Anything other than a bare column reference or a literal.
    pub computed: bool,
    pub literal: bool,
}

impl FieldSpec {
    pub fn is_simple(&self) -> bool {
        !self.computed
    }

    /// The column a simple field mirrors.
    pub fn column(&self) -> Option<&ColumnRef> {
        self.columns.first()
    }

    pub fn references(&self, alias: &str) -> bool {
        self.columns.iter().any(|c| c.is_owned_by(alias))
    }

    /// True for a simple field that is a plain copy of `col`.
    pub fn mirrors(&self, col: &ColumnRef) -> bool {
        self.is_simple() && self.column().is_some_and(|c| c.same_as(col))
    }
}

/// Equality `left = right` from an ON clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationPair {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

impl RelationPair {
    /// `(own side, other side)` as seen from table `alias`.
    pub fn sides(&self, alias: &str) -> Option<(&ColumnRef, &ColumnRef)> {
        if self.left.is_owned_by(alias) {
            Some((&self.left, &self.right))
        } else if self.right.is_owned_by(alias) {
            Some((&self.right, &self.left))
        } else {
            None
        }
    }
}

/// One join column of a non-main table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKey {
    /// Column of the joined table itself.
    pub own: ColumnRef,
    /// Column it is compared with.
    pub other: ColumnRef,
    /// Simple output fields that mirror either side of the equality.
    pub exposed: Vec<String>,
}

/// One FROM-clause source.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub alias: String,
    pub schema: Option<String>,
    /// Physical table; for a derived table, the subquery's main table.
    pub table: String,
    pub is_main: bool,
    pub is_subquery: bool,
    pub subquery_sql: Option<String>,
    /// Output fields of the subquery, by name.
    pub subquery_fields: IndexMap<String, FieldSpec>,
    /// Equalities binding this table to the rest of the graph.
    pub relations: Vec<RelationPair>,
    /// Aliases of the tables read inside the subquery.
    pub nested: Vec<String>,
}

impl TableSpec {
    pub(crate) fn physical(alias: String, schema: Option<String>, table: String) -> Self {
        Self {
            alias,
            schema,
            table,
            is_main: false,
            is_subquery: false,
            subquery_sql: None,
            subquery_fields: IndexMap::new(),
            relations: Vec::new(),
            nested: Vec::new(),
        }
    }

    pub fn backs(&self, table: &str) -> bool {
        self.table.eq_ignore_ascii_case(table)
    }

    /// Base-table column behind an output column of a derived table.
    ///
    /// Plain tables return the column unchanged.
    pub fn source_column<'a>(&'a self, column: &'a str) -> &'a str {
        if !self.is_subquery {
            return column;
        }
        self.subquery_fields
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .and_then(|(_, f)| f.column())
            .map(|c| c.column.as_str())
            .unwrap_or(column)
    }
}

/// Parsed view: output fields, sources, and how the sources are related.
#[derive(Debug, Clone)]
pub struct SchemaGraph {
    /// Root SQL as declared.
    pub sql: String,
    pub fields: IndexMap<String, FieldSpec>,
    pub tables: IndexMap<String, TableSpec>,
    main_alias: String,
    query: Query,
}

impl SchemaGraph {
    pub fn main_table(&self) -> &TableSpec {
        &self.tables[&self.main_alias]
    }

    pub fn main_alias(&self) -> &str {
        &self.main_alias
    }

    /// Case-insensitive field lookup.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .get(name)
            .or_else(|| self.fields.values().find(|f| f.name.eq_ignore_ascii_case(name)))
    }

    pub fn table(&self, alias: &str) -> Option<&TableSpec> {
        self.tables
            .get(alias)
            .or_else(|| self.tables.values().find(|t| t.alias.eq_ignore_ascii_case(alias)))
    }

    /// One physical table, no derived source.
    pub fn is_single_table(&self) -> bool {
        self.tables.len() == 1 && !self.main_table().is_subquery
    }

    pub fn all_fields_simple(&self) -> bool {
        self.fields.values().all(FieldSpec::is_simple)
    }

    /// Sources backed by `table` (a table may be joined more than once).
    pub fn tables_backed_by<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a TableSpec> + 'a {
        self.tables.values().filter(move |t| t.backs(table))
    }

    /// Fields that read at least one column of `alias`.
    pub fn contributed_fields(&self, alias: &str) -> Vec<&FieldSpec> {
        self.fields.values().filter(|f| f.references(alias)).collect()
    }

    /// Join columns of a non-main table with the fields exposing them.
    pub fn join_keys(&self, alias: &str) -> Vec<JoinKey> {
        let Some(table) = self.table(alias) else {
            return Vec::new();
        };
        table
            .relations
            .iter()
            .filter_map(|pair| pair.sides(&table.alias))
            .map(|(own, other)| JoinKey {
                own: own.clone(),
                other: other.clone(),
                exposed: self
                    .fields
                    .values()
                    .filter(|f| f.mirrors(own) || f.mirrors(other))
                    .map(|f| f.name.clone())
                    .collect(),
            })
            .collect()
    }

    /// Main-table columns that feed the join of a non-main table.
    pub fn foreign_key_columns(&self, alias: &str) -> Vec<ColumnRef> {
        self.join_keys(alias)
            .into_iter()
            .map(|k| k.other)
            .filter(|c| c.is_owned_by(&self.main_alias))
            .collect()
    }

    /// Root query with `condition` AND-ed into its WHERE clause.
    pub fn with_condition(&self, condition: &str) -> Result<String, SchemaError> {
        rewrite::with_condition(&self.query, condition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(sql: &str) -> SchemaGraph {
        parse(sql).unwrap()
    }

    #[test]
    fn test_join_keys_report_exposed_fields() {
        let g = graph("SELECT a.id, a.tag_id, b.tag FROM orders a LEFT JOIN tags b ON a.tag_id = b.id");
        let keys = g.join_keys("b");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].own, ColumnRef::new("b", "id"));
        assert_eq!(keys[0].other, ColumnRef::new("a", "tag_id"));
        assert_eq!(keys[0].exposed, vec!["tag_id".to_string()]);
    }

    #[test]
    fn test_join_keys_without_exposed_field() {
        let g = graph("SELECT a.id, a.name, b.tag FROM orders a JOIN tags b ON a.tag_id = b.id");
        let keys = g.join_keys("b");
        assert!(keys[0].exposed.is_empty());
        assert_eq!(g.foreign_key_columns("b"), vec![ColumnRef::new("a", "tag_id")]);
    }

    #[test]
    fn test_contributed_fields() {
        let g = graph(
            "SELECT a.id, CONCAT(b.tag, '-', a.name) AS label, b.tag FROM orders a JOIN tags b ON a.tag_id = b.id",
        );
        let names: Vec<_> = g.contributed_fields("b").iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["label", "tag"]);
        assert!(!g.is_single_table());
    }

    #[test]
    fn test_relation_pair_sides() {
        let pair = RelationPair {
            left: ColumnRef::new("a", "tag_id"),
            right: ColumnRef::new("b", "id"),
        };
        let (own, other) = pair.sides("B").unwrap();
        assert_eq!(own.column, "id");
        assert_eq!(other.column, "tag_id");
        assert!(pair.sides("c").is_none());
    }

    #[test]
    fn test_field_lookup_is_case_insensitive() {
        let g = graph("SELECT u.id, u.UserName FROM users u");
        assert!(g.field("username").is_some());
        assert!(g.is_single_table());
        assert!(g.all_fields_simple());
    }
}
