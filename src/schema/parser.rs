// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SELECT → [`SchemaGraph`].

use std::ops::ControlFlow;

use indexmap::IndexMap;
use sqlparser::ast::{
    visit_expressions, BinaryOperator, Expr, Ident, JoinConstraint, JoinOperator, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use super::{ColumnRef, FieldSpec, RelationPair, SchemaError, SchemaGraph, TableSpec};

/// Parse a declared view into a schema graph.
///
/// Fails on malformed SQL, on anything but a single plain SELECT, when the
/// FROM clause yields no table, when the projection is empty, and on ON
/// conditions that are not conjunctions of column equalities.
pub fn parse(sql: &str) -> Result<SchemaGraph, SchemaError> {
    let dialect = MySqlDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| SchemaError::Parse(e.to_string()))?;
    if statements.len() != 1 {
        return Err(SchemaError::Parse(format!(
            "expected exactly one statement, found {}",
            statements.len()
        )));
    }
    match statements.remove(0) {
        Statement::Query(query) => build_graph(sql.trim(), *query, true),
        other => Err(SchemaError::Parse(format!("expected a SELECT, found `{other}`"))),
    }
}

fn build_graph(sql: &str, query: Query, allow_derived: bool) -> Result<SchemaGraph, SchemaError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select.as_ref(),
        other => {
            return Err(SchemaError::UnsupportedExpression(format!(
                "only a plain SELECT can declare a document, found `{other}`"
            )))
        }
    };

    let mut walker = FromWalker {
        tables: IndexMap::new(),
        allow_derived,
    };
    walker.walk_from(&select.from)?;
    let mut tables = walker.tables;

    let main_alias = match tables.first_mut() {
        Some((alias, table)) => {
            table.is_main = true;
            alias.clone()
        }
        None => return Err(SchemaError::Parse("FROM clause yields no tables".into())),
    };

    let fields = project(select, &main_alias)?;
    if fields.is_empty() {
        return Err(SchemaError::Parse("SELECT declares no output fields".into()));
    }

    // Default owners were filled in with the main alias; explicit ones must exist.
    let relation_columns = tables
        .values()
        .flat_map(|t| t.relations.iter())
        .flat_map(|p| [&p.left, &p.right]);
    let field_columns = fields.values().flat_map(|f| f.columns.iter());
    for col in relation_columns.chain(field_columns) {
        if !tables.keys().any(|alias| col.is_owned_by(alias)) {
            return Err(SchemaError::Parse(format!(
                "column `{col}` refers to unknown table alias `{}`",
                col.owner
            )));
        }
    }

    Ok(SchemaGraph {
        sql: sql.to_string(),
        fields,
        tables,
        main_alias,
        query,
    })
}

struct FromWalker {
    tables: IndexMap<String, TableSpec>,
    allow_derived: bool,
}

impl FromWalker {
    fn walk_from(&mut self, from: &[TableWithJoins]) -> Result<(), SchemaError> {
        if from.len() > 1 {
            return Err(SchemaError::UnsupportedExpression(
                "comma-separated FROM sources; join them with JOIN ... ON".into(),
            ));
        }
        for twj in from {
            self.walk_joins(twj)?;
        }
        Ok(())
    }

    fn walk_joins(&mut self, twj: &TableWithJoins) -> Result<(), SchemaError> {
        self.walk_factor(&twj.relation)?;
        for join in &twj.joins {
            let alias = self.walk_factor(&join.relation)?;
            let on = match &join.join_operator {
                JoinOperator::Inner(c)
                | JoinOperator::LeftOuter(c)
                | JoinOperator::RightOuter(c)
                | JoinOperator::FullOuter(c) => match c {
                    JoinConstraint::On(expr) => expr,
                    other => {
                        return Err(SchemaError::UnsupportedExpression(format!(
                            "join of `{alias}` must use ON, found {other:?}"
                        )))
                    }
                },
                other => {
                    return Err(SchemaError::UnsupportedExpression(format!(
                        "join kind {other:?} for `{alias}`"
                    )))
                }
            };
            let main = self.main_alias();
            let mut pairs = Vec::new();
            collect_equalities(on, &main, &mut pairs)?;
            if let Some(table) = self.tables.get_mut(&alias) {
                table.relations.extend(pairs);
            }
        }
        Ok(())
    }

    fn main_alias(&self) -> String {
        self.tables.keys().next().cloned().unwrap_or_default()
    }

    /// Register one source and return its alias.
    fn walk_factor(&mut self, factor: &TableFactor) -> Result<String, SchemaError> {
        let spec = match factor {
            TableFactor::Table { name, alias, .. } => {
                let mut parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
                let table = parts
                    .pop()
                    .ok_or_else(|| SchemaError::Parse("empty table name".into()))?;
                let schema = parts.pop();
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| table.clone());
                TableSpec::physical(alias, schema, table)
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                if !self.allow_derived {
                    return Err(SchemaError::UnsupportedExpression(
                        "derived tables nested more than one level".into(),
                    ));
                }
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .ok_or_else(|| SchemaError::Parse("derived table without alias".into()))?;
                let text = subquery.to_string();
                let inner = build_graph(&text, subquery.as_ref().clone(), false)?;
                let backing = inner.main_table();
                TableSpec {
                    alias,
                    schema: backing.schema.clone(),
                    table: backing.table.clone(),
                    is_main: false,
                    is_subquery: true,
                    subquery_sql: Some(text),
                    nested: inner.tables.keys().cloned().collect(),
                    subquery_fields: inner.fields,
                    relations: Vec::new(),
                }
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                let first = self.tables.len();
                self.walk_joins(table_with_joins)?;
                return self
                    .tables
                    .get_index(first)
                    .map(|(alias, _)| alias.clone())
                    .ok_or_else(|| SchemaError::Parse("empty parenthesized join".into()));
            }
            other => {
                return Err(SchemaError::UnsupportedExpression(format!(
                    "FROM source `{other}`"
                )))
            }
        };

        if self.tables.keys().any(|a| a.eq_ignore_ascii_case(&spec.alias)) {
            return Err(SchemaError::Parse(format!("duplicate table alias `{}`", spec.alias)));
        }
        let alias = spec.alias.clone();
        self.tables.insert(alias.clone(), spec);
        Ok(alias)
    }
}

/// Flatten `a.x = b.y AND (c.z = a.w)` into relation pairs.
fn collect_equalities(
    expr: &Expr,
    default_owner: &str,
    out: &mut Vec<RelationPair>,
) -> Result<(), SchemaError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, default_owner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, default_owner, out)?;
            collect_equalities(right, default_owner, out)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let (Some(l), Some(r)) = (
                column_ref(left, default_owner),
                column_ref(right, default_owner),
            ) else {
                return Err(SchemaError::UnsupportedExpression(format!(
                    "ON equality `{expr}` must compare two columns"
                )));
            };
            out.push(RelationPair { left: l, right: r });
            Ok(())
        }
        other => Err(SchemaError::UnsupportedExpression(format!(
            "ON condition `{other}` is not a conjunction of column equalities"
        ))),
    }
}

fn column_ref(expr: &Expr, default_owner: &str) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(ColumnRef::new(default_owner, &ident.value)),
        Expr::CompoundIdentifier(parts) => compound(parts, default_owner),
        Expr::Nested(inner) => column_ref(inner, default_owner),
        _ => None,
    }
}

fn compound(parts: &[Ident], default_owner: &str) -> Option<ColumnRef> {
    let column = parts.last()?;
    let owner = if parts.len() >= 2 {
        parts[parts.len() - 2].value.as_str()
    } else {
        default_owner
    };
    Some(ColumnRef::new(owner, &column.value))
}

fn project(select: &Select, default_owner: &str) -> Result<IndexMap<String, FieldSpec>, SchemaError> {
    let mut fields = IndexMap::new();
    for item in &select.projection {
        let (expr, alias) = match item {
            SelectItem::UnnamedExpr(expr) => (expr, None),
            SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
            _ => {
                return Err(SchemaError::UnsupportedExpression(
                    "wildcard projection; list the output fields explicitly".into(),
                ))
            }
        };
        let field = field_spec(expr, alias, default_owner)?;
        if fields.keys().any(|k: &String| k.eq_ignore_ascii_case(&field.name)) {
            return Err(SchemaError::Parse(format!("duplicate output field `{}`", field.name)));
        }
        fields.insert(field.name.clone(), field);
    }
    Ok(fields)
}

fn field_spec(expr: &Expr, alias: Option<String>, default_owner: &str) -> Result<FieldSpec, SchemaError> {
    let bare = unwrap_nested(expr);
    let name = match (alias, bare) {
        (Some(alias), _) => alias,
        (None, Expr::Identifier(ident)) => ident.value.clone(),
        (None, Expr::CompoundIdentifier(parts)) => parts
            .last()
            .map(|i| i.value.clone())
            .ok_or_else(|| SchemaError::Parse("empty identifier".into()))?,
        (None, other) => {
            return Err(SchemaError::Parse(format!(
                "expression `{other}` needs an alias to name its output field"
            )))
        }
    };

    let literal = matches!(bare, Expr::Value(_));
    let computed = !matches!(
        bare,
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) | Expr::Value(_)
    );

    let mut columns: Vec<ColumnRef> = Vec::new();
    let _ = visit_expressions(expr, |e| {
        let col = match e {
            Expr::Identifier(ident) => Some(ColumnRef::new(default_owner, &ident.value)),
            Expr::CompoundIdentifier(parts) => compound(parts, default_owner),
            _ => None,
        };
        if let Some(col) = col {
            if !columns.iter().any(|c| c.same_as(&col)) {
                columns.push(col);
            }
        }
        ControlFlow::<()>::Continue(())
    });

    if columns.is_empty() && !literal {
        return Err(SchemaError::Parse(format!(
            "output field `{name}` references no columns"
        )));
    }

    Ok(FieldSpec {
        name,
        expr: expr.to_string(),
        columns,
        computed,
        literal,
    })
}

fn unwrap_nested(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => unwrap_nested(inner),
        other => other,
    }
}
