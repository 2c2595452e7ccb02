// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL rewrites used by the re-query strategies.

use sqlparser::ast::{BinaryOperator, Expr, Query, SetExpr};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use super::{ColumnRef, FieldSpec, SchemaError};

/// AND `condition` into the WHERE clause of `query` and render it back to SQL.
///
/// Works on the AST so GROUP BY, ORDER BY and LIMIT stay where they belong.
pub(super) fn with_condition(query: &Query, condition: &str) -> Result<String, SchemaError> {
    let dialect = MySqlDialect {};
    let cond = Parser::new(&dialect)
        .try_with_sql(condition)
        .and_then(|mut p| p.parse_expr())
        .map_err(|e| SchemaError::Parse(format!("condition `{condition}`: {e}")))?;

    let mut query = query.clone();
    match query.body.as_mut() {
        SetExpr::Select(select) => {
            select.selection = Some(match select.selection.take() {
                Some(existing) => Expr::BinaryOp {
                    left: Box::new(Expr::Nested(Box::new(existing))),
                    op: BinaryOperator::And,
                    right: Box::new(Expr::Nested(Box::new(cond))),
                },
                None => cond,
            });
        }
        other => {
            return Err(SchemaError::UnsupportedExpression(format!(
                "cannot filter `{other}`"
            )))
        }
    }
    Ok(query.to_string())
}

/// A field expression with its column references replaced by `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderExpr {
    /// `SELECT`-able expression text.
    pub sql: String,
    /// Column bound to each `?`, in order.
    pub binds: Vec<ColumnRef>,
}

/// Rewrite a computed field so it can be evaluated from literal values.
///
/// `CONCAT(a.id, '-', a.kind)` becomes `CONCAT(?, '-', ?)` bound to
/// `[a.id, a.kind]`. Function names and string literals are left alone.
pub fn placeholder_expression(field: &FieldSpec) -> Result<PlaceholderExpr, SchemaError> {
    let dialect = MySqlDialect {};
    let tokens = Tokenizer::new(&dialect, &field.expr)
        .tokenize()
        .map_err(|e| SchemaError::Parse(format!("field `{}`: {e}", field.name)))?;

    let default_owner = field.columns.first().map(|c| c.owner.clone()).unwrap_or_default();
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut binds = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let Token::Word(word) = &tokens[i] else {
            out.push(tokens[i].clone());
            i += 1;
            continue;
        };

        // owner.column
        if let (Some(Token::Period), Some(Token::Word(col))) = (tokens.get(i + 1), tokens.get(i + 2)) {
            binds.push(ColumnRef::new(&word.value, &col.value));
            out.push(Token::Placeholder("?".into()));
            i += 3;
            continue;
        }

        let is_call = tokens[i + 1..]
            .iter()
            .find(|t| !matches!(t, Token::Whitespace(_)))
            .is_some_and(|t| matches!(t, Token::LParen));
        let column = field
            .columns
            .iter()
            .find(|c| c.column.eq_ignore_ascii_case(&word.value));
        match column {
            Some(_) if !is_call => {
                binds.push(ColumnRef::new(&default_owner, &word.value));
                out.push(Token::Placeholder("?".into()));
            }
            _ => out.push(tokens[i].clone()),
        }
        i += 1;
    }

    let sql = out.iter().map(ToString::to_string).collect::<String>();
    Ok(PlaceholderExpr { sql, binds })
}
