// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Strategy selection for a changed row.
//!
//! | table role                    | strategy                                    |
//! |-------------------------------|---------------------------------------------|
//! | main, single table            | `DIRECT_PATCH` unless a computed field needs the database |
//! | main, with joins              | `MAIN_REQUERY`                              |
//! | joined, simple fields only    | `JOIN_SIMPLE_PATCH`                         |
//! | derived table                 | `JOIN_SUBQUERY_PATCH`                       |
//! | joined or derived, computed   | `JOIN_FULL_REQUERY`                         |
//! | object-field child table      | `OBJECT_FIELD_REFRESH` (in addition)        |

use crate::event::{ChangeSet, Operation};
use crate::mapping::DocumentMapping;
use crate::schema::{SchemaGraph, TableSpec};

use super::strategies::{
    DirectPatch, JoinFullRequery, JoinSimplePatch, JoinSubqueryPatch, MainRequery, ObjectFieldRefresh,
    StrategyHandler,
};
use super::types::StrategyKind;

/// A selected strategy with what it needs to know about the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStrategy {
    DirectPatch(DirectPatch),
    MainRequery(MainRequery),
    JoinSimplePatch(JoinSimplePatch),
    JoinSubqueryPatch(JoinSubqueryPatch),
    JoinFullRequery(JoinFullRequery),
    ObjectFieldRefresh(ObjectFieldRefresh),
}

impl SyncStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            SyncStrategy::DirectPatch(_) => StrategyKind::DirectPatch,
            SyncStrategy::MainRequery(_) => StrategyKind::MainRequery,
            SyncStrategy::JoinSimplePatch(_) => StrategyKind::JoinSimplePatch,
            SyncStrategy::JoinSubqueryPatch(_) => StrategyKind::JoinSubqueryPatch,
            SyncStrategy::JoinFullRequery(_) => StrategyKind::JoinFullRequery,
            SyncStrategy::ObjectFieldRefresh(_) => StrategyKind::ObjectFieldRefresh,
        }
    }

    pub(crate) fn handler(&self) -> &dyn StrategyHandler {
        match self {
            SyncStrategy::DirectPatch(h) => h,
            SyncStrategy::MainRequery(h) => h,
            SyncStrategy::JoinSimplePatch(h) => h,
            SyncStrategy::JoinSubqueryPatch(h) => h,
            SyncStrategy::JoinFullRequery(h) => h,
            SyncStrategy::ObjectFieldRefresh(h) => h,
        }
    }
}

/// Strategies for one row of `table`, in application order.
///
/// A table can play several roles in one mapping (joined twice, or both
/// joined and feeding an object field); each role gets its own strategy.
/// `changes` is the UPDATE change set, `None` for INSERT and DELETE.
pub fn classify(
    mapping: &DocumentMapping,
    table: &str,
    operation: Operation,
    changes: Option<&ChangeSet>,
) -> Vec<SyncStrategy> {
    let graph = &mapping.graph;
    let mut out = Vec::new();

    for spec in graph.tables_backed_by(table) {
        let strategy = if spec.is_main {
            classify_main(mapping, operation, changes)
        } else if spec.is_subquery {
            if contributes_computed(graph, spec) {
                SyncStrategy::JoinFullRequery(JoinFullRequery::new(&spec.alias))
            } else {
                SyncStrategy::JoinSubqueryPatch(JoinSubqueryPatch::new(&spec.alias))
            }
        } else if contributes_computed(graph, spec) {
            SyncStrategy::JoinFullRequery(JoinFullRequery::new(&spec.alias))
        } else {
            SyncStrategy::JoinSimplePatch(JoinSimplePatch::new(&spec.alias))
        };
        out.push(strategy);
    }

    let fed: Vec<String> = mapping.object_fields_fed_by(table).map(|f| f.name.clone()).collect();
    if !fed.is_empty() {
        out.push(SyncStrategy::ObjectFieldRefresh(ObjectFieldRefresh::new(fed)));
    }
    out
}

fn classify_main(mapping: &DocumentMapping, operation: Operation, changes: Option<&ChangeSet>) -> SyncStrategy {
    let graph = &mapping.graph;
    let main = graph.main_alias();
    let id_simple = graph.field(mapping.id.field()).is_some_and(|f| f.is_simple());
    let requery = || {
        let fk_aliases = match (operation, changes) {
            (Operation::Update, Some(changes)) => graph
                .tables
                .values()
                .filter(|t| !t.is_main)
                .filter(|t| graph.foreign_key_columns(&t.alias).iter().any(|c| changes.contains(&c.column)))
                .map(|t| t.alias.clone())
                .collect(),
            _ => Vec::new(),
        };
        SyncStrategy::MainRequery(MainRequery::new(fk_aliases))
    };

    if !graph.is_single_table() || !id_simple {
        return requery();
    }
    match operation {
        Operation::Insert if graph.all_fields_simple() => SyncStrategy::DirectPatch(DirectPatch),
        Operation::Insert => requery(),
        Operation::Delete => SyncStrategy::DirectPatch(DirectPatch),
        Operation::Update => {
            let computed_changed = changes.is_some_and(|changes| {
                graph.fields.values().filter(|f| f.computed).any(|f| {
                    f.columns
                        .iter()
                        .any(|c| c.is_owned_by(main) && changes.contains(&c.column))
                })
            });
            if computed_changed {
                requery()
            } else {
                SyncStrategy::DirectPatch(DirectPatch)
            }
        }
    }
}

/// Whether any field reading `table` needs the database to be evaluated,
/// including derived-table columns computed inside the sub-query.
fn contributes_computed(graph: &SchemaGraph, table: &TableSpec) -> bool {
    graph.contributed_fields(&table.alias).iter().any(|f| {
        f.computed
            || (table.is_subquery
                && f.columns.iter().filter(|c| c.is_owned_by(&table.alias)).any(|c| {
                    table
                        .subquery_fields
                        .iter()
                        .find(|(name, _)| name.eq_ignore_ascii_case(&c.column))
                        .is_some_and(|(_, inner)| inner.computed)
                }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::tests::config;
    use crate::event::Row;
    use serde_json::json;

    fn mapping(body: &str) -> DocumentMapping {
        let text = format!("dataSourceKey: defaultDS\nesMapping:\n  _index: t\n{body}");
        DocumentMapping::from_yaml("t.yml", &text, &config()).unwrap()
    }

    fn changes(new: serde_json::Value, old: serde_json::Value) -> ChangeSet {
        let new: Row = new.as_object().cloned().unwrap();
        let old: Row = old.as_object().cloned().unwrap();
        ChangeSet::between(&new, &old)
    }

    fn kinds(strategies: &[SyncStrategy]) -> Vec<StrategyKind> {
        strategies.iter().map(SyncStrategy::kind).collect()
    }

    #[test]
    fn test_single_table_simple_fields_patch_directly() {
        let m = mapping("  _id: id\n  sql: SELECT a.id, a.name, a.age FROM users a\n");
        for op in [Operation::Insert, Operation::Delete] {
            assert_eq!(kinds(&classify(&m, "users", op, None)), vec![StrategyKind::DirectPatch]);
        }
        let set = changes(json!({"name": "b"}), json!({"name": "a"}));
        assert_eq!(
            kinds(&classify(&m, "users", Operation::Update, Some(&set))),
            vec![StrategyKind::DirectPatch]
        );
    }

    #[test]
    fn test_changed_computed_column_forces_requery() {
        let m = mapping("  _id: id\n  sql: SELECT a.id, CONCAT(a.first_name, a.last_name) AS full_name, a.age FROM users a\n");
        let computed = changes(json!({"first_name": "b"}), json!({"first_name": "a"}));
        assert_eq!(
            kinds(&classify(&m, "users", Operation::Update, Some(&computed))),
            vec![StrategyKind::MainRequery]
        );
        let plain = changes(json!({"age": 3}), json!({"age": 2}));
        assert_eq!(
            kinds(&classify(&m, "users", Operation::Update, Some(&plain))),
            vec![StrategyKind::DirectPatch]
        );
        assert_eq!(
            kinds(&classify(&m, "users", Operation::Insert, None)),
            vec![StrategyKind::MainRequery]
        );
    }

    #[test]
    fn test_joined_graph_roles() {
        let m = mapping(concat!(
            "  _id: id\n",
            "  sql: SELECT a.id, a.tag_id, b.name AS tag_name, UPPER(c.label) AS label, s.total ",
            "FROM orders a LEFT JOIN tags b ON a.tag_id = b.id LEFT JOIN labels c ON a.label_id = c.id ",
            "LEFT JOIN (SELECT order_id, SUM(qty) AS total FROM items GROUP BY order_id) s ON s.order_id = a.id\n",
        ));
        assert_eq!(kinds(&classify(&m, "orders", Operation::Insert, None)), vec![StrategyKind::MainRequery]);
        assert_eq!(kinds(&classify(&m, "tags", Operation::Insert, None)), vec![StrategyKind::JoinSimplePatch]);
        assert_eq!(kinds(&classify(&m, "labels", Operation::Insert, None)), vec![StrategyKind::JoinFullRequery]);
        assert_eq!(kinds(&classify(&m, "items", Operation::Insert, None)), vec![StrategyKind::JoinFullRequery]);
        assert!(classify(&m, "unrelated", Operation::Insert, None).is_empty());
    }

    #[test]
    fn test_plain_derived_table_patches_from_sub_query() {
        let m = mapping(concat!(
            "  _id: id\n",
            "  sql: SELECT a.id, s.label FROM orders a LEFT JOIN (SELECT id, label FROM labels) s ON s.id = a.label_id\n",
        ));
        assert_eq!(
            kinds(&classify(&m, "labels", Operation::Update, None)),
            vec![StrategyKind::JoinSubqueryPatch]
        );
    }

    #[test]
    fn test_foreign_key_change_is_recorded() {
        let m = mapping(concat!(
            "  _id: id\n",
            "  sql: SELECT a.id, b.name AS tag_name FROM orders a LEFT JOIN tags b ON a.tag_id = b.id\n",
        ));
        let set = changes(json!({"tag_id": 2}), json!({"tag_id": 1}));
        match classify(&m, "orders", Operation::Update, Some(&set)).as_slice() {
            [SyncStrategy::MainRequery(h)] => assert_eq!(h.fk_aliases, vec!["b".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_object_field_child_table_adds_refresh() {
        let m = mapping(concat!(
            "  _id: id\n  sql: SELECT a.id, a.name FROM users a\n",
            "  objFields:\n    roles:\n      type: array\n      sql: \"SELECT r.role FROM user_role r WHERE r.user_id = '${id}'\"\n",
        ));
        match classify(&m, "user_role", Operation::Insert, None).as_slice() {
            [SyncStrategy::ObjectFieldRefresh(h)] => assert_eq!(h.fields, vec!["roles".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(kinds(&classify(&m, "users", Operation::Insert, None)), vec![StrategyKind::DirectPatch]);
    }
}
