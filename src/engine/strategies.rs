// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Strategy handlers: turn one changed row into document operations.
//!
//! Handlers only plan; the engine pushes what they return through the
//! mapping's [`BulkBuffer`](crate::batching::BulkBuffer). A handler either
//! returns every operation for its row or an error, never a partial list.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::coerce::FieldTypes;
use crate::error::SyncError;
use crate::event::{row_value, ChangeSet, Operation, Row};
use crate::mapping::{DocumentMapping, ObjectFieldKind};
use crate::resolver::{put_object_value, NestedFieldResolver};
use crate::schema::{placeholder_expression, FieldSpec, JoinKey, TableSpec};
use crate::sink::{loosely_equal, DocumentOp};

use super::document::{self, has_sub_query};

/// Everything a handler may look at for one row.
pub(crate) struct RowContext<'a> {
    pub mapping: &'a Arc<DocumentMapping>,
    pub resolver: &'a NestedFieldResolver,
    pub types: &'a Arc<FieldTypes>,
    pub operation: Operation,
    pub row: &'a Row,
    /// Previous values of the changed columns (UPDATE only).
    pub old: Option<&'a Row>,
    pub changes: Option<&'a ChangeSet>,
}

impl RowContext<'_> {
    fn changed(&self, column: &str) -> bool {
        self.changes.is_some_and(|c| c.contains(column))
    }

    fn is_update(&self) -> bool {
        self.operation == Operation::Update
    }

    fn old_image(&self) -> Row {
        document::old_image(self.row, self.old)
    }

    async fn query(&self, sql: &str, params: &[Value], what: &str) -> Result<Vec<Row>, SyncError> {
        self.resolver
            .source()
            .query(&self.mapping.data_source_key, sql, params)
            .await
            .map_err(|e| SyncError::resolution(format!("{}: {what}", self.mapping.name), e))
    }

    /// Root query restricted by `conditions` (AND-ed, one `?` each).
    async fn requery(&self, conditions: &[String], params: &[Value]) -> Result<Vec<Row>, SyncError> {
        let sql = self.mapping.graph.with_condition(&conditions.join(" AND "))?;
        self.query(&sql, params, "root re-query").await
    }

    /// Whole document for a view row: fields, relations and object fields.
    async fn full_document(&self, view: &Row) -> Result<(Row, Option<String>), SyncError> {
        let mut doc = document::fields_from_view(self.mapping, view, self.types);
        let routing = document::apply_relations(self.mapping, view, &mut doc);
        self.resolver.resolve_into(self.mapping, view, self.types, &mut doc).await?;
        Ok((doc, routing))
    }

    /// Id of the document a main-table row maps to, when it can be derived
    /// from the row alone. Computed ids are evaluated by the database.
    async fn event_id(&self, row: &Row) -> Result<Option<Value>, SyncError> {
        let mapping = self.mapping;
        let graph = &mapping.graph;
        let Some(field) = graph.field(mapping.id.field()) else {
            return Ok(None);
        };
        if field.is_simple() {
            return Ok(mapping.id_value(&document::view_from_event(mapping, row)));
        }
        let main = graph.main_table();
        if !field.columns.iter().all(|c| c.is_owned_by(&main.alias)) {
            return Ok(None);
        }
        let expr = placeholder_expression(field)?;
        let params: Vec<Value> = expr
            .binds
            .iter()
            .map(|c| row_value(row, main.source_column(&c.column)))
            .collect();
        let rows = self.query(&format!("SELECT {} AS id", expr.sql), &params, "id expression").await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|r| r.into_iter().next().map(|(_, v)| v))
            .filter(|v| !v.is_null()))
    }

    /// Documents addressed by the values of join keys: by an exposed field
    /// when documents carry one, otherwise by ids looked up through the root
    /// query. `None` when no document can match.
    async fn locate(&self, keys: &[(String, Option<String>)], values: &[Value]) -> Result<Option<Row>, SyncError> {
        // `col = NULL` matches nothing, so neither may a partial key.
        if values.is_empty() || values.iter().any(Value::is_null) {
            return Ok(None);
        }
        if keys.iter().all(|(_, key)| key.is_some()) {
            let mut matches = Row::new();
            for ((_, key), value) in keys.iter().zip(values) {
                if let Some(key) = key {
                    matches.insert(key.clone(), document::match_value_for(key, value.clone()));
                }
            }
            return Ok(Some(matches));
        }

        let conditions: Vec<String> = keys.iter().map(|(expr, _)| format!("({expr}) = ?")).collect();
        let rows = self.requery(&conditions, values).await?;
        let ids: Vec<Value> = rows.iter().filter_map(|r| self.mapping.id_value(r)).collect();
        if ids.is_empty() {
            debug!(mapping = %self.mapping.name, "No documents reference the changed row");
            return Ok(None);
        }
        Ok(Some(document::id_match(self.mapping, ids)))
    }
}

/// Plans the document operations for one row under one strategy.
#[async_trait]
pub(crate) trait StrategyHandler: Send + Sync {
    async fn plan(&self, ctx: &RowContext<'_>) -> Result<Vec<DocumentOp>, SyncError>;
}

fn main_owned_changed(ctx: &RowContext<'_>, field: &FieldSpec) -> bool {
    let main = ctx.mapping.graph.main_table();
    field
        .columns
        .iter()
        .any(|c| c.is_owned_by(&main.alias) && ctx.changed(main.source_column(&c.column)))
}

/// `alias.col = ?` over the main-table columns of the id field.
fn main_filter(mapping: &DocumentMapping, row: &Row) -> Result<(Vec<String>, Vec<Value>), SyncError> {
    let graph = &mapping.graph;
    let main = graph.main_table();
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    if let Some(field) = graph.field(mapping.id.field()) {
        for col in field.columns.iter().filter(|c| c.is_owned_by(&main.alias)) {
            let condition = format!("{} = ?", col.qualified());
            if !conditions.contains(&condition) {
                conditions.push(condition);
                params.push(row_value(row, main.source_column(&col.column)));
            }
        }
    }
    if conditions.is_empty() {
        return Err(SyncError::config(format!(
            "{}: id field `{}` reads no column of the main table",
            mapping.name,
            mapping.id.field()
        )));
    }
    Ok((conditions, params))
}

// ---------------------------------------------------------------------------
// DIRECT_PATCH
// ---------------------------------------------------------------------------

/// Single-table view whose fields are plain columns: the document is built
/// from the event row itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectPatch;

#[async_trait]
impl StrategyHandler for DirectPatch {
    async fn plan(&self, ctx: &RowContext<'_>) -> Result<Vec<DocumentOp>, SyncError> {
        let mapping = ctx.mapping;
        let view = document::view_from_event(mapping, ctx.row);
        let id = document::require_id(mapping, &view)?;

        match ctx.operation {
            Operation::Insert => {
                let (doc, routing) = ctx.full_document(&view).await?;
                Ok(vec![document::upsert_op(mapping, &id, doc, routing)?])
            }
            Operation::Delete => Ok(vec![document::delete_op(
                mapping,
                &id,
                document::routing_for(mapping, &view),
            )?]),
            Operation::Update => {
                let old_view = document::view_from_event(mapping, &ctx.old_image());
                if let Some(old_id) = mapping.id_value(&old_view).filter(|old| !loosely_equal(old, &id)) {
                    debug!(mapping = %mapping.name, old = %old_id, new = %id, "Document id changed");
                    let (doc, routing) = ctx.full_document(&view).await?;
                    return Ok(vec![
                        document::delete_op(mapping, &old_id, document::routing_for(mapping, &old_view))?,
                        document::upsert_op(mapping, &id, doc, routing)?,
                    ]);
                }

                let graph = &mapping.graph;
                let mut delta = Row::new();
                for field in graph.fields.values() {
                    if mapping.writes_field(&field.name)
                        && !has_sub_query(mapping, &field.name)
                        && main_owned_changed(ctx, field)
                    {
                        document::put_field(mapping, &mut delta, &field.name, row_value(&view, &field.name), ctx.types);
                    }
                }

                let relation_moved = mapping
                    .relations
                    .values()
                    .filter_map(|r| r.parent.as_deref())
                    .filter_map(|p| graph.field(p))
                    .any(|f| main_owned_changed(ctx, f));
                let routing = if relation_moved {
                    document::apply_relations(mapping, &view, &mut delta)
                } else {
                    document::routing_for(mapping, &view)
                };

                for spec in mapping.object_fields.values() {
                    let Some(child) = &spec.child else { continue };
                    let rebinds = child
                        .binds
                        .iter()
                        .filter_map(|f| graph.field(f))
                        .any(|f| main_owned_changed(ctx, f));
                    if rebinds {
                        let value = ctx
                            .resolver
                            .resolve(&mapping.data_source_key, spec, &child.binds_from_parent(&view), ctx.types)
                            .await?;
                        put_object_value(&mut delta, spec, value);
                    }
                }

                if delta.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![document::update_op(mapping, &id, delta, routing, mapping.upsert)?])
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MAIN_REQUERY
// ---------------------------------------------------------------------------

/// Main-table change whose document needs the database: re-run the root
/// query restricted to the row and write the full result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainRequery {
    /// Joined aliases whose foreign key on the main row changed.
    pub fk_aliases: Vec<String>,
}

impl MainRequery {
    pub fn new(fk_aliases: Vec<String>) -> Self {
        Self { fk_aliases }
    }

    /// Whether the UPDATE touched any main column the view reads.
    fn relevant(&self, ctx: &RowContext<'_>) -> bool {
        let graph = &ctx.mapping.graph;
        let main = graph.main_table();
        let joins = graph
            .tables
            .values()
            .filter(|t| !t.is_main)
            .flat_map(|t| graph.foreign_key_columns(&t.alias));
        graph
            .fields
            .values()
            .flat_map(|f| f.columns.iter().cloned())
            .chain(joins)
            .any(|c| c.is_owned_by(&main.alias) && ctx.changed(main.source_column(&c.column)))
    }

    /// Nulls for fields of joins the row no longer points at.
    fn detached_nulls(&self, mapping: &DocumentMapping) -> Row {
        let mut nulls = Row::new();
        for alias in &self.fk_aliases {
            for field in mapping.graph.contributed_fields(alias) {
                if mapping.writes_field(&field.name) && mapping.object_field(&field.name).is_none() {
                    nulls.insert(field.name.clone(), Value::Null);
                }
            }
        }
        nulls
    }

    async fn plan_delete(&self, ctx: &RowContext<'_>) -> Result<Vec<DocumentOp>, SyncError> {
        let mapping = ctx.mapping;
        let routing = document::routing_for(mapping, &document::view_from_event(mapping, ctx.row));
        if let Some(id) = ctx.event_id(ctx.row).await? {
            return Ok(vec![document::delete_op(mapping, &id, routing)?]);
        }

        let (conditions, params) = main_filter(mapping, ctx.row)?;
        let rows = ctx.requery(&conditions, &params).await?;
        if rows.is_empty() {
            warn!(
                mapping = %mapping.name,
                "Deleted row no longer matches the view; its document id cannot be recovered"
            );
        }
        rows.iter()
            .filter_map(|view| mapping.id_value(view).map(|id| (id, document::routing_for(mapping, view))))
            .map(|(id, routing)| document::delete_op(mapping, &id, routing))
            .collect()
    }
}

#[async_trait]
impl StrategyHandler for MainRequery {
    async fn plan(&self, ctx: &RowContext<'_>) -> Result<Vec<DocumentOp>, SyncError> {
        if ctx.operation == Operation::Delete {
            return self.plan_delete(ctx).await;
        }
        if ctx.is_update() && !self.relevant(ctx) {
            return Ok(Vec::new());
        }

        let mapping = ctx.mapping;
        let mut ops = Vec::new();

        let id_moved = ctx.is_update()
            && mapping
                .graph
                .field(mapping.id.field())
                .is_some_and(|f| main_owned_changed(ctx, f));
        if id_moved {
            let old = ctx.old_image();
            let (new_id, old_id) = (ctx.event_id(ctx.row).await?, ctx.event_id(&old).await?);
            if let Some(old_id) = old_id.filter(|old| new_id.as_ref().map_or(true, |new| !loosely_equal(old, new))) {
                let routing = document::routing_for(mapping, &document::view_from_event(mapping, &old));
                ops.push(document::delete_op(mapping, &old_id, routing)?);
            }
        }

        let (conditions, params) = main_filter(mapping, ctx.row)?;
        let rows = ctx.requery(&conditions, &params).await?;
        let nulls = self.detached_nulls(mapping);

        for view in &rows {
            let id = document::require_id(mapping, view)?;
            let (doc, routing) = ctx.full_document(view).await?;
            let mut body = nulls.clone();
            body.extend(doc);
            let op = if ctx.is_update() && !id_moved {
                document::update_op(mapping, &id, body, routing, mapping.upsert)?
            } else {
                document::upsert_op(mapping, &id, body, routing)?
            };
            ops.push(op);
        }

        if rows.is_empty() {
            debug!(mapping = %mapping.name, "Re-query matched no view rows");
            if !nulls.is_empty() {
                if let Some(id) = ctx.event_id(ctx.row).await? {
                    ops.push(document::update_op(mapping, &id, nulls, None, false)?);
                }
            }
        }
        Ok(ops)
    }
}

// ---------------------------------------------------------------------------
// Join helpers
// ---------------------------------------------------------------------------

/// Join keys of `table` paired with how documents expose them.
fn key_targets(mapping: &DocumentMapping, keys: &[JoinKey]) -> Vec<(String, Option<String>)> {
    keys.iter()
        .map(|k| {
            let key = k.exposed.iter().find_map(|f| document::match_key(mapping, f));
            (k.other.qualified(), key)
        })
        .collect()
}

/// Join-key values of `table` read from an event row of that table.
fn own_values(table: &TableSpec, keys: &[JoinKey], row: &Row) -> Vec<Value> {
    keys.iter()
        .map(|k| row_value(row, table.source_column(&k.own.column)))
        .collect()
}

fn written_fields<'a>(mapping: &'a DocumentMapping, alias: &str) -> Vec<&'a FieldSpec> {
    mapping
        .graph
        .contributed_fields(alias)
        .into_iter()
        .filter(|f| mapping.writes_field(&f.name))
        .collect()
}

/// Delta of `fields` with values read by `read` from the alias's column.
fn join_delta(
    mapping: &DocumentMapping,
    alias: &str,
    fields: &[&FieldSpec],
    types: &FieldTypes,
    read: impl Fn(&str) -> Option<Value>,
) -> Row {
    let mut delta = Row::new();
    for field in fields {
        let Some(col) = field.columns.iter().find(|c| c.is_owned_by(alias)) else {
            continue;
        };
        if let Some(value) = read(&col.column) {
            document::put_field(mapping, &mut delta, &field.name, value, types);
        }
    }
    delta
}

fn null_delta(fields: &[&FieldSpec]) -> Row {
    fields.iter().map(|f| (f.name.clone(), Value::Null)).collect()
}

async fn patch(
    ctx: &RowContext<'_>,
    targets: &[(String, Option<String>)],
    values: &[Value],
    delta: Row,
) -> Result<Option<DocumentOp>, SyncError> {
    if delta.is_empty() {
        return Ok(None);
    }
    Ok(ctx.locate(targets, values).await?.map(|matches| DocumentOp::UpdateByQuery {
        index: ctx.mapping.index.clone(),
        matches,
        doc: delta,
    }))
}

// ---------------------------------------------------------------------------
// JOIN_SIMPLE_PATCH
// ---------------------------------------------------------------------------

/// Joined table contributing plain columns: patch the referencing documents
/// with the row's values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSimplePatch {
    pub alias: String,
}

impl JoinSimplePatch {
    pub fn new(alias: &str) -> Self {
        Self { alias: alias.to_string() }
    }
}

#[async_trait]
impl StrategyHandler for JoinSimplePatch {
    async fn plan(&self, ctx: &RowContext<'_>) -> Result<Vec<DocumentOp>, SyncError> {
        let mapping = ctx.mapping;
        let Some(table) = mapping.graph.table(&self.alias) else {
            return Ok(Vec::new());
        };
        let keys = mapping.graph.join_keys(&table.alias);
        let targets = key_targets(mapping, &keys);
        let fields = written_fields(mapping, &table.alias);
        let key_changed = ctx.is_update() && keys.iter().any(|k| ctx.changed(table.source_column(&k.own.column)));

        let mut ops = Vec::new();
        match ctx.operation {
            Operation::Delete => {
                ops.extend(patch(ctx, &targets, &own_values(table, &keys, ctx.row), null_delta(&fields)).await?);
            }
            Operation::Update if !key_changed => {
                let delta = join_delta(mapping, &table.alias, &fields, ctx.types, |col| {
                    let source = table.source_column(col);
                    ctx.changed(source).then(|| row_value(ctx.row, source))
                });
                ops.extend(patch(ctx, &targets, &own_values(table, &keys, ctx.row), delta).await?);
            }
            _ => {
                if key_changed {
                    let old = ctx.old_image();
                    ops.extend(patch(ctx, &targets, &own_values(table, &keys, &old), null_delta(&fields)).await?);
                }
                let delta = join_delta(mapping, &table.alias, &fields, ctx.types, |col| {
                    Some(row_value(ctx.row, table.source_column(col)))
                });
                ops.extend(patch(ctx, &targets, &own_values(table, &keys, ctx.row), delta).await?);
            }
        }
        Ok(ops)
    }
}

// ---------------------------------------------------------------------------
// JOIN_SUBQUERY_PATCH
// ---------------------------------------------------------------------------

/// Derived table of plain columns: re-run the sub-query for the changed key
/// and patch the referencing documents with its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSubqueryPatch {
    pub alias: String,
}

impl JoinSubqueryPatch {
    pub fn new(alias: &str) -> Self {
        Self { alias: alias.to_string() }
    }

    async fn sub_rows(
        &self,
        ctx: &RowContext<'_>,
        sub_sql: &str,
        keys: &[JoinKey],
        values: &[Value],
    ) -> Result<Vec<Row>, SyncError> {
        if values.iter().any(Value::is_null) {
            return Ok(Vec::new());
        }
        let conditions: Vec<String> = keys
            .iter()
            .map(|k| format!("{}.{} = ?", self.alias, k.own.column))
            .collect();
        let sql = format!("SELECT * FROM ({sub_sql}) {} WHERE {}", self.alias, conditions.join(" AND "));
        ctx.query(&sql, values, "derived table").await
    }

    /// Patch documents for the key `values`: one patch per sub-query row, or
    /// nulls when the key no longer produces any.
    #[allow(clippy::too_many_arguments)]
    async fn refresh(
        &self,
        ctx: &RowContext<'_>,
        sub_sql: &str,
        keys: &[JoinKey],
        targets: &[(String, Option<String>)],
        fields: &[&FieldSpec],
        values: &[Value],
        ops: &mut Vec<DocumentOp>,
    ) -> Result<(), SyncError> {
        let rows = self.sub_rows(ctx, sub_sql, keys, values).await?;
        if rows.is_empty() {
            ops.extend(patch(ctx, targets, values, null_delta(fields)).await?);
            return Ok(());
        }
        for sub_row in &rows {
            let delta = join_delta(ctx.mapping, &self.alias, fields, ctx.types, |col| Some(row_value(sub_row, col)));
            let key_values: Vec<Value> = keys.iter().map(|k| row_value(sub_row, &k.own.column)).collect();
            ops.extend(patch(ctx, targets, &key_values, delta).await?);
        }
        Ok(())
    }
}

#[async_trait]
impl StrategyHandler for JoinSubqueryPatch {
    async fn plan(&self, ctx: &RowContext<'_>) -> Result<Vec<DocumentOp>, SyncError> {
        let mapping = ctx.mapping;
        let Some(table) = mapping.graph.table(&self.alias) else {
            return Ok(Vec::new());
        };
        let Some(sub_sql) = table.subquery_sql.as_deref() else {
            return Ok(Vec::new());
        };
        let keys = mapping.graph.join_keys(&table.alias);
        let targets = key_targets(mapping, &keys);
        let fields = written_fields(mapping, &table.alias);

        let mut ops = Vec::new();
        let key_changed = ctx.is_update() && keys.iter().any(|k| ctx.changed(table.source_column(&k.own.column)));
        if key_changed {
            let old = own_values(table, &keys, &ctx.old_image());
            self.refresh(ctx, sub_sql, &keys, &targets, &fields, &old, &mut ops).await?;
        }
        let current = own_values(table, &keys, ctx.row);
        self.refresh(ctx, sub_sql, &keys, &targets, &fields, &current, &mut ops).await?;
        Ok(ops)
    }
}

// ---------------------------------------------------------------------------
// JOIN_FULL_REQUERY
// ---------------------------------------------------------------------------

/// Joined or derived table feeding computed fields: re-run the root query
/// for every document referencing the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFullRequery {
    pub alias: String,
}

impl JoinFullRequery {
    pub fn new(alias: &str) -> Self {
        Self { alias: alias.to_string() }
    }
}

#[async_trait]
impl StrategyHandler for JoinFullRequery {
    async fn plan(&self, ctx: &RowContext<'_>) -> Result<Vec<DocumentOp>, SyncError> {
        let mapping = ctx.mapping;
        let Some(table) = mapping.graph.table(&self.alias) else {
            return Ok(Vec::new());
        };
        let keys = mapping.graph.join_keys(&table.alias);
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let targets = key_targets(mapping, &keys);
        let fields = written_fields(mapping, &table.alias);
        let mut ops = Vec::new();

        let key_changed = ctx.is_update() && keys.iter().any(|k| ctx.changed(table.source_column(&k.own.column)));
        if ctx.operation == Operation::Delete || key_changed {
            let detached = if key_changed {
                own_values(table, &keys, &ctx.old_image())
            } else {
                own_values(table, &keys, ctx.row)
            };
            ops.extend(patch(ctx, &targets, &detached, null_delta(&fields)).await?);
        }

        let values = own_values(table, &keys, ctx.row);
        if values.iter().any(Value::is_null) {
            return Ok(ops);
        }
        let conditions: Vec<String> = keys.iter().map(|k| format!("{} = ?", k.other.qualified())).collect();
        let rows = ctx.requery(&conditions, &values).await?;
        for view in &rows {
            let id = document::require_id(mapping, view)?;
            let (doc, routing) = ctx.full_document(view).await?;
            ops.push(document::update_op(mapping, &id, doc, routing, mapping.upsert)?);
        }
        Ok(ops)
    }
}

// ---------------------------------------------------------------------------
// OBJECT_FIELD_REFRESH
// ---------------------------------------------------------------------------

/// Child table of object fields: re-resolve the fields and patch the parent
/// documents located through the declared parent-field bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFieldRefresh {
    pub fields: Vec<String>,
}

impl ObjectFieldRefresh {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

/// Locate targets for a partial parent row: the parent field's expression
/// and its match key.
fn parent_targets(mapping: &DocumentMapping, key: &Row) -> (Vec<(String, Option<String>)>, Vec<Value>) {
    key.iter()
        .map(|(field, value)| {
            let expr = mapping
                .graph
                .field(field)
                .map(|f| f.expr.clone())
                .unwrap_or_else(|| field.clone());
            ((expr, document::match_key(mapping, field)), value.clone())
        })
        .unzip()
}

#[async_trait]
impl StrategyHandler for ObjectFieldRefresh {
    async fn plan(&self, ctx: &RowContext<'_>) -> Result<Vec<DocumentOp>, SyncError> {
        let mapping = ctx.mapping;
        let mut groups: Vec<(Row, Row)> = Vec::new();

        for name in &self.fields {
            let Some(spec) = mapping.object_field(name) else { continue };
            let Some(child) = &spec.child else { continue };
            if ctx.is_update() && !child.watched_columns().any(|c| ctx.changed(c)) {
                continue;
            }

            let mut images = vec![ctx.row.clone()];
            if ctx.is_update() && child.bindings.iter().any(|b| ctx.changed(&b.child_column.column)) {
                images.push(ctx.old_image());
            }

            let mut keys: Vec<Row> = Vec::new();
            for image in &images {
                for key in child.parent_keys_from_child(image) {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }

            for key in &keys {
                let (targets, values) = parent_targets(mapping, key);
                let Some(matches) = ctx.locate(&targets, &values).await? else {
                    continue;
                };

                let value = ctx
                    .resolver
                    .resolve(&mapping.data_source_key, spec, &child.binds_from_parent(key), ctx.types)
                    .await?;
                let mut delta = Row::new();
                if spec.kind == ObjectFieldKind::ObjectFlat && value.is_null() {
                    document::null_object_field(&mut delta, spec);
                } else {
                    put_object_value(&mut delta, spec, value);
                }

                match groups.iter_mut().find(|(m, _)| *m == matches) {
                    Some((_, doc)) => doc.extend(delta),
                    None => groups.push((matches, delta)),
                }
            }
        }

        Ok(groups
            .into_iter()
            .filter(|(_, doc)| !doc.is_empty())
            .map(|(matches, doc)| DocumentOp::UpdateByQuery {
                index: mapping.index.clone(),
                matches,
                doc,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::tests::config;
    use crate::sink::ID_MATCH_KEY;
    use crate::source::{RowSource, ScriptedSource};
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn mapping(body: &str) -> Arc<DocumentMapping> {
        let text = format!("dataSourceKey: defaultDS\nesMapping:\n  _index: t\n{body}");
        Arc::new(DocumentMapping::from_yaml("t.yml", &text, &config()).unwrap())
    }

    struct Fixture {
        mapping: Arc<DocumentMapping>,
        resolver: NestedFieldResolver,
        types: Arc<FieldTypes>,
    }

    impl Fixture {
        fn new(mapping: Arc<DocumentMapping>, source: Arc<dyn RowSource>) -> Self {
            Self {
                mapping,
                resolver: NestedFieldResolver::new(source, 4),
                types: Arc::new(FieldTypes::new()),
            }
        }

        async fn plan(
            &self,
            handler: &dyn StrategyHandler,
            operation: Operation,
            new: Value,
            old: Option<Value>,
        ) -> Result<Vec<DocumentOp>, SyncError> {
            let new = row(new);
            let old = old.map(row);
            let changes = old.as_ref().map(|o| ChangeSet::between(&new, o));
            let ctx = RowContext {
                mapping: &self.mapping,
                resolver: &self.resolver,
                types: &self.types,
                operation,
                row: &new,
                old: old.as_ref(),
                changes: changes.as_ref(),
            };
            handler.plan(&ctx).await
        }
    }

    const USERS: &str = "  _id: id\n  sql: SELECT a.id, a.name, a.age FROM users a\n";

    #[tokio::test]
    async fn test_direct_patch_insert_writes_whole_row() {
        let fx = Fixture::new(mapping(USERS), Arc::new(ScriptedSource::empty()));
        let ops = fx
            .plan(&DirectPatch, Operation::Insert, json!({"id": 1, "name": "ann", "age": 30}), None)
            .await
            .unwrap();
        assert_eq!(
            ops,
            vec![DocumentOp::Index {
                index: fx.mapping.index.clone(),
                id: "1".into(),
                doc: row(json!({"name": "ann", "age": 30})),
                routing: None,
            }]
        );
    }

    #[tokio::test]
    async fn test_direct_patch_update_sends_changed_fields_only() {
        let fx = Fixture::new(mapping(USERS), Arc::new(ScriptedSource::empty()));
        let ops = fx
            .plan(
                &DirectPatch,
                Operation::Update,
                json!({"id": 1, "name": "bob", "age": 30}),
                Some(json!({"name": "ann"})),
            )
            .await
            .unwrap();
        match ops.as_slice() {
            [DocumentOp::Update { id, doc, upsert, .. }] => {
                assert_eq!(id, "1");
                assert_eq!(doc, &row(json!({"name": "bob"})));
                assert!(!upsert);
            }
            other => panic!("unexpected {other:?}"),
        }

        let untouched = fx
            .plan(
                &DirectPatch,
                Operation::Update,
                json!({"id": 1, "name": "bob", "other": 2}),
                Some(json!({"other": 1})),
            )
            .await
            .unwrap();
        assert!(untouched.is_empty());
    }

    #[tokio::test]
    async fn test_direct_patch_id_change_moves_document() {
        let fx = Fixture::new(mapping(USERS), Arc::new(ScriptedSource::empty()));
        let ops = fx
            .plan(
                &DirectPatch,
                Operation::Update,
                json!({"id": 2, "name": "ann", "age": 30}),
                Some(json!({"id": 1})),
            )
            .await
            .unwrap();
        assert!(matches!(&ops[0], DocumentOp::Delete { id, .. } if id == "1"));
        assert!(matches!(&ops[1], DocumentOp::Index { id, .. } if id == "2"));
    }

    #[tokio::test]
    async fn test_main_requery_nulls_detached_join_when_no_rows() {
        let m = mapping(concat!(
            "  _id: id\n",
            "  sql: SELECT a.id, a.tag_id, b.name AS tag_name FROM orders a JOIN tags b ON a.tag_id = b.id\n",
        ));
        let source = Arc::new(ScriptedSource::empty());
        let fx = Fixture::new(m, source.clone());
        let handler = MainRequery::new(vec!["b".into()]);
        let ops = fx
            .plan(&handler, Operation::Update, json!({"id": 1, "tag_id": 9}), Some(json!({"tag_id": 7})))
            .await
            .unwrap();
        assert_eq!(source.call_count(), 1);
        assert!(source.calls()[0].sql.contains("a.id = ?"));
        match ops.as_slice() {
            [DocumentOp::Update { id, doc, .. }] => {
                assert_eq!(id, "1");
                assert_eq!(doc, &row(json!({"tag_name": null})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_main_requery_writes_queried_document() {
        let m = mapping(concat!(
            "  _id: id\n",
            "  sql: SELECT a.id, a.tag_id, b.name AS tag_name FROM orders a LEFT JOIN tags b ON a.tag_id = b.id\n",
        ));
        let source = Arc::new(ScriptedSource::new(|_, _| {
            Ok(vec![json!({"id": 1, "tag_id": 7, "tag_name": "red"}).as_object().cloned().unwrap()])
        }));
        let fx = Fixture::new(m, source);
        let ops = fx
            .plan(&MainRequery::new(vec![]), Operation::Insert, json!({"id": 1, "tag_id": 7}), None)
            .await
            .unwrap();
        assert!(matches!(
            &ops[..],
            [DocumentOp::Index { id, doc, .. }] if id == "1" && doc == &row(json!({"tag_id": 7, "tag_name": "red"}))
        ));
    }

    #[tokio::test]
    async fn test_computed_id_delete_evaluates_expression() {
        let m = mapping("  _id: _id\n  sql: SELECT CONCAT(a.kind, '-', a.id) AS _id, a.name FROM items a\n");
        let source = Arc::new(ScriptedSource::new(|_, params| {
            let id = format!("{}-{}", params[0].as_str().unwrap_or(""), params[1]);
            Ok(vec![json!({"id": id}).as_object().cloned().unwrap()])
        }));
        let fx = Fixture::new(m, source.clone());
        let ops = fx
            .plan(&MainRequery::new(vec![]), Operation::Delete, json!({"id": 4, "kind": "book"}), None)
            .await
            .unwrap();
        assert!(matches!(&ops[..], [DocumentOp::Delete { id, .. }] if id == "book-4"));
        assert!(source.calls()[0].sql.starts_with("SELECT CONCAT(?, '-', ?)"));
    }

    const ORDERS: &str = concat!(
        "  _id: id\n",
        "  sql: SELECT a.id, a.tag_id, b.name AS tag_name FROM orders a LEFT JOIN tags b ON a.tag_id = b.id\n",
    );

    #[tokio::test]
    async fn test_join_simple_patch_matches_exposed_key() {
        let source = Arc::new(ScriptedSource::empty());
        let fx = Fixture::new(mapping(ORDERS), source.clone());
        let ops = fx
            .plan(
                &JoinSimplePatch::new("b"),
                Operation::Update,
                json!({"id": 7, "name": "blue"}),
                Some(json!({"name": "red"})),
            )
            .await
            .unwrap();
        assert_eq!(source.call_count(), 0);
        assert_eq!(
            ops,
            vec![DocumentOp::UpdateByQuery {
                index: fx.mapping.index.clone(),
                matches: row(json!({"tag_id": 7})),
                doc: row(json!({"tag_name": "blue"})),
            }]
        );
    }

    #[tokio::test]
    async fn test_join_simple_patch_locates_ids_without_exposed_key() {
        let m = mapping(concat!(
            "  _id: id\n",
            "  sql: SELECT a.id, b.name AS tag_name FROM orders a LEFT JOIN tags b ON a.tag_id = b.id\n",
        ));
        let source = Arc::new(ScriptedSource::new(|_, _| {
            Ok(vec![
                json!({"id": 1, "tag_name": "red"}).as_object().cloned().unwrap(),
                json!({"id": 10, "tag_name": "red"}).as_object().cloned().unwrap(),
            ])
        }));
        let fx = Fixture::new(m, source.clone());
        let ops = fx
            .plan(&JoinSimplePatch::new("b"), Operation::Delete, json!({"id": 7, "name": "red"}), None)
            .await
            .unwrap();
        assert!(source.calls()[0].sql.contains("(a.tag_id) = ?"));
        match ops.as_slice() {
            [DocumentOp::UpdateByQuery { matches, doc, .. }] => {
                assert_eq!(matches[ID_MATCH_KEY], json!(["1", "10"]));
                assert_eq!(doc, &row(json!({"tag_name": null})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_simple_patch_key_change_nulls_old_side() {
        let fx = Fixture::new(mapping(ORDERS), Arc::new(ScriptedSource::empty()));
        let ops = fx
            .plan(
                &JoinSimplePatch::new("b"),
                Operation::Update,
                json!({"id": 8, "name": "red"}),
                Some(json!({"id": 7})),
            )
            .await
            .unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], DocumentOp::UpdateByQuery { matches, doc, .. }
            if matches == &row(json!({"tag_id": 7})) && doc == &row(json!({"tag_name": null}))));
        assert!(matches!(&ops[1], DocumentOp::UpdateByQuery { matches, doc, .. }
            if matches == &row(json!({"tag_id": 8})) && doc == &row(json!({"tag_name": "red"}))));
    }

    #[tokio::test]
    async fn test_join_subquery_patch_reruns_derived_table() {
        let m = mapping(concat!(
            "  _id: id\n",
            "  sql: SELECT a.id, a.label_id, s.label FROM orders a LEFT JOIN (SELECT id, label FROM labels) s ON s.id = a.label_id\n",
        ));
        let source = Arc::new(ScriptedSource::new(|_, _| {
            Ok(vec![json!({"id": 3, "label": "fresh"}).as_object().cloned().unwrap()])
        }));
        let fx = Fixture::new(m, source.clone());
        let ops = fx
            .plan(&JoinSubqueryPatch::new("s"), Operation::Insert, json!({"id": 3, "label": "fresh"}), None)
            .await
            .unwrap();
        assert!(source.calls()[0].sql.ends_with("s WHERE s.id = ?"));
        assert!(matches!(&ops[..], [DocumentOp::UpdateByQuery { matches, doc, .. }]
            if matches == &row(json!({"label_id": 3})) && doc == &row(json!({"label": "fresh"}))));
    }

    #[tokio::test]
    async fn test_join_full_requery_updates_each_document() {
        let m = mapping(concat!(
            "  _id: id\n",
            "  sql: SELECT a.id, UPPER(c.label) AS label FROM orders a LEFT JOIN labels c ON a.label_id = c.id\n",
        ));
        let source = Arc::new(ScriptedSource::new(|_, _| {
            Ok(vec![
                json!({"id": 1, "label": "HOT"}).as_object().cloned().unwrap(),
                json!({"id": 2, "label": "HOT"}).as_object().cloned().unwrap(),
            ])
        }));
        let fx = Fixture::new(m, source.clone());
        let ops = fx
            .plan(
                &JoinFullRequery::new("c"),
                Operation::Update,
                json!({"id": 5, "label": "hot"}),
                Some(json!({"label": "cold"})),
            )
            .await
            .unwrap();
        assert!(source.calls()[0].sql.contains("a.label_id = ?"));
        assert_eq!(source.calls()[0].params, vec![json!(5)]);
        let ids: Vec<_> = ops.iter().filter_map(DocumentOp::doc_id).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_object_field_refresh_patches_bound_parent() {
        let m = mapping(concat!(
            "  _id: id\n  sql: SELECT a.id, a.name FROM users a\n",
            "  objFields:\n    roles:\n      type: array\n      sql: \"SELECT r.role FROM user_role r WHERE r.user_id = '${id}'\"\n",
        ));
        let source = Arc::new(ScriptedSource::new(|_, _| {
            Ok(vec![
                json!({"role": "admin"}).as_object().cloned().unwrap(),
                json!({"role": "dev"}).as_object().cloned().unwrap(),
            ])
        }));
        let fx = Fixture::new(m, source.clone());
        let handler = ObjectFieldRefresh::new(vec!["roles".into()]);
        let ops = fx
            .plan(&handler, Operation::Insert, json!({"user_id": 4, "role": "dev"}), None)
            .await
            .unwrap();
        assert_eq!(source.calls()[0].params, vec![json!(4)]);
        assert_eq!(
            ops,
            vec![DocumentOp::UpdateByQuery {
                index: fx.mapping.index.clone(),
                matches: row(json!({"_id": "4"})),
                doc: row(json!({"roles": ["admin", "dev"]})),
            }]
        );

        let unwatched = fx
            .plan(
                &handler,
                Operation::Update,
                json!({"user_id": 4, "role": "dev", "note": "x"}),
                Some(json!({"note": "y"})),
            )
            .await
            .unwrap();
        assert!(unwatched.is_empty());
    }

    const DEPT_USERS: &str = "  _id: id\n  sql: SELECT a.id, a.name, a.dept_id FROM users a\n";

    fn dept_labels() -> Arc<ScriptedSource> {
        Arc::new(ScriptedSource::new(|_, params| {
            let label = format!("dept{}", params[0]);
            Ok(vec![json!({"label": label}).as_object().cloned().unwrap()])
        }))
    }

    #[tokio::test]
    async fn test_object_field_refresh_resolves_each_bound_value_separately() {
        let m = mapping(&format!(
            "{DEPT_USERS}  objFields:\n    depts:\n      type: array\n      sql: \"SELECT d.label FROM depts d WHERE d.id = ${{dept_id}} OR d.parent_id = ${{dept_id}}\"\n"
        ));
        let source = dept_labels();
        let fx = Fixture::new(m, source.clone());
        let handler = ObjectFieldRefresh::new(vec!["depts".into()]);

        let ops = fx
            .plan(&handler, Operation::Insert, json!({"id": 5, "parent_id": 1, "label": "x"}), None)
            .await
            .unwrap();
        let params: Vec<Vec<Value>> = source.calls().into_iter().map(|c| c.params).collect();
        assert_eq!(params, vec![vec![json!(5), json!(5)], vec![json!(1), json!(1)]]);
        assert_eq!(
            ops,
            vec![
                DocumentOp::UpdateByQuery {
                    index: fx.mapping.index.clone(),
                    matches: row(json!({"dept_id": 5})),
                    doc: row(json!({"depts": ["dept5"]})),
                },
                DocumentOp::UpdateByQuery {
                    index: fx.mapping.index.clone(),
                    matches: row(json!({"dept_id": 1})),
                    doc: row(json!({"depts": ["dept1"]})),
                },
            ]
        );

        // A null parent reference addresses no documents.
        let ops = fx
            .plan(&handler, Operation::Insert, json!({"id": 6, "parent_id": null, "label": "y"}), None)
            .await
            .unwrap();
        assert_eq!(
            ops,
            vec![DocumentOp::UpdateByQuery {
                index: fx.mapping.index.clone(),
                matches: row(json!({"dept_id": 6})),
                doc: row(json!({"depts": ["dept6"]})),
            }]
        );
    }

    #[tokio::test]
    async fn test_object_field_refresh_skips_partially_null_keys() {
        let m = mapping(&format!(
            "{DEPT_USERS}  objFields:\n    roles:\n      type: array\n      sql: \"SELECT r.role FROM user_role r WHERE r.user_id = ${{id}} AND r.dept = ${{dept_id}}\"\n"
        ));
        let source = dept_labels();
        let fx = Fixture::new(m, source.clone());
        let handler = ObjectFieldRefresh::new(vec!["roles".into()]);

        let ops = fx
            .plan(&handler, Operation::Insert, json!({"user_id": 3, "dept": null, "role": "dev"}), None)
            .await
            .unwrap();
        assert!(ops.is_empty());
        assert_eq!(source.call_count(), 0);

        let ops = fx
            .plan(&handler, Operation::Insert, json!({"user_id": 3, "dept": 2, "role": "dev"}), None)
            .await
            .unwrap();
        match ops.as_slice() {
            [DocumentOp::UpdateByQuery { matches, .. }] => {
                assert_eq!(matches, &row(json!({"_id": "3", "dept_id": 2})));
            }
            other => panic!("unexpected ops {other:?}"),
        }
    }
}
