// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field-delta assembly shared by the strategies and the bulk loader.
//!
//! A *view row* is keyed by output field names: either a row returned by the
//! mapping's root query or one projected from a main-table event row. A
//! *document* is what gets written: view fields minus skips and the id field,
//! inline object fields reshaped, values coerced, relations attached.

use serde_json::Value;

use crate::coerce::{self, FieldTypes};
use crate::error::SyncError;
use crate::event::{row_get, row_value, Row};
use crate::mapping::{DocumentMapping, IdStrategy, ObjectFieldKind};
use crate::resolver::{put_object_value, shape_inline};
use crate::sink::{scalar_text, DocumentOp, ID_MATCH_KEY};

/// Document id text of an id value. Empty strings and non-scalars have none.
pub(crate) fn doc_id(value: &Value) -> Option<String> {
    scalar_text(value).filter(|s| !s.is_empty())
}

/// The row before an UPDATE: `row` with the changed columns' previous values.
pub(crate) fn old_image(row: &Row, old: Option<&Row>) -> Row {
    let mut image = row.clone();
    if let Some(old) = old {
        for (k, v) in old {
            let key = image
                .keys()
                .find(|existing| existing.eq_ignore_ascii_case(k))
                .cloned()
                .unwrap_or_else(|| k.clone());
            image.insert(key, v.clone());
        }
    }
    image
}

/// Value of a literal select expression (`'x'`, `3`, `NULL`, `TRUE`).
pub(crate) fn literal_value(expr: &str) -> Value {
    let text = expr.trim();
    if let Some(inner) = text
        .strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .or_else(|| text.strip_prefix('"').and_then(|t| t.strip_suffix('"')))
    {
        return Value::String(inner.replace("''", "'"));
    }
    if text.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if text.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if text.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    serde_json::from_str::<serde_json::Number>(text)
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Project a main-table event row onto the view.
///
/// Literal fields and simple fields of the main table are filled; everything
/// else needs a query and is left out.
pub(crate) fn view_from_event(mapping: &DocumentMapping, row: &Row) -> Row {
    let main = mapping.graph.main_table();
    let mut view = Row::new();
    for field in mapping.graph.fields.values() {
        if field.literal {
            view.insert(field.name.clone(), literal_value(&field.expr));
        } else if let Some(col) = field.column().filter(|c| field.is_simple() && c.is_owned_by(&main.alias)) {
            view.insert(field.name.clone(), row_value(row, main.source_column(&col.column)));
        }
    }
    view
}

/// Write one view value into `doc`: inline object fields are reshaped (and
/// flattened for `objectFlat`), everything else is coerced.
pub(crate) fn put_field(mapping: &DocumentMapping, doc: &mut Row, name: &str, value: Value, types: &FieldTypes) {
    match mapping.object_field(name) {
        Some(spec) if spec.child.is_none() => put_object_value(doc, spec, shape_inline(spec, value)),
        _ => {
            doc.insert(name.to_string(), coerce::coerce_field(value, name, types));
        }
    }
}

/// Document fields present in `view`. Sub-query object fields are resolved
/// separately.
pub(crate) fn fields_from_view(mapping: &DocumentMapping, view: &Row, types: &FieldTypes) -> Row {
    let mut doc = Row::new();
    for field in mapping.graph.fields.values() {
        if !mapping.writes_field(&field.name) || has_sub_query(mapping, &field.name) {
            continue;
        }
        if let Some(value) = row_get(view, &field.name) {
            put_field(mapping, &mut doc, &field.name, value.clone(), types);
        }
    }
    doc
}

pub(crate) fn has_sub_query(mapping: &DocumentMapping, field: &str) -> bool {
    mapping.object_field(field).is_some_and(|o| o.child.is_some())
}

/// Attach `{name, parent}` join objects. Returns the routing key.
pub(crate) fn apply_relations(mapping: &DocumentMapping, view: &Row, doc: &mut Row) -> Option<String> {
    let mut routing = None;
    for rel in mapping.relations.values() {
        let mut join = Row::new();
        join.insert("name".into(), Value::String(rel.name.clone()));
        if let Some(parent) = &rel.parent {
            if let Some(text) = doc_id(&row_value(view, parent)) {
                join.insert("parent".into(), Value::String(text.clone()));
                routing = Some(text);
            }
        }
        doc.insert(rel.field.clone(), Value::Object(join));
    }
    routing
}

pub(crate) fn routing_for(mapping: &DocumentMapping, view: &Row) -> Option<String> {
    mapping.routing_field().and_then(|f| doc_id(&row_value(view, f)))
}

/// Nulls for every field a document of this mapping can carry.
pub(crate) fn null_document(mapping: &DocumentMapping) -> Row {
    let mut doc = Row::new();
    for field in mapping.graph.fields.values() {
        if mapping.writes_field(&field.name) && mapping.object_field(&field.name).is_none() {
            doc.insert(field.name.clone(), Value::Null);
        }
    }
    for spec in mapping.object_fields.values() {
        null_object_field(&mut doc, spec);
    }
    doc
}

/// Null an object field; a flat field nulls the keys it would merge.
pub(crate) fn null_object_field(doc: &mut Row, spec: &crate::mapping::ObjectFieldSpec) {
    match (&spec.kind, &spec.child) {
        (ObjectFieldKind::ObjectFlat, Some(child)) => {
            for name in child.graph.fields.keys() {
                doc.insert(name.clone(), Value::Null);
            }
        }
        (ObjectFieldKind::ObjectFlat, None) => {}
        _ => {
            doc.insert(spec.name.clone(), Value::Null);
        }
    }
}

/// Match key addressing documents by the output field `field`, if documents
/// carry it. The id field is addressed through the document identity (or
/// the stored pk).
pub(crate) fn match_key(mapping: &DocumentMapping, field: &str) -> Option<String> {
    if field.eq_ignore_ascii_case(mapping.id.field()) {
        return Some(match &mapping.id {
            IdStrategy::Id(_) => ID_MATCH_KEY.to_string(),
            IdStrategy::Pk(pk) => pk.clone(),
        });
    }
    if mapping.is_skipped(field) {
        return None;
    }
    mapping.graph.field(field).map(|f| f.name.clone())
}

/// Match value for `key`: document ids are compared as text.
pub(crate) fn match_value_for(key: &str, value: Value) -> Value {
    if key == ID_MATCH_KEY {
        doc_id(&value).map(Value::String).unwrap_or(value)
    } else {
        value
    }
}

/// Match addressing every document whose id is one of `ids`.
pub(crate) fn id_match(mapping: &DocumentMapping, ids: Vec<Value>) -> Row {
    let key = match &mapping.id {
        IdStrategy::Id(_) => ID_MATCH_KEY.to_string(),
        IdStrategy::Pk(pk) => pk.clone(),
    };
    let mut values: Vec<Value> = Vec::with_capacity(ids.len());
    for id in ids {
        let v = match_value_for(&key, id);
        if !values.contains(&v) {
            values.push(v);
        }
    }
    let mut matches = Row::new();
    matches.insert(key, Value::Array(values));
    matches
}

fn id_text(mapping: &DocumentMapping, id: &Value) -> Result<String, SyncError> {
    doc_id(id).ok_or_else(|| {
        SyncError::MalformedEvent(format!(
            "{}: `{}` value {id} cannot be a document id",
            mapping.name,
            mapping.id.field()
        ))
    })
}

fn pk_match(pk: &str, id: &Value) -> Row {
    let mut matches = Row::new();
    matches.insert(pk.to_string(), id.clone());
    matches
}

/// Whole document write: index (or upsert) by id, or update every document
/// holding the pk.
pub(crate) fn upsert_op(
    mapping: &DocumentMapping,
    id: &Value,
    doc: Row,
    routing: Option<String>,
) -> Result<DocumentOp, SyncError> {
    let index = mapping.index.clone();
    Ok(match &mapping.id {
        IdStrategy::Id(_) if mapping.upsert => DocumentOp::Update {
            index,
            id: id_text(mapping, id)?,
            doc,
            routing,
            upsert: true,
        },
        IdStrategy::Id(_) => DocumentOp::Index {
            index,
            id: id_text(mapping, id)?,
            doc,
            routing,
        },
        IdStrategy::Pk(pk) => DocumentOp::UpdateByQuery {
            index,
            matches: pk_match(pk, id),
            doc,
        },
    })
}

/// Partial document write.
pub(crate) fn update_op(
    mapping: &DocumentMapping,
    id: &Value,
    doc: Row,
    routing: Option<String>,
    upsert: bool,
) -> Result<DocumentOp, SyncError> {
    let index = mapping.index.clone();
    Ok(match &mapping.id {
        IdStrategy::Id(_) => DocumentOp::Update {
            index,
            id: id_text(mapping, id)?,
            doc,
            routing,
            upsert,
        },
        IdStrategy::Pk(pk) => DocumentOp::UpdateByQuery {
            index,
            matches: pk_match(pk, id),
            doc,
        },
    })
}

/// Removal: delete by id, or null every field of documents holding the pk.
pub(crate) fn delete_op(mapping: &DocumentMapping, id: &Value, routing: Option<String>) -> Result<DocumentOp, SyncError> {
    let index = mapping.index.clone();
    Ok(match &mapping.id {
        IdStrategy::Id(_) => DocumentOp::Delete {
            index,
            id: id_text(mapping, id)?,
            routing,
        },
        IdStrategy::Pk(pk) => DocumentOp::UpdateByQuery {
            index,
            matches: pk_match(pk, id),
            doc: null_document(mapping),
        },
    })
}

/// Id of a view row, or a row-scoped error.
pub(crate) fn require_id(mapping: &DocumentMapping, view: &Row) -> Result<Value, SyncError> {
    mapping.id_value(view).ok_or_else(|| {
        SyncError::MalformedEvent(format!(
            "{}: row has no value for `{}`",
            mapping.name,
            mapping.id.field()
        ))
    })
}
