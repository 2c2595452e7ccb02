// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mapping model: a schema graph bound to a target index.
//!
//! A [`DocumentMapping`] is built once from a [`MappingFile`] and never
//! mutated afterwards. A changed file produces a new mapping that replaces the
//! old one in the [`MappingRegistry`]; syncs already holding the old `Arc`
//! finish with it.
//!
//! # Validation
//!
//! [`DocumentMapping::build`] is a pure function of the file and the engine
//! config. It rejects:
//! - a missing `_index` or `sql`
//! - both or neither of `_id` / `pk`, or one naming no output field
//! - an unknown data source
//! - a `joining` object field without a separator
//! - a relation whose parent is not an output field
//! - any root or child SQL the schema parser rejects

mod file;
mod registry;

pub use file::{IndexMappingFile, MappingFile, ObjFieldDecl, ObjFieldTable, RelationDecl};
pub use registry::{LoadReport, MappingRegistry, RouteKey};

use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::event::{row_get, Row};
use crate::schema::{self, ChildSchemaGraph, SchemaGraph};

/// Target index (and legacy document type).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexIdentity {
    pub index: String,
    pub doc_type: Option<String>,
}

impl IndexIdentity {
    pub fn new(index: impl Into<String>, doc_type: Option<String>) -> Self {
        Self {
            index: index.into(),
            doc_type,
        }
    }
}

impl std::fmt::Display for IndexIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.doc_type {
            Some(t) => write!(f, "{}/{}", self.index, t),
            None => f.write_str(&self.index),
        }
    }
}

/// How a row maps to a document identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdStrategy {
    /// Output field whose value is the document id.
    Id(String),
    /// Output field holding a primary key stored in the document; documents
    /// are located by querying it.
    Pk(String),
}

impl IdStrategy {
    pub fn field(&self) -> &str {
        match self {
            IdStrategy::Id(f) | IdStrategy::Pk(f) => f,
        }
    }

    pub fn is_pk(&self) -> bool {
        matches!(self, IdStrategy::Pk(_))
    }
}

/// Result shaping of an object field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFieldKind {
    Array,
    Object,
    ObjectArray,
    Joining,
    ObjectFlat,
}

impl ObjectFieldKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            "objectarray" => Some(Self::ObjectArray),
            "joining" => Some(Self::Joining),
            "objectflat" => Some(Self::ObjectFlat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::Object => "object",
            Self::ObjectArray => "objectArray",
            Self::Joining => "joining",
            Self::ObjectFlat => "objectFlat",
        }
    }
}

/// A document field filled by a sub-query, or reshaped from its own column.
#[derive(Debug, Clone)]
pub struct ObjectFieldSpec {
    pub name: String,
    pub kind: ObjectFieldKind,
    /// Sub-query; `None` reshapes the field's own column value.
    pub child: Option<ChildSchemaGraph>,
    pub separator: Option<String>,
    /// Refresh parents when the child table changes.
    pub reverse_update: bool,
}

impl ObjectFieldSpec {
    /// True when a change on `table` should refresh this field.
    pub fn is_fed_by(&self, table: &str) -> bool {
        self.reverse_update && self.child.as_ref().is_some_and(|c| c.table().backs(table))
    }
}

/// Parent/child join-field declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSpec {
    /// Document field holding `{name, parent}`.
    pub field: String,
    pub name: String,
    /// Output field carrying the parent id (and routing key).
    pub parent: Option<String>,
}

/// Deployable mapping.
#[derive(Debug, Clone)]
pub struct DocumentMapping {
    /// Configuration-file identity.
    pub name: String,
    pub data_source_key: String,
    pub source: String,
    pub group: Option<String>,
    /// Database the data source's events carry.
    pub database: String,
    pub index: IndexIdentity,
    pub graph: SchemaGraph,
    pub id: IdStrategy,
    pub upsert: bool,
    pub skip_fields: HashSet<String>,
    pub commit_batch_rows: usize,
    pub commit_batch_bytes: usize,
    pub object_fields: IndexMap<String, ObjectFieldSpec>,
    pub relations: IndexMap<String, RelationSpec>,
    pub etl_condition: Option<String>,
    pub sync_by_timestamp: bool,
    pub sync_interval: Option<Duration>,
}

impl DocumentMapping {
    /// Validate a mapping file and bind it to its schema graph.
    pub fn build(name: &str, file: MappingFile, config: &EngineConfig) -> Result<Self, SyncError> {
        let m = file.es_mapping;
        let index = m
            .index
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| SyncError::config(format!("{name}: `_index` is required")))?;
        let sql = m
            .sql
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SyncError::config(format!("{name}: `sql` is required")))?;
        let database = config.data_source(&file.data_source_key)?.schema_name()?;

        let graph = schema::parse(&sql)?;

        let id = match (m.id.filter(|s| !s.is_empty()), m.pk.filter(|s| !s.is_empty())) {
            (Some(id), None) => IdStrategy::Id(declared_field(&graph, name, &id)?),
            (None, Some(pk)) => IdStrategy::Pk(declared_field(&graph, name, &pk)?),
            (Some(_), Some(_)) => {
                return Err(SyncError::config(format!("{name}: declare either `_id` or `pk`, not both")))
            }
            (None, None) => {
                return Err(SyncError::config(format!("{name}: one of `_id` or `pk` is required")))
            }
        };

        let mut object_fields = IndexMap::new();
        for (field, decl) in m.obj_fields {
            let spec = object_field(&graph, name, &field, decl.into_table())?;
            object_fields.insert(field, spec);
        }

        let mut relations = IndexMap::new();
        for (field, decl) in m.relations {
            let parent = decl
                .parent
                .map(|p| declared_field(&graph, name, &p))
                .transpose()?;
            relations.insert(
                field.clone(),
                RelationSpec {
                    field,
                    name: decl.name,
                    parent,
                },
            );
        }

        Ok(Self {
            name: name.to_string(),
            data_source_key: file.data_source_key,
            source: file.destination.unwrap_or_default(),
            group: file.group_id.filter(|g| !g.is_empty()),
            database,
            index: IndexIdentity::new(index, m.doc_type.filter(|t| !t.is_empty())),
            graph,
            id,
            upsert: m.upsert,
            skip_fields: m.skips.into_iter().map(|s| s.to_ascii_lowercase()).collect(),
            commit_batch_rows: m
                .commit_batch
                .filter(|n| *n > 0)
                .unwrap_or(config.default_commit_batch_rows),
            commit_batch_bytes: m
                .commit_batch_size
                .filter(|n| *n > 0)
                .unwrap_or(config.default_commit_batch_bytes),
            object_fields,
            relations,
            etl_condition: m.etl_condition.filter(|c| !c.trim().is_empty()),
            sync_by_timestamp: m.sync_by_timestamp,
            sync_interval: m.sync_interval.map(Duration::from_millis),
        })
    }

    /// Parse YAML text and build.
    pub fn from_yaml(name: &str, text: &str, config: &EngineConfig) -> Result<Self, SyncError> {
        Self::build(name, MappingFile::from_yaml(text)?, config)
    }

    pub fn is_skipped(&self, field: &str) -> bool {
        self.skip_fields.contains(&field.to_ascii_lowercase())
    }

    /// Whether `field` belongs in a document body. The id / pk field never does.
    pub fn writes_field(&self, field: &str) -> bool {
        !self.is_skipped(field) && !field.eq_ignore_ascii_case(self.id.field())
    }

    /// Whether an object field replaces this output field's value.
    pub fn object_field(&self, field: &str) -> Option<&ObjectFieldSpec> {
        self.object_fields
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .map(|(_, spec)| spec)
    }

    /// Id / pk value of a row keyed by output field names.
    pub fn id_value(&self, row: &Row) -> Option<Value> {
        row_get(row, self.id.field()).filter(|v| !v.is_null()).cloned()
    }

    /// Object fields refreshed by changes on `table`.
    pub fn object_fields_fed_by<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ObjectFieldSpec> + 'a {
        self.object_fields.values().filter(move |f| f.is_fed_by(table))
    }

    /// Routing key for the parent/child join field, if any relation names a parent.
    pub fn routing_field(&self) -> Option<&str> {
        self.relations.values().find_map(|r| r.parent.as_deref())
    }

    /// Physical tables whose changes this mapping must react to.
    pub fn watched_tables(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        let mut push = |schema: Option<&str>, table: &str| {
            let db = schema.unwrap_or(&self.database).to_string();
            if !out.iter().any(|(d, t)| d.eq_ignore_ascii_case(&db) && t.eq_ignore_ascii_case(table)) {
                out.push((db, table.to_string()));
            }
        };
        for t in self.graph.tables.values() {
            push(t.schema.as_deref(), &t.table);
        }
        for f in self.object_fields.values().filter(|f| f.reverse_update) {
            if let Some(child) = &f.child {
                push(child.table().schema.as_deref(), &child.table().table);
            }
        }
        out
    }
}

fn declared_field(graph: &SchemaGraph, mapping: &str, field: &str) -> Result<String, SyncError> {
    graph
        .field(field)
        .map(|f| f.name.clone())
        .ok_or_else(|| SyncError::config(format!("{mapping}: `{field}` is not an output field of the mapping SQL")))
}

fn object_field(
    graph: &SchemaGraph,
    mapping: &str,
    field: &str,
    decl: ObjFieldTable,
) -> Result<ObjectFieldSpec, SyncError> {
    let kind = ObjectFieldKind::parse(&decl.kind).ok_or_else(|| {
        SyncError::config(format!("{mapping}: object field `{field}` has unknown type `{}`", decl.kind))
    })?;
    if kind == ObjectFieldKind::Joining && decl.separator.as_deref().map_or(true, str::is_empty) {
        return Err(SyncError::config(format!(
            "{mapping}: joining field `{field}` needs a separator"
        )));
    }
    let child = decl
        .sql
        .filter(|s| !s.trim().is_empty())
        .map(|sql| schema::parse_child(&sql, graph))
        .transpose()?;
    Ok(ObjectFieldSpec {
        name: field.to_string(),
        kind,
        child,
        separator: decl.separator,
        reverse_update: decl.reverse_update,
    })
}
