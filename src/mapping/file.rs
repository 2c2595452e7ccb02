// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! On-disk mapping file format.
//!
//! ```yaml
//! dataSourceKey: defaultDS
//! destination: example
//! groupId: g1
//! esMapping:
//!   _index: users
//!   _id: _id
//!   upsert: true
//!   sql: "SELECT a.id AS _id, a.name, a.role_id FROM users a"
//!   skips: [role_id]
//!   objFields:
//!     _tags: array:;
//!     roles:
//!       type: objectArray
//!       sql: "SELECT r.id, r.name FROM user_role r WHERE r.user_id = '${_id}'"
//!   relations:
//!     user_join:
//!       name: user
//!   commitBatch: 3000
//! ```
//!
//! Deserialization only checks shape; [`DocumentMapping::build`](super::DocumentMapping::build)
//! validates meaning.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::SyncError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingFile {
    pub data_source_key: String,
    /// CDC destination (source stream) the mapping listens to.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    pub es_mapping: IndexMappingFile,
}

impl MappingFile {
    pub fn from_yaml(text: &str) -> Result<Self, SyncError> {
        serde_yaml::from_str(text).map_err(|e| SyncError::config(format!("mapping file: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMappingFile {
    #[serde(rename = "_index", default)]
    pub index: Option<String>,
    #[serde(rename = "_type", default)]
    pub doc_type: Option<String>,
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub pk: Option<String>,
    #[serde(default)]
    pub upsert: bool,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub obj_fields: IndexMap<String, ObjFieldDecl>,
    #[serde(default)]
    pub skips: Vec<String>,
    #[serde(default)]
    pub relations: IndexMap<String, RelationDecl>,
    #[serde(default)]
    pub etl_condition: Option<String>,
    #[serde(default)]
    pub commit_batch: Option<usize>,
    #[serde(default)]
    pub commit_batch_size: Option<usize>,
    #[serde(default)]
    pub sync_by_timestamp: bool,
    /// Milliseconds between time-based runs.
    #[serde(default)]
    pub sync_interval: Option<u64>,
}

/// `"array:;"` or a full table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ObjFieldDecl {
    Short(String),
    Full(ObjFieldTable),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjFieldTable {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default = "default_reverse_update")]
    pub reverse_update: bool,
}

fn default_reverse_update() -> bool { true }

impl ObjFieldDecl {
    /// Normalize to the table form.
    pub fn into_table(self) -> ObjFieldTable {
        match self {
            ObjFieldDecl::Full(table) => table,
            ObjFieldDecl::Short(text) => {
                let (kind, separator) = match text.split_once(':') {
                    Some((kind, sep)) => (kind.to_string(), Some(sep.to_string())),
                    None => (text, None),
                };
                ObjFieldTable {
                    kind,
                    sql: None,
                    separator,
                    reverse_update: default_reverse_update(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationDecl {
    /// Relation name written into the join field.
    pub name: String,
    /// Output field holding the parent id; absent for parent documents.
    #[serde(default)]
    pub parent: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
dataSourceKey: defaultDS
destination: example
groupId: g1
esMapping:
  _index: users
  _id: _id
  upsert: true
  sql: "SELECT a.id AS _id, a.name FROM users a"
  skips: [name]
  objFields:
    _tags: "array:;"
    roles:
      type: objectArray
      sql: "SELECT r.id FROM user_role r WHERE r.user_id = '${_id}'"
      reverseUpdate: false
  relations:
    user_join:
      name: user
  commitBatch: 3000
"#;

    #[test]
    fn test_parse_full_file() {
        let file = MappingFile::from_yaml(YAML).unwrap();
        assert_eq!(file.data_source_key, "defaultDS");
        assert_eq!(file.group_id.as_deref(), Some("g1"));
        let m = file.es_mapping;
        assert_eq!(m.index.as_deref(), Some("users"));
        assert!(m.upsert);
        assert_eq!(m.commit_batch, Some(3000));
        assert_eq!(m.skips, vec!["name".to_string()]);
        assert_eq!(m.relations["user_join"].name, "user");
        assert!(m.relations["user_join"].parent.is_none());
    }

    #[test]
    fn test_short_and_full_object_fields() {
        let file = MappingFile::from_yaml(YAML).unwrap();
        let mut fields = file.es_mapping.obj_fields.into_iter();
        let (name, tags) = fields.next().unwrap();
        assert_eq!(name, "_tags");
        let tags = tags.into_table();
        assert_eq!(tags.kind, "array");
        assert_eq!(tags.separator.as_deref(), Some(";"));
        assert!(tags.reverse_update);
        let (_, roles) = fields.next().unwrap();
        let roles = roles.into_table();
        assert_eq!(roles.kind, "objectArray");
        assert!(roles.sql.is_some());
        assert!(!roles.reverse_update);
    }

    #[test]
    fn test_bad_yaml_is_config_error() {
        assert!(matches!(
            MappingFile::from_yaml("esMapping: 3"),
            Err(SyncError::Configuration(_))
        ));
    }
}
