use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::traits::{
    match_value, CommitOutcome, DocumentOp, DocumentSink, FailureKind, OpFailure, SinkError, ID_MATCH_KEY,
};
use crate::coerce::FieldTypes;
use crate::event::Row;
use crate::mapping::IndexIdentity;

/// A document as held by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub source: Row,
    pub routing: Option<String>,
}

/// In-memory document store.
///
/// Applies operations with the semantics a search engine's bulk API has:
/// updates of absent documents fail as not-found unless they upsert,
/// deletes of absent documents fail as not-found, update-by-query touches
/// zero or more documents and never fails.
pub struct MemorySink {
    indices: DashMap<IndexIdentity, IndexMap<String, StoredDocument>>,
    field_types: DashMap<IndexIdentity, FieldTypes>,
    commits: Mutex<Vec<Vec<DocumentOp>>>,
    fail_next: Mutex<Option<String>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            indices: DashMap::new(),
            field_types: DashMap::new(),
            commits: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// Preload a document without recording a commit.
    pub fn seed(&self, index: &IndexIdentity, id: &str, source: Row) {
        self.indices.entry(index.clone()).or_default().insert(
            id.to_string(),
            StoredDocument {
                source,
                routing: None,
            },
        );
    }

    pub fn set_field_types(&self, index: &IndexIdentity, types: FieldTypes) {
        self.field_types.insert(index.clone(), types);
    }

    /// Every operation of the next commit fails with `reason`.
    pub fn fail_next_commit(&self, reason: &str) {
        *self.fail_next.lock() = Some(reason.to_string());
    }

    #[must_use]
    pub fn get(&self, index: &IndexIdentity, id: &str) -> Option<StoredDocument> {
        self.indices.get(index).and_then(|docs| docs.get(id).cloned())
    }

    #[must_use]
    pub fn count(&self, index: &IndexIdentity) -> usize {
        self.indices.get(index).map_or(0, |docs| docs.len())
    }

    /// Ids in insertion order.
    #[must_use]
    pub fn ids(&self, index: &IndexIdentity) -> Vec<String> {
        self.indices
            .get(index)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed operations, one entry per commit call.
    #[must_use]
    pub fn commits(&self) -> Vec<Vec<DocumentOp>> {
        self.commits.lock().clone()
    }

    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.lock().len()
    }

    /// All committed operations in order.
    #[must_use]
    pub fn ops(&self) -> Vec<DocumentOp> {
        self.commits.lock().iter().flatten().cloned().collect()
    }

    fn apply(&self, op: &DocumentOp) -> Result<(), FailureKind> {
        let mut docs = self.indices.entry(op.index().clone()).or_default();
        match op {
            DocumentOp::Index { id, doc, routing, .. } => {
                docs.insert(
                    id.clone(),
                    StoredDocument {
                        source: doc.clone(),
                        routing: routing.clone(),
                    },
                );
                Ok(())
            }
            DocumentOp::Update {
                id,
                doc,
                routing,
                upsert,
                ..
            } => match docs.get_mut(id) {
                Some(stored) => {
                    merge(&mut stored.source, doc);
                    Ok(())
                }
                None if *upsert => {
                    docs.insert(
                        id.clone(),
                        StoredDocument {
                            source: doc.clone(),
                            routing: routing.clone(),
                        },
                    );
                    Ok(())
                }
                None => Err(FailureKind::NotFound),
            },
            DocumentOp::UpdateByQuery { matches, doc, .. } => {
                for (id, stored) in docs.iter_mut() {
                    if matches_all(id, &stored.source, matches) {
                        merge(&mut stored.source, doc);
                    }
                }
                Ok(())
            }
            DocumentOp::Delete { id, .. } => docs
                .shift_remove(id)
                .map(|_| ())
                .ok_or(FailureKind::NotFound),
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

fn merge(target: &mut Row, delta: &Row) {
    for (k, v) in delta {
        target.insert(k.clone(), v.clone());
    }
}

fn matches_all(id: &str, source: &Row, matches: &Row) -> bool {
    matches.iter().all(|(key, wanted)| {
        if key == ID_MATCH_KEY {
            match_value(Some(&Value::String(id.to_string())), wanted)
        } else {
            match_value(source.get(key), wanted)
        }
    })
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn commit(&self, ops: &[DocumentOp]) -> Result<CommitOutcome, SinkError> {
        self.commits.lock().push(ops.to_vec());

        if let Some(reason) = self.fail_next.lock().take() {
            return Ok(CommitOutcome {
                succeeded: 0,
                failures: (0..ops.len())
                    .map(|op_index| OpFailure {
                        op_index,
                        kind: FailureKind::Other(reason.clone()),
                    })
                    .collect(),
            });
        }

        let mut outcome = CommitOutcome::default();
        for (op_index, op) in ops.iter().enumerate() {
            match self.apply(op) {
                Ok(()) => outcome.succeeded += 1,
                Err(kind) => outcome.failures.push(OpFailure { op_index, kind }),
            }
        }
        Ok(outcome)
    }

    async fn field_types(&self, index: &IndexIdentity) -> Result<FieldTypes, SinkError> {
        Ok(self.field_types.get(index).map(|t| t.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn idx() -> IndexIdentity {
        IndexIdentity::new("orders", None)
    }

    #[tokio::test]
    async fn test_index_then_update_merges() {
        let sink = MemorySink::new();
        sink.commit(&[
            DocumentOp::Index {
                index: idx(),
                id: "1".into(),
                doc: row(json!({"name": "a", "tag": "x"})),
                routing: None,
            },
            DocumentOp::Update {
                index: idx(),
                id: "1".into(),
                doc: row(json!({"tag": "y"})),
                routing: None,
                upsert: false,
            },
        ])
        .await
        .unwrap();
        let doc = sink.get(&idx(), "1").unwrap();
        assert_eq!(doc.source, row(json!({"name": "a", "tag": "y"})));
        assert_eq!(sink.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found_unless_upsert() {
        let sink = MemorySink::new();
        let update = |upsert| DocumentOp::Update {
            index: idx(),
            id: "9".into(),
            doc: row(json!({"tag": "y"})),
            routing: None,
            upsert,
        };
        let outcome = sink.commit(&[update(false)]).await.unwrap();
        assert_eq!(outcome.not_found().count(), 1);
        assert!(sink.get(&idx(), "9").is_none());

        let outcome = sink.commit(&[update(true)]).await.unwrap();
        assert!(outcome.failures.is_empty());
        assert!(sink.get(&idx(), "9").is_some());
    }

    #[tokio::test]
    async fn test_update_by_query_any_of() {
        let sink = MemorySink::new();
        sink.seed(&idx(), "1", row(json!({"tag_id": 5})));
        sink.seed(&idx(), "2", row(json!({"tag_id": 6})));
        sink.seed(&idx(), "10", row(json!({"tag_id": "5"})));
        sink.commit(&[DocumentOp::UpdateByQuery {
            index: idx(),
            matches: row(json!({"tag_id": 5})),
            doc: row(json!({"tag": "blue"})),
        }])
        .await
        .unwrap();
        assert_eq!(sink.get(&idx(), "1").unwrap().source["tag"], json!("blue"));
        assert_eq!(sink.get(&idx(), "10").unwrap().source["tag"], json!("blue"));
        assert!(sink.get(&idx(), "2").unwrap().source.get("tag").is_none());

        sink.commit(&[DocumentOp::UpdateByQuery {
            index: idx(),
            matches: row(json!({"_id": ["2", "10"]})),
            doc: row(json!({"tag": "red"})),
        }])
        .await
        .unwrap();
        assert_eq!(sink.get(&idx(), "2").unwrap().source["tag"], json!("red"));
        assert_eq!(sink.get(&idx(), "1").unwrap().source["tag"], json!("blue"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let sink = MemorySink::new();
        sink.seed(&idx(), "1", Row::new());
        let del = |id: &str| DocumentOp::Delete {
            index: idx(),
            id: id.into(),
            routing: None,
        };
        let outcome = sink.commit(&[del("1"), del("1")]).await.unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failures[0].op_index, 1);
        assert_eq!(sink.count(&idx()), 0);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let sink = MemorySink::new();
        sink.fail_next_commit("mapper_parsing_exception");
        let outcome = sink
            .commit(&[DocumentOp::Delete {
                index: idx(),
                id: "1".into(),
                routing: None,
            }])
            .await
            .unwrap();
        assert_eq!(outcome.fatal().count(), 1);
    }
}
