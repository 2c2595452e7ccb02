use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::coerce::FieldTypes;
use crate::event::Row;
use crate::mapping::IndexIdentity;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Document store backend error: {0}")]
    Backend(String),
    #[error("Commit rejected: {}", failures.join("; "))]
    Rejected { failures: Vec<String> },
}

/// Reserved match key addressing the document identity in [`DocumentOp::UpdateByQuery`].
pub const ID_MATCH_KEY: &str = "_id";

/// One write against the document store.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOp {
    /// Create or replace a whole document.
    Index {
        index: IndexIdentity,
        id: String,
        doc: Row,
        routing: Option<String>,
    },
    /// Merge `doc` into an existing document; `upsert` creates it when absent.
    Update {
        index: IndexIdentity,
        id: String,
        doc: Row,
        routing: Option<String>,
        upsert: bool,
    },
    /// Merge `doc` into every document whose fields match `matches`.
    ///
    /// An array match value means "any of". The key [`ID_MATCH_KEY`] matches
    /// the document identity.
    UpdateByQuery {
        index: IndexIdentity,
        matches: Row,
        doc: Row,
    },
    Delete {
        index: IndexIdentity,
        id: String,
        routing: Option<String>,
    },
}

impl DocumentOp {
    pub fn index(&self) -> &IndexIdentity {
        match self {
            DocumentOp::Index { index, .. }
            | DocumentOp::Update { index, .. }
            | DocumentOp::UpdateByQuery { index, .. }
            | DocumentOp::Delete { index, .. } => index,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DocumentOp::Index { .. } => "index",
            DocumentOp::Update { .. } => "update",
            DocumentOp::UpdateByQuery { .. } => "update_by_query",
            DocumentOp::Delete { .. } => "delete",
        }
    }

    /// Target id for point operations.
    pub fn doc_id(&self) -> Option<&str> {
        match self {
            DocumentOp::Index { id, .. } | DocumentOp::Update { id, .. } | DocumentOp::Delete { id, .. } => {
                Some(id)
            }
            DocumentOp::UpdateByQuery { .. } => None,
        }
    }

    /// Approximate bulk-request size of this operation.
    pub fn estimated_bytes(&self) -> usize {
        let json_len = |row: &Row| serde_json::to_vec(row).map(|v| v.len()).unwrap_or(0);
        let header = self.index().index.len() + 32;
        match self {
            DocumentOp::Index { id, doc, .. } | DocumentOp::Update { id, doc, .. } => header + id.len() + json_len(doc),
            DocumentOp::UpdateByQuery { matches, doc, .. } => header + json_len(matches) + json_len(doc),
            DocumentOp::Delete { id, .. } => header + id.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Target document absent. Never fatal.
    NotFound,
    Other(String),
}

/// Failure of one operation inside a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpFailure {
    /// Position in the committed slice.
    pub op_index: usize,
    pub kind: FailureKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub succeeded: usize,
    pub failures: Vec<OpFailure>,
}

impl CommitOutcome {
    #[must_use]
    pub fn all_succeeded(count: usize) -> Self {
        Self {
            succeeded: count,
            failures: Vec::new(),
        }
    }

    pub fn not_found(&self) -> impl Iterator<Item = &OpFailure> {
        self.failures.iter().filter(|f| f.kind == FailureKind::NotFound)
    }

    pub fn fatal(&self) -> impl Iterator<Item = (&OpFailure, &str)> {
        self.failures.iter().filter_map(|f| match &f.kind {
            FailureKind::Other(reason) => Some((f, reason.as_str())),
            FailureKind::NotFound => None,
        })
    }
}

/// Document store capability consumed by the engine and the bulk loader.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Apply `ops` in order as one bulk request.
    ///
    /// `Err` means the request as a whole failed; per-operation failures are
    /// reported in the outcome.
    async fn commit(&self, ops: &[DocumentOp]) -> Result<CommitOutcome, SinkError>;

    /// Declared field types of `index`, used for value coercion.
    /// Default implementation declares none, so values pass through.
    async fn field_types(&self, index: &IndexIdentity) -> Result<FieldTypes, SinkError> {
        let _ = index;
        Ok(FieldTypes::new())
    }
}

/// Whether a stored value satisfies a match value (arrays mean any-of).
pub fn match_value(stored: Option<&Value>, wanted: &Value) -> bool {
    match wanted {
        Value::Array(any) => any.iter().any(|w| match_value(stored, w)),
        _ => stored.is_some_and(|s| loosely_equal(s, wanted)),
    }
}

/// Equality that treats `5` and `"5"` as the same key.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (scalar_text(a), scalar_text(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
