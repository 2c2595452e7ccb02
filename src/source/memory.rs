use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::traits::{RowSource, SourceError};
use crate::event::Row;

type Responder = dyn Fn(&str, &[Value]) -> Result<Vec<Row>, SourceError> + Send + Sync;

/// One query seen by a [`ScriptedSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCall {
    pub key: String,
    pub sql: String,
    pub params: Vec<Value>,
}

/// In-memory source answering from a closure. Records every call.
pub struct ScriptedSource {
    responder: Box<Responder>,
    calls: Mutex<Vec<QueryCall>>,
}

impl ScriptedSource {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Result<Vec<Row>, SourceError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Source that returns no rows for every query.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(|_, _| Ok(Vec::new()))
    }

    #[must_use]
    pub fn calls(&self) -> Vec<QueryCall> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RowSource for ScriptedSource {
    async fn query(&self, key: &str, sql: &str, params: &[Value]) -> Result<Vec<Row>, SourceError> {
        self.calls.lock().push(QueryCall {
            key: key.to_string(),
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        (self.responder)(sql, params)
    }
}
