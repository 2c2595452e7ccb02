use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use thiserror::Error;

use crate::event::Row;

#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Unknown data source: {0}")]
    MissingDataSource(String),
    #[error("Query backend error: {0}")]
    Backend(String),
    #[error("Cannot decode column '{column}': {message}")]
    Decode { column: String, message: String },
}

/// Executes SQL against a named data source.
///
/// Rows come back as ordered JSON maps keyed by result column label. `params`
/// bind positionally to `?` placeholders.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn query(&self, key: &str, sql: &str, params: &[Value]) -> Result<Vec<Row>, SourceError>;

    /// Stream a large result set.
    /// Default implementation buffers [`RowSource::query`].
    fn stream<'a>(
        &'a self,
        key: &'a str,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxStream<'a, Result<Row, SourceError>> {
        stream::once(self.query(key, sql, params))
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}
