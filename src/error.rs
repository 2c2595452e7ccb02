// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Crate-level error type.
//!
//! Each collaborator seam has its own error enum ([`SchemaError`],
//! [`SourceError`], [`SinkError`]); [`SyncError`] wraps them for the
//! engine, the mapping registry and the bulk loader.

use thiserror::Error;

use crate::schema::SchemaError;
use crate::sink::SinkError;
use crate::source::SourceError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Root or child SQL could not be turned into a schema graph.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Missing data source, missing index identity, bad id/pk declaration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A re-query or object-field query failed while processing one row.
    #[error("Resolution failed for {context}: {source}")]
    Resolution {
        context: String,
        #[source]
        source: SourceError,
    },

    /// Commit to the document store failed for a reason other than not-found.
    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Malformed change event: {0}")]
    MalformedEvent(String),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl SyncError {
    pub(crate) fn resolution(context: impl Into<String>, source: SourceError) -> Self {
        Self::Resolution {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Errors that abort only the current row; everything else aborts the batch.
    #[must_use]
    pub fn is_row_scoped(&self) -> bool {
        matches!(
            self,
            SyncError::Resolution { .. } | SyncError::MalformedEvent(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_is_row_scoped() {
        let err = SyncError::resolution("orders", SourceError::Backend("boom".into()));
        assert!(err.is_row_scoped());
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_sink_error_is_not_row_scoped() {
        let err = SyncError::from(SinkError::Backend("down".into()));
        assert!(!err.is_row_scoped());
    }

    #[test]
    fn test_schema_error_converts() {
        let err: SyncError = SchemaError::Parse("no tables".into()).into();
        assert!(matches!(err, SyncError::Schema(_)));
        assert!(!err.is_row_scoped());
    }
}
