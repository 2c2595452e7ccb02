// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full index (re)population.
//!
//! The [`BulkLoader`] streams a mapping's root query and writes one whole
//! document per row, through the same field extraction and object-field
//! resolution as incremental sync and the same commit thresholds.
//!
//! An `etlCondition` narrows the load. Its `{}` markers are bound
//! positionally to the caller's parameters:
//!
//! ```yaml
//! etlCondition: "a.updated_at >= {} AND a.region = {}"
//! ```

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::batching::BulkBuffer;
use crate::coerce::FieldTypeCache;
use crate::config::EngineConfig;
use crate::engine::{apply_relations, fields_from_view, require_id, upsert_op};
use crate::error::SyncError;
use crate::mapping::DocumentMapping;
use crate::metrics;
use crate::resolver::NestedFieldResolver;
use crate::sink::DocumentSink;
use crate::source::RowSource;

/// Result of one load.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EtlOutcome {
    /// Rows read from the source and written as documents.
    pub rows_processed: usize,
    /// Rows skipped because their document could not be built.
    pub rows_failed: usize,
    pub commits: usize,
    /// Operations the sink reported as not found (logged, not fatal).
    pub not_found: usize,
}

pub struct BulkLoader {
    resolver: NestedFieldResolver,
    sink: Arc<dyn DocumentSink>,
    field_types: FieldTypeCache,
}

/// Turn `{}` markers into `?` placeholders, checking the parameter count.
fn bind_condition(condition: &str, params: &[Value]) -> Result<String, SyncError> {
    let markers = condition.matches("{}").count();
    if markers != params.len() {
        return Err(SyncError::config(format!(
            "etl condition has {markers} placeholder(s) but {} parameter(s) were given",
            params.len()
        )));
    }
    Ok(condition.replace("{}", "?"))
}

impl BulkLoader {
    pub fn new(config: &EngineConfig, source: Arc<dyn RowSource>, sink: Arc<dyn DocumentSink>) -> Self {
        Self {
            resolver: NestedFieldResolver::new(source, config.resolver_workers),
            sink,
            field_types: FieldTypeCache::new(),
        }
    }

    /// Load every row of the mapping's view, narrowed by its `etlCondition`
    /// when one is declared.
    pub async fn load(&self, mapping: &Arc<DocumentMapping>, params: &[Value]) -> Result<EtlOutcome, SyncError> {
        match mapping.etl_condition.as_deref() {
            Some(condition) => self.load_where(mapping, condition, params).await,
            None if params.is_empty() => self.run(mapping, mapping.graph.sql.clone(), params).await,
            None => Err(SyncError::config(format!(
                "{}: parameters given but the mapping declares no etl condition",
                mapping.name
            ))),
        }
    }

    /// Load the rows matching `condition` (`{}` markers bound to `params`).
    pub async fn load_where(
        &self,
        mapping: &Arc<DocumentMapping>,
        condition: &str,
        params: &[Value],
    ) -> Result<EtlOutcome, SyncError> {
        let sql = mapping.graph.with_condition(&bind_condition(condition, params)?)?;
        self.run(mapping, sql, params).await
    }

    async fn run(&self, mapping: &Arc<DocumentMapping>, sql: String, params: &[Value]) -> Result<EtlOutcome, SyncError> {
        info!(mapping = %mapping.name, index = %mapping.index.index, "Bulk load started");
        let _timer = metrics::LatencyTimer::new("etl", "load");
        let result = self.stream_rows(mapping, &sql, params).await;
        metrics::record_etl_run(&mapping.name, result.is_ok());
        match &result {
            Ok(outcome) => info!(
                mapping = %mapping.name,
                rows = outcome.rows_processed,
                failed = outcome.rows_failed,
                commits = outcome.commits,
                "Bulk load finished"
            ),
            Err(e) => warn!(mapping = %mapping.name, error = %e, "Bulk load aborted"),
        }
        result
    }

    async fn stream_rows(
        &self,
        mapping: &Arc<DocumentMapping>,
        sql: &str,
        params: &[Value],
    ) -> Result<EtlOutcome, SyncError> {
        let types = match self.field_types.get(&mapping.index) {
            Some(types) => types,
            None => {
                let types = self.sink.field_types(&mapping.index).await?;
                self.field_types.insert(mapping.index.clone(), types)
            }
        };
        let mut buffer = BulkBuffer::for_mapping(Arc::clone(&self.sink), mapping);
        let mut outcome = EtlOutcome::default();

        let mut rows = self.resolver.source().stream(&mapping.data_source_key, sql, params);
        while let Some(view) = rows.next().await {
            let view = view.map_err(|e| SyncError::resolution(format!("{}: bulk load query", mapping.name), e))?;

            let built = async {
                let id = require_id(mapping, &view)?;
                let mut doc = fields_from_view(mapping, &view, &types);
                let routing = apply_relations(mapping, &view, &mut doc);
                self.resolver.resolve_into(mapping, &view, &types, &mut doc).await?;
                upsert_op(mapping, &id, doc, routing)
            }
            .await;

            match built {
                Ok(op) => {
                    buffer.push(op).await?;
                    outcome.rows_processed += 1;
                }
                Err(e) if e.is_row_scoped() => {
                    warn!(mapping = %mapping.name, error = %e, "Bulk load skipped row");
                    outcome.rows_failed += 1;
                }
                Err(e) => return Err(e),
            }
        }
        drop(rows);

        let stats = buffer.finish().await?;
        outcome.commits = stats.commits;
        outcome.not_found = stats.not_found;
        metrics::record_etl_rows(&mapping.name, outcome.rows_processed);
        debug!(mapping = %mapping.name, ops = stats.ops, bytes = stats.bytes, "Bulk load committed");
        Ok(outcome)
    }
}
