// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-event sync engine.
//!
//! The [`SyncEngine`] turns batches of row-level change events into
//! document-store writes:
//!
//! ```text
//! ChangeEvent ─► route (registry) ─► per mapping ─► classify row ─► strategy handlers
//!                                                                         │
//!                                  BulkBuffer ◄── DocumentOp ◄────────────┘
//!                                      │
//!                                      ▼
//!                                DocumentSink (commit at thresholds)
//! ```
//!
//! Mappings run concurrently within a batch; rows of one mapping are applied
//! in arrival order. A row whose delta cannot be computed is reported and
//! skipped. A commit failure aborts the batch.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use index_sync::{
//!     ChangeEvent, EngineConfig, IndexIdentity, MappingRegistry, MemorySink, ScriptedSource, StrategyKind,
//!     SyncEngine,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), index_sync::SyncError> {
//! let config = EngineConfig::default().with_data_source("defaultDS", "mysql://u:p@localhost:3306/shop");
//! let registry = Arc::new(MappingRegistry::new());
//! registry.apply_yaml(
//!     "users.yml",
//!     "dataSourceKey: defaultDS\ndestination: example\nesMapping:\n  _index: users\n  _id: id\n  sql: SELECT a.id, a.name FROM users a\n",
//!     &config,
//! )?;
//!
//! let sink = Arc::new(MemorySink::new());
//! let engine = SyncEngine::new(&config, registry, Arc::new(ScriptedSource::empty()), sink.clone());
//!
//! let row = json!({"id": 1, "name": "ann"}).as_object().cloned().unwrap();
//! let report = engine.sync_event(&ChangeEvent::insert("example", "shop", "users", vec![row])).await?;
//!
//! assert_eq!(report.count(StrategyKind::DirectPatch), 1);
//! assert!(sink.get(&IndexIdentity::new("users", None), "1").is_some());
//! # Ok(())
//! # }
//! ```

mod classify;
mod document;
mod strategies;
mod types;

pub use classify::{classify, SyncStrategy};
pub use strategies::{DirectPatch, JoinFullRequery, JoinSimplePatch, JoinSubqueryPatch, MainRequery, ObjectFieldRefresh};
pub use types::{Decision, RowFailure, StrategyKind, SyncReport};

pub(crate) use document::{apply_relations, fields_from_view, require_id, upsert_op};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::batching::BulkBuffer;
use crate::coerce::{FieldTypeCache, FieldTypes};
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::event::{ChangeEvent, ChangeSet, Operation};
use crate::mapping::{DocumentMapping, IndexIdentity, MappingRegistry, RouteKey};
use crate::metrics;
use crate::resolver::NestedFieldResolver;
use crate::sink::{DocumentOp, DocumentSink};
use crate::source::RowSource;

use strategies::RowContext;

/// Main sync engine.
///
/// Shares the [`MappingRegistry`] with whoever reloads mappings: every batch
/// routes against the registry snapshot current when the batch starts.
pub struct SyncEngine {
    registry: Arc<MappingRegistry>,
    resolver: Arc<NestedFieldResolver>,
    sink: Arc<dyn DocumentSink>,
    field_types: FieldTypeCache,
    /// Batches hold it shared; shutdown takes it exclusively to drain them.
    gate: RwLock<()>,
    shutting_down: AtomicBool,
    inflight: AtomicUsize,
}

/// Decrements the in-flight counter when a batch ends, however it ends.
struct InflightGuard<'a>(&'a AtomicUsize);

impl<'a> InflightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_inflight_batches(now);
        Self(counter)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_inflight_batches(now);
    }
}

impl SyncEngine {
    pub fn new(
        config: &EngineConfig,
        registry: Arc<MappingRegistry>,
        source: Arc<dyn RowSource>,
        sink: Arc<dyn DocumentSink>,
    ) -> Self {
        Self {
            registry,
            resolver: Arc::new(NestedFieldResolver::new(source, config.resolver_workers)),
            sink,
            field_types: FieldTypeCache::new(),
            gate: RwLock::new(()),
            shutting_down: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<NestedFieldResolver> {
        &self.resolver
    }

    pub fn sink(&self) -> &Arc<dyn DocumentSink> {
        &self.sink
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Batches currently being applied.
    #[must_use]
    pub fn inflight_batches(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Drop the cached field types of `index`; the next batch fetches them again.
    pub fn invalidate_field_types(&self, index: &IndexIdentity) {
        self.field_types.invalidate(index);
    }

    /// Field types of a mapping's index, fetched from the sink once.
    pub async fn field_types(&self, mapping: &DocumentMapping) -> Result<Arc<FieldTypes>, SyncError> {
        if let Some(types) = self.field_types.get(&mapping.index) {
            return Ok(types);
        }
        let types = self.sink.field_types(&mapping.index).await?;
        debug!(index = %mapping.index.index, fields = types.len(), "Field types loaded");
        Ok(self.field_types.insert(mapping.index.clone(), types))
    }

    /// Apply one event.
    pub async fn sync_event(&self, event: &ChangeEvent) -> Result<SyncReport, SyncError> {
        self.sync_batch(std::slice::from_ref(event)).await
    }

    /// Apply a batch of change events.
    ///
    /// Rows that fail to resolve land in [`SyncReport::failures`]; commit
    /// failures and configuration errors fail the whole call (after every
    /// mapping of the batch has finished).
    pub async fn sync_batch(&self, events: &[ChangeEvent]) -> Result<SyncReport, SyncError> {
        if self.is_shutting_down() {
            return Err(SyncError::ShuttingDown);
        }
        let _gate = self.gate.read().await;
        if self.is_shutting_down() {
            return Err(SyncError::ShuttingDown);
        }
        let _inflight = InflightGuard::enter(&self.inflight);
        let _timer = metrics::LatencyTimer::new("engine", "batch");

        let mut report = SyncReport::default();
        let mut work: IndexMap<String, (Arc<DocumentMapping>, Vec<&ChangeEvent>)> = IndexMap::new();

        for event in events {
            if event.is_ddl {
                debug!(database = %event.database, table = %event.table, "Skipping DDL event");
                report.skipped_events += 1;
                continue;
            }
            metrics::record_events(event.operation.as_str(), event.new_rows.len());

            let Some(mappings) = self.registry.route(&RouteKey::for_event(event)) else {
                debug!(
                    source = %event.source,
                    database = %event.database,
                    table = %event.table,
                    "No mapping listens to table"
                );
                report.skipped_events += 1;
                continue;
            };

            if let Err(e) = event.validate() {
                warn!(table = %event.table, error = %e, "Dropping malformed event");
                for mapping in mappings.iter() {
                    report.failures.push(RowFailure {
                        mapping: mapping.name.clone(),
                        table: event.table.clone(),
                        row: 0,
                        error: SyncError::MalformedEvent(e.to_string()),
                    });
                }
                continue;
            }

            for mapping in mappings.iter() {
                work.entry(mapping.name.clone())
                    .or_insert_with(|| (Arc::clone(mapping), Vec::new()))
                    .1
                    .push(event);
            }
        }

        let runs = work
            .into_values()
            .map(|(mapping, events)| self.sync_mapping(mapping, events));
        let results = futures::future::join_all(runs).await;

        let mut fatal = None;
        for result in results {
            match result {
                Ok(part) => report.absorb(part),
                Err(e) => {
                    error!(error = %e, "Mapping batch failed");
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        debug!(
            rows = report.rows_applied,
            ops = report.ops_emitted,
            commits = report.commits,
            failures = report.failures.len(),
            "Batch applied"
        );
        Ok(report)
    }

    /// Stop accepting batches and wait for the running ones to finish.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(inflight = self.inflight_batches(), "Sync engine shutting down");
        let _drained = self.gate.write().await;
        info!("Sync engine stopped");
    }

    async fn sync_mapping(
        &self,
        mapping: Arc<DocumentMapping>,
        events: Vec<&ChangeEvent>,
    ) -> Result<SyncReport, SyncError> {
        let types = self.field_types(&mapping).await?;
        let mut buffer = BulkBuffer::for_mapping(Arc::clone(&self.sink), &mapping);
        let mut report = SyncReport::default();

        for event in events {
            for (idx, row) in event.new_rows.iter().enumerate() {
                let old = event.old_row(idx);
                let changes = match event.operation {
                    Operation::Update => old.map(|o| ChangeSet::between(row, o)),
                    _ => None,
                };
                let strategies = classify(&mapping, &event.table, event.operation, changes.as_ref());
                for strategy in &strategies {
                    metrics::record_strategy(&mapping.name, strategy.kind().as_str());
                    report.decisions.push(Decision {
                        mapping: mapping.name.clone(),
                        table: event.table.clone(),
                        row: idx,
                        strategy: strategy.kind(),
                    });
                }

                let ctx = RowContext {
                    mapping: &mapping,
                    resolver: &self.resolver,
                    types: &types,
                    operation: event.operation,
                    row,
                    old,
                    changes: changes.as_ref(),
                };
                match plan_row(&ctx, &strategies).await {
                    Ok(ops) => {
                        metrics::record_row_outcome(&mapping.name, "applied");
                        report.rows_applied += 1;
                        report.ops_emitted += ops.len();
                        buffer.extend(ops).await?;
                    }
                    Err(e) if e.is_row_scoped() => {
                        metrics::record_row_outcome(&mapping.name, "failed");
                        warn!(
                            mapping = %mapping.name,
                            table = %event.table,
                            operation = event.operation.as_str(),
                            row = idx,
                            error = %e,
                            "Row skipped"
                        );
                        report.failures.push(RowFailure {
                            mapping: mapping.name.clone(),
                            table: event.table.clone(),
                            row: idx,
                            error: e,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let stats = buffer.finish().await?;
        report.commits = stats.commits;
        report.not_found = stats.not_found;
        Ok(report)
    }
}

/// Every strategy of one row, or nothing.
async fn plan_row(ctx: &RowContext<'_>, strategies: &[SyncStrategy]) -> Result<Vec<DocumentOp>, SyncError> {
    let _timer = metrics::LatencyTimer::new("engine", "row");
    let mut ops = Vec::new();
    for strategy in strategies {
        ops.extend(strategy.handler().plan(ctx).await?);
    }
    Ok(ops)
}
