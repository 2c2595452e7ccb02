// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-mapping bulk buffering for document writes.
//!
//! The [`BulkBuffer`] collects [`DocumentOp`]s and commits them to the sink
//! in batches, based on two thresholds: operation count and estimated bytes.
//! Whichever threshold is hit first triggers the commit. Whatever is left is
//! committed by [`BulkBuffer::finish`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use index_sync::{BatchConfig, BulkBuffer, IndexIdentity, MemorySink};
//!
//! # tokio_test_block(async {
//! let sink = Arc::new(MemorySink::new());
//! let config = BatchConfig { flush_count: 2, flush_bytes: 1024 * 1024 };
//! let mut buffer = BulkBuffer::new(sink.clone(), "orders.yml", config);
//!
//! let index = IndexIdentity::new("orders", None);
//! buffer.delete(index.clone(), "1".into(), None).await.unwrap();
//! buffer.delete(index.clone(), "2".into(), None).await.unwrap(); // commits
//! buffer.delete(index, "3".into(), None).await.unwrap();
//! let stats = buffer.finish().await.unwrap(); // commits the remainder
//! assert_eq!(stats.commits, 2);
//! assert_eq!(sink.commit_count(), 2);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use crate::event::Row;
use crate::mapping::{DocumentMapping, IndexIdentity};
use crate::metrics;
use crate::sink::{DocumentOp, DocumentSink, SinkError};

/// Commit trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Operation count threshold reached
    Count,
    /// Byte size threshold reached
    Size,
    /// End of batch or stream
    Finish,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Count => "count",
            FlushReason::Size => "size",
            FlushReason::Finish => "finish",
        }
    }
}

/// Commit thresholds
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Commit after this many operations
    pub flush_count: usize,
    /// Commit after this many estimated bytes
    pub flush_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_count: 1000,
            flush_bytes: 1024 * 1024, // 1 MB
        }
    }
}

impl BatchConfig {
    pub fn for_mapping(mapping: &DocumentMapping) -> Self {
        Self {
            flush_count: mapping.commit_batch_rows.max(1),
            flush_bytes: mapping.commit_batch_bytes.max(1),
        }
    }
}

/// Trait for items that know their own size
pub trait SizedItem {
    #[must_use]
    fn size_bytes(&self) -> usize;
}

impl SizedItem for DocumentOp {
    fn size_bytes(&self) -> usize {
        self.estimated_bytes()
    }
}

/// Operations pending commit
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub total_bytes: usize,
}

impl<T: SizedItem> Batch<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            total_bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn push(&mut self, item: T) {
        self.total_bytes += item.size_bytes();
        self.items.push(item);
    }

    pub fn take(&mut self) -> Vec<T> {
        self.total_bytes = 0;
        std::mem::take(&mut self.items)
    }

    /// Threshold reached, if any. Count is checked before size.
    pub fn ready(&self, config: &BatchConfig) -> Option<FlushReason> {
        if self.items.len() >= config.flush_count {
            Some(FlushReason::Count)
        } else if self.total_bytes >= config.flush_bytes {
            Some(FlushReason::Size)
        } else {
            None
        }
    }
}

impl<T: SizedItem> Default for Batch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Running totals of one buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStats {
    pub commits: usize,
    pub ops: usize,
    pub bytes: usize,
    /// Operations the sink reported as targeting an absent document.
    pub not_found: usize,
}

/// Buffers one mapping's operations and commits them at the thresholds.
pub struct BulkBuffer {
    sink: Arc<dyn DocumentSink>,
    mapping: String,
    config: BatchConfig,
    batch: Batch<DocumentOp>,
    stats: BulkStats,
}

impl BulkBuffer {
    pub fn new(sink: Arc<dyn DocumentSink>, mapping: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            sink,
            mapping: mapping.into(),
            config,
            batch: Batch::new(),
            stats: BulkStats::default(),
        }
    }

    pub fn for_mapping(sink: Arc<dyn DocumentSink>, mapping: &DocumentMapping) -> Self {
        Self::new(sink, mapping.name.clone(), BatchConfig::for_mapping(mapping))
    }

    /// Queue one operation, committing if a threshold is reached.
    pub async fn push(&mut self, op: DocumentOp) -> Result<Option<FlushReason>, SinkError> {
        self.batch.push(op);
        match self.batch.ready(&self.config) {
            Some(reason) => {
                self.commit(reason).await?;
                Ok(Some(reason))
            }
            None => Ok(None),
        }
    }

    /// Queue several operations. They may be split across commits.
    pub async fn extend(&mut self, ops: impl IntoIterator<Item = DocumentOp>) -> Result<(), SinkError> {
        for op in ops {
            self.push(op).await?;
        }
        Ok(())
    }

    /// Whole document: replaced, or merged and created when `upsert`.
    pub async fn index_or_upsert(
        &mut self,
        index: IndexIdentity,
        id: String,
        doc: Row,
        routing: Option<String>,
        upsert: bool,
    ) -> Result<Option<FlushReason>, SinkError> {
        let op = if upsert {
            DocumentOp::Update {
                index,
                id,
                doc,
                routing,
                upsert: true,
            }
        } else {
            DocumentOp::Index {
                index,
                id,
                doc,
                routing,
            }
        };
        self.push(op).await
    }

    pub async fn update(
        &mut self,
        index: IndexIdentity,
        id: String,
        doc: Row,
        routing: Option<String>,
        upsert: bool,
    ) -> Result<Option<FlushReason>, SinkError> {
        self.push(DocumentOp::Update {
            index,
            id,
            doc,
            routing,
            upsert,
        })
        .await
    }

    pub async fn update_by_query(
        &mut self,
        index: IndexIdentity,
        matches: Row,
        doc: Row,
    ) -> Result<Option<FlushReason>, SinkError> {
        self.push(DocumentOp::UpdateByQuery { index, matches, doc }).await
    }

    pub async fn delete(
        &mut self,
        index: IndexIdentity,
        id: String,
        routing: Option<String>,
    ) -> Result<Option<FlushReason>, SinkError> {
        self.push(DocumentOp::Delete { index, id, routing }).await
    }

    /// Commit the remainder and return the totals.
    pub async fn finish(mut self) -> Result<BulkStats, SinkError> {
        self.commit(FlushReason::Finish).await?;
        Ok(self.stats)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    #[must_use]
    pub fn stats(&self) -> BulkStats {
        self.stats
    }

    async fn commit(&mut self, reason: FlushReason) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        // Capture bytes BEFORE take() resets it
        let bytes = self.batch.total_bytes;
        let ops = self.batch.take();

        let outcome = {
            let _timer = metrics::LatencyTimer::new("sink", "commit");
            self.sink.commit(&ops).await
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::record_commit(&self.mapping, false, ops.len(), bytes);
                return Err(e);
            }
        };

        for failure in outcome.not_found() {
            let op = ops.get(failure.op_index);
            warn!(
                mapping = %self.mapping,
                op = op.map_or("unknown", DocumentOp::kind),
                id = op.and_then(DocumentOp::doc_id).unwrap_or(""),
                "Document not found, skipped"
            );
        }
        let not_found = outcome.not_found().count();
        let fatal: Vec<String> = outcome
            .fatal()
            .map(|(failure, reason)| {
                let op = ops.get(failure.op_index);
                format!(
                    "{} {}: {reason}",
                    op.map_or("unknown", DocumentOp::kind),
                    op.and_then(DocumentOp::doc_id).unwrap_or("-")
                )
            })
            .collect();

        metrics::record_commit_failures("not_found", not_found);
        metrics::record_commit(&self.mapping, fatal.is_empty(), ops.len(), bytes);

        self.stats.commits += 1;
        self.stats.ops += ops.len();
        self.stats.bytes += bytes;
        self.stats.not_found += not_found;

        if !fatal.is_empty() {
            metrics::record_commit_failures("other", fatal.len());
            return Err(SinkError::Rejected { failures: fatal });
        }
        debug!(
            mapping = %self.mapping,
            ops = ops.len(),
            bytes,
            reason = reason.as_str(),
            "Bulk commit"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn idx() -> IndexIdentity {
        IndexIdentity::new("orders", None)
    }

    fn doc(v: serde_json::Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn buffer(sink: &Arc<MemorySink>, flush_count: usize, flush_bytes: usize) -> BulkBuffer {
        BulkBuffer::new(
            sink.clone(),
            "orders.yml",
            BatchConfig {
                flush_count,
                flush_bytes,
            },
        )
    }

    #[tokio::test]
    async fn test_buffer_empty_initially() {
        let sink = Arc::new(MemorySink::new());
        let buf = buffer(&sink, 10, 1_000_000);
        assert_eq!(buf.pending(), 0);
        let stats = buf.finish().await.unwrap();
        assert_eq!(stats.commits, 0);
        assert_eq!(sink.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_on_count_threshold() {
        let sink = Arc::new(MemorySink::new());
        let mut buf = buffer(&sink, 2, 1_000_000);

        let r = buf.index_or_upsert(idx(), "1".into(), doc(json!({"a": 1})), None, false).await.unwrap();
        assert!(r.is_none());
        let r = buf.index_or_upsert(idx(), "2".into(), doc(json!({"a": 2})), None, false).await.unwrap();
        assert_eq!(r, Some(FlushReason::Count));
        assert_eq!(sink.commit_count(), 1);

        buf.index_or_upsert(idx(), "3".into(), doc(json!({"a": 3})), None, false).await.unwrap();
        let stats = buf.finish().await.unwrap();

        assert_eq!(sink.commit_count(), 2);
        assert_eq!(stats.commits, 2);
        assert_eq!(stats.ops, 3);
        assert_eq!(sink.count(&idx()), 3);
    }

    #[tokio::test]
    async fn test_commit_on_size_threshold() {
        let sink = Arc::new(MemorySink::new());
        let mut buf = buffer(&sink, 1000, 64);
        let big = doc(json!({"text": "x".repeat(100)}));
        let r = buf.index_or_upsert(idx(), "1".into(), big, None, false).await.unwrap();
        assert_eq!(r, Some(FlushReason::Size));
    }

    #[tokio::test]
    async fn test_upsert_uses_update_with_upsert() {
        let sink = Arc::new(MemorySink::new());
        let mut buf = buffer(&sink, 10, 1_000_000);
        buf.index_or_upsert(idx(), "1".into(), doc(json!({"a": 1})), Some("7".into()), true)
            .await
            .unwrap();
        buf.finish().await.unwrap();
        assert!(matches!(&sink.ops()[0], DocumentOp::Update { upsert: true, .. }));
        assert_eq!(sink.get(&idx(), "1").unwrap().routing.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_not_found_is_skipped() {
        let sink = Arc::new(MemorySink::new());
        let mut buf = buffer(&sink, 10, 1_000_000);
        buf.delete(idx(), "missing".into(), None).await.unwrap();
        buf.update(idx(), "missing".into(), doc(json!({"a": 1})), None, false)
            .await
            .unwrap();
        let stats = buf.finish().await.unwrap();
        assert_eq!(stats.not_found, 2);
    }

    #[tokio::test]
    async fn test_other_failure_is_fatal() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_commit("mapper_parsing_exception");
        let mut buf = buffer(&sink, 10, 1_000_000);
        buf.delete(idx(), "1".into(), None).await.unwrap();
        let err = buf.finish().await.unwrap_err();
        match err {
            SinkError::Rejected { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("mapper_parsing_exception"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
