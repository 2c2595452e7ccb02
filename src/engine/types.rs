// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Types for engine results and decisions.

use std::fmt;

use crate::error::SyncError;

/// Which synchronization strategy a row was handled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    DirectPatch,
    MainRequery,
    JoinSimplePatch,
    JoinSubqueryPatch,
    JoinFullRequery,
    ObjectFieldRefresh,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::DirectPatch => "DIRECT_PATCH",
            StrategyKind::MainRequery => "MAIN_REQUERY",
            StrategyKind::JoinSimplePatch => "JOIN_SIMPLE_PATCH",
            StrategyKind::JoinSubqueryPatch => "JOIN_SUBQUERY_PATCH",
            StrategyKind::JoinFullRequery => "JOIN_FULL_REQUERY",
            StrategyKind::ObjectFieldRefresh => "OBJECT_FIELD_REFRESH",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classification made while syncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub mapping: String,
    pub table: String,
    /// Row position within its event.
    pub row: usize,
    pub strategy: StrategyKind,
}

/// A row that produced nothing because its delta could not be computed.
#[derive(Debug)]
pub struct RowFailure {
    pub mapping: String,
    pub table: String,
    pub row: usize,
    pub error: SyncError,
}

/// Outcome of [`SyncEngine::sync_batch`](super::SyncEngine::sync_batch).
#[derive(Debug, Default)]
pub struct SyncReport {
    /// (mapping, row) pairs processed successfully.
    pub rows_applied: usize,
    /// Document operations handed to the sink.
    pub ops_emitted: usize,
    pub commits: usize,
    /// Operations the sink reported as not found (logged, not fatal).
    pub not_found: usize,
    /// DDL events and events no mapping listens to.
    pub skipped_events: usize,
    pub decisions: Vec<Decision>,
    pub failures: Vec<RowFailure>,
}

impl SyncReport {
    /// Number of decisions with the given strategy.
    pub fn count(&self, strategy: StrategyKind) -> usize {
        self.decisions.iter().filter(|d| d.strategy == strategy).count()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn absorb(&mut self, other: SyncReport) {
        self.rows_applied += other.rows_applied;
        self.ops_emitted += other.ops_emitted;
        self.commits += other.commits;
        self.not_found += other.not_found;
        self.skipped_events += other.skipped_events;
        self.decisions.extend(other.decisions);
        self.failures.extend(other.failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        assert_eq!(StrategyKind::JoinSimplePatch.to_string(), "JOIN_SIMPLE_PATCH");
        assert_eq!(StrategyKind::ObjectFieldRefresh.as_str(), "OBJECT_FIELD_REFRESH");
    }

    #[test]
    fn test_report_absorb_and_count() {
        let mut total = SyncReport::default();
        let mut part = SyncReport {
            rows_applied: 2,
            ops_emitted: 3,
            ..Default::default()
        };
        part.decisions.push(Decision {
            mapping: "m".into(),
            table: "t".into(),
            row: 0,
            strategy: StrategyKind::DirectPatch,
        });
        total.absorb(part);
        assert_eq!(total.rows_applied, 2);
        assert_eq!(total.count(StrategyKind::DirectPatch), 1);
        assert_eq!(total.count(StrategyKind::MainRequery), 0);
        assert!(total.is_clean());
    }
}
