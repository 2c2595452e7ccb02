// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing from change events to active mappings.
//!
//! ```
//! use index_sync::{EngineConfig, MappingRegistry, RouteKey};
//!
//! let config = EngineConfig::default().with_data_source("ds", "mysql://localhost:3306/shop");
//! let registry = MappingRegistry::new();
//! registry
//!     .apply_yaml(
//!         "orders.yml",
//!         "dataSourceKey: ds\ndestination: example\nesMapping:\n  _index: orders\n  _id: id\n  sql: SELECT a.id, a.name FROM orders a\n",
//!         &config,
//!     )
//!     .unwrap();
//!
//! let key = RouteKey::new("example", None, "shop", "orders");
//! assert_eq!(registry.route(&key).unwrap().len(), 1);
//! ```
//!
//! # Design
//!
//! - **Snapshot swap**: readers clone an `Arc<RouteTable>` under a short read
//!   lock and route against that snapshot for the whole batch.
//! - **Copy-on-write per key**: a reload rebuilds only the route lists the
//!   mapping touches; untouched keys share their `Arc` with the old table.
//! - **Rejected reloads keep the old version**: a file that fails validation
//!   never reaches the table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::DocumentMapping;
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::event::ChangeEvent;
use crate::metrics;

/// `(source, group, database, table)`, case-normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub source: String,
    pub group: Option<String>,
    pub database: String,
    pub table: String,
}

impl RouteKey {
    pub fn new(source: &str, group: Option<&str>, database: &str, table: &str) -> Self {
        Self {
            source: source.to_string(),
            group: group.filter(|g| !g.is_empty()).map(str::to_string),
            database: database.to_ascii_lowercase(),
            table: table.to_ascii_lowercase(),
        }
    }

    pub fn for_event(event: &ChangeEvent) -> Self {
        Self::new(&event.source, event.group.as_deref(), &event.database, &event.table)
    }
}

type RouteList = Arc<[Arc<DocumentMapping>]>;

#[derive(Debug, Default)]
struct RouteTable {
    mappings: IndexMap<String, Arc<DocumentMapping>>,
    routes: HashMap<RouteKey, RouteList>,
}

impl RouteTable {
    fn keys_of(mapping: &DocumentMapping) -> Vec<RouteKey> {
        if mapping.sync_by_timestamp {
            return Vec::new();
        }
        mapping
            .watched_tables()
            .into_iter()
            .map(|(db, table)| RouteKey::new(&mapping.source, mapping.group.as_deref(), &db, &table))
            .collect()
    }

    /// New table with `name` replaced by `mapping` (or removed when `None`).
    fn with(&self, name: &str, mapping: Option<Arc<DocumentMapping>>) -> RouteTable {
        let mut touched: Vec<RouteKey> = Vec::new();
        if let Some(old) = self.mappings.get(name) {
            touched.extend(Self::keys_of(old));
        }
        if let Some(new) = &mapping {
            for key in Self::keys_of(new) {
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }
        }

        let mut mappings = self.mappings.clone();
        match &mapping {
            Some(m) => {
                mappings.insert(name.to_string(), Arc::clone(m));
            }
            None => {
                mappings.shift_remove(name);
            }
        }

        let mut routes = self.routes.clone();
        for key in touched {
            let list: Vec<Arc<DocumentMapping>> = mappings
                .values()
                .filter(|m| Self::keys_of(m).contains(&key))
                .cloned()
                .collect();
            if list.is_empty() {
                routes.remove(&key);
            } else {
                routes.insert(key, list.into());
            }
        }
        RouteTable { mappings, routes }
    }
}

/// What a directory load did.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, SyncError)>,
}

/// Active mappings and the event routing built from them.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    table: RwLock<Arc<RouteTable>>,
    /// Serializes writers; readers never take it.
    writer: Mutex<()>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<RouteTable> {
        Arc::clone(&self.table.read())
    }

    /// Add or replace a mapping by its configuration identity.
    pub fn insert(&self, mapping: DocumentMapping) -> Arc<DocumentMapping> {
        let _guard = self.writer.lock();
        let mapping = Arc::new(mapping);
        let name = mapping.name.clone();
        let next = self.snapshot().with(&name, Some(Arc::clone(&mapping)));
        let count = next.mappings.len();
        *self.table.write() = Arc::new(next);
        metrics::set_active_mappings(count);
        info!(mapping = %name, index = %mapping.index, "Mapping activated");
        mapping
    }

    pub fn remove(&self, name: &str) -> Option<Arc<DocumentMapping>> {
        let _guard = self.writer.lock();
        let current = self.snapshot();
        let old = current.mappings.get(name).cloned()?;
        let next = current.with(name, None);
        let count = next.mappings.len();
        *self.table.write() = Arc::new(next);
        metrics::set_active_mappings(count);
        info!(mapping = %name, "Mapping removed");
        Some(old)
    }

    /// Parse, validate and activate one mapping file.
    ///
    /// On failure the previously active version, if any, stays in place.
    pub fn apply_yaml(
        &self,
        name: &str,
        text: &str,
        config: &EngineConfig,
    ) -> Result<Arc<DocumentMapping>, SyncError> {
        match DocumentMapping::from_yaml(name, text, config) {
            Ok(mapping) => {
                metrics::record_mapping_reload("applied");
                Ok(self.insert(mapping))
            }
            Err(e) => {
                metrics::record_mapping_reload("rejected");
                error!(mapping = %name, error = %e, "Mapping rejected");
                Err(e)
            }
        }
    }

    /// Load every `*.yml` / `*.yaml` file in `dir`, keyed by file name.
    pub fn load_dir(&self, dir: &Path, config: &EngineConfig) -> Result<LoadReport, SyncError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SyncError::config(format!("{}: {e}", dir.display())))?;
        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"))
            })
            .collect();
        paths.sort();

        let mut report = LoadReport::default();
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let result = std::fs::read_to_string(&path)
                .map_err(|e| SyncError::config(format!("{}: {e}", path.display())))
                .and_then(|text| self.apply_yaml(&name, &text, config));
            match result {
                Ok(_) => report.loaded.push(name),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping mapping file");
                    report.failed.push((name, e));
                }
            }
        }
        Ok(report)
    }

    /// Mappings listening to `key`, as of now.
    pub fn route(&self, key: &RouteKey) -> Option<Arc<[Arc<DocumentMapping>]>> {
        self.snapshot().routes.get(key).cloned()
    }

    pub fn get(&self, name: &str) -> Option<Arc<DocumentMapping>> {
        self.snapshot().mappings.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().mappings.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::tests::config;

    fn yaml(index: &str, sql: &str, extra: &str) -> String {
        format!(
            "dataSourceKey: defaultDS\ndestination: example\nesMapping:\n  _index: {index}\n  _id: id\n  sql: \"{sql}\"\n{extra}"
        )
    }

    fn key(table: &str) -> RouteKey {
        RouteKey::new("example", None, "shop", table)
    }

    #[test]
    fn test_routes_every_table_of_the_view() {
        let registry = MappingRegistry::new();
        registry
            .apply_yaml(
                "orders.yml",
                &yaml("orders", "SELECT a.id, b.tag FROM orders a JOIN tags b ON a.tag_id = b.id", ""),
                &config(),
            )
            .unwrap();
        assert!(registry.route(&key("orders")).is_some());
        assert!(registry.route(&key("TAGS")).is_some());
        assert!(registry.route(&key("customers")).is_none());
        assert!(registry.route(&RouteKey::new("other", None, "shop", "orders")).is_none());
    }

    #[test]
    fn test_replace_moves_routes() {
        let registry = MappingRegistry::new();
        let cfg = config();
        registry
            .apply_yaml("m.yml", &yaml("orders", "SELECT a.id FROM orders a", ""), &cfg)
            .unwrap();
        let held = registry.route(&key("orders")).unwrap();
        registry
            .apply_yaml("m.yml", &yaml("orders", "SELECT a.id FROM invoices a", ""), &cfg)
            .unwrap();
        assert!(registry.route(&key("orders")).is_none());
        assert!(registry.route(&key("invoices")).is_some());
        assert_eq!(registry.len(), 1);
        // A snapshot taken before the swap still sees the old version.
        assert_eq!(held[0].graph.main_table().table, "orders");
    }

    #[test]
    fn test_rejected_reload_keeps_previous_version() {
        let registry = MappingRegistry::new();
        let cfg = config();
        registry
            .apply_yaml("m.yml", &yaml("orders", "SELECT a.id FROM orders a", ""), &cfg)
            .unwrap();
        assert!(registry
            .apply_yaml("m.yml", &yaml("orders", "SELECT FROM", ""), &cfg)
            .is_err());
        assert!(registry.route(&key("orders")).is_some());
    }

    #[test]
    fn test_two_mappings_share_a_key() {
        let registry = MappingRegistry::new();
        let cfg = config();
        registry
            .apply_yaml("a.yml", &yaml("a", "SELECT a.id FROM orders a", ""), &cfg)
            .unwrap();
        registry
            .apply_yaml("b.yml", &yaml("b", "SELECT o.id FROM orders o", ""), &cfg)
            .unwrap();
        assert_eq!(registry.route(&key("orders")).unwrap().len(), 2);
        registry.remove("a.yml").unwrap();
        assert_eq!(registry.route(&key("orders")).unwrap().len(), 1);
        assert!(registry.remove("a.yml").is_none());
    }

    #[test]
    fn test_time_based_mapping_not_routed() {
        let registry = MappingRegistry::new();
        registry
            .apply_yaml(
                "t.yml",
                &yaml("orders", "SELECT a.id FROM orders a", "  syncByTimestamp: true\n"),
                &config(),
            )
            .unwrap();
        assert!(registry.get("t.yml").is_some());
        assert!(registry.route(&key("orders")).is_none());
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.yml"),
            yaml("orders", "SELECT a.id FROM orders a", ""),
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "esMapping: 1").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = MappingRegistry::new();
        let report = registry.load_dir(dir.path(), &config()).unwrap();
        assert_eq!(report.loaded, vec!["good.yml".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(registry.names(), vec!["good.yml".to_string()]);
    }
}
