// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! sqlx-backed row source.
//!
//! One `AnyPool` per configured data source. Connections are acquired per
//! query and released when the query (or stream) completes.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver only knows a handful of value kinds (integers, floats,
//! bool, text, blob). Columns are decoded by trying those in turn; TEXT
//! columns that come back as BLOB are read as `Vec<u8>` and converted when
//! they hold UTF-8. Temporal and decimal columns should be cast to CHAR in
//! the mapping SQL when the server reports them in a form `Any` rejects.

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row as _};
use tracing::{debug, info};

use super::traits::{RowSource, SourceError};
use crate::config::EngineConfig;
use crate::event::Row;
use crate::resilience::retry::{retry_if, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlSource {
    pools: HashMap<String, AnyPool>,
}

impl SqlSource {
    /// Connect every configured data source with startup-mode retry.
    /// A malformed URL or rejected credentials fail on the first attempt.
    pub async fn connect(config: &EngineConfig) -> Result<Self, SourceError> {
        install_drivers();

        let mut pools = HashMap::new();
        for (key, ds) in &config.data_sources {
            let url = ds.url.as_str();
            let pool = retry_if(
                "sql_connect",
                &RetryConfig::startup(),
                || async {
                    AnyPoolOptions::new()
                        .max_connections(config.max_connections)
                        .acquire_timeout(Duration::from_secs(10))
                        .idle_timeout(Duration::from_secs(300))
                        .connect(url)
                        .await
                },
                is_transient,
            )
            .await
            .map_err(|e| SourceError::Backend(format!("{key}: {e}")))?;
            info!(data_source = %key, "Data source connected");
            pools.insert(key.clone(), pool);
        }
        Ok(Self { pools })
    }

    /// Wrap pools created elsewhere.
    pub fn from_pools(pools: HashMap<String, AnyPool>) -> Self {
        Self { pools }
    }

    fn pool(&self, key: &str) -> Result<&AnyPool, SourceError> {
        self.pools
            .get(key)
            .ok_or_else(|| SourceError::MissingDataSource(key.to_string()))
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_)
    )
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn decode_row(row: &AnyRow) -> Result<Row, SourceError> {
    let mut out = Row::new();
    for (idx, col) in row.columns().iter().enumerate() {
        out.insert(col.name().to_string(), decode_value(row, idx, col.name())?);
    }
    Ok(out)
}

fn decode_value(row: &AnyRow, idx: usize, name: &str) -> Result<Value, SourceError> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map(Value::from).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(v.map(Value::from).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return Ok(v.map(Value::Bool).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return Ok(v.map(Value::String).unwrap_or(Value::Null));
    }
    match row.try_get::<Option<Vec<u8>>, _>(idx) {
        Ok(Some(bytes)) => Ok(match String::from_utf8(bytes) {
            Ok(text) => Value::String(text),
            Err(e) => Value::Array(e.into_bytes().into_iter().map(Value::from).collect()),
        }),
        Ok(None) => Ok(Value::Null),
        Err(e) => Err(SourceError::Decode {
            column: name.to_string(),
            message: e.to_string(),
        }),
    }
}

#[async_trait]
impl RowSource for SqlSource {
    async fn query(&self, key: &str, sql: &str, params: &[Value]) -> Result<Vec<Row>, SourceError> {
        let pool = self.pool(key)?;
        debug!(data_source = %key, sql, params = params.len(), "Running query");
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(pool)
            .await
            .map_err(|e| SourceError::Backend(e.to_string()))?;
        rows.iter().map(decode_row).collect()
    }

    fn stream<'a>(
        &'a self,
        key: &'a str,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxStream<'a, Result<Row, SourceError>> {
        let pool = match self.pool(key) {
            Ok(pool) => pool,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        bind_all(sqlx::query(sql), params)
            .fetch(pool)
            .map(|row| {
                row.map_err(|e| SourceError::Backend(e.to_string()))
                    .and_then(|row| decode_row(&row))
            })
            .boxed()
    }
}
