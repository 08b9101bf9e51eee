// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational adapter for the execute contract.
//!
//! The operation name is the SQL text and its arguments are bind
//! parameters. Statements classified as reads return their rows as JSON
//! objects; anything else returns `{"rows_affected": n}`.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver decodes columns by runtime type, so each cell is tried as
//! integer, float, text and finally bytes. TEXT columns on MySQL may arrive
//! as bytes and are converted lossily.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row};
use tracing::{debug, info};

use super::traits::{Backend, BackendError};
use crate::operation::{Dialect, Operation};
use crate::replication::classify;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlBackend {
    pools: DashMap<String, AnyPool>,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl SqlBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool_settings(20, Duration::from_secs(10))
    }

    #[must_use]
    pub fn with_pool_settings(max_connections: u32, acquire_timeout: Duration) -> Self {
        install_drivers();
        Self {
            pools: DashMap::new(),
            max_connections,
            acquire_timeout,
        }
    }

    async fn pool(&self, descriptor: &str) -> Result<AnyPool, BackendError> {
        if let Some(pool) = self.pools.get(descriptor) {
            return Ok(pool.clone());
        }

        let pool = AnyPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(Duration::from_secs(300))
            .connect(descriptor)
            .await
            .map_err(classify_error)?;
        info!(endpoint = %redact(descriptor), "SQL pool connected");

        Ok(self.pools.entry(descriptor.to_string()).or_insert(pool).clone())
    }

    #[must_use]
    pub fn cached_pools(&self) -> usize {
        self.pools.len()
    }
}

impl Default for SqlBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort an sqlx error into the retry classes.
pub fn classify_error(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BackendError::Recoverable(err.to_string()),
        other => BackendError::NonRecoverable(other.to_string()),
    }
}

/// Strip credentials from a connection string for logging.
fn redact(descriptor: &str) -> String {
    match (descriptor.find("://"), descriptor.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &descriptor[..scheme], &descriptor[at..])
        }
        _ => descriptor.to_string(),
    }
}

fn bind_args<'q>(op: &'q Operation) -> Query<'q, Any, AnyArguments<'q>> {
    let mut query = sqlx::query(&op.name);
    for arg in &op.args {
        query = match arg {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn cell(row: &AnyRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map_or(Value::Null, |i| json!(i));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map_or(Value::Null, |f| json!(f));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map_or(Value::Null, |b| Value::String(String::from_utf8_lossy(&b).into_owned()));
    }
    Value::Null
}

fn row_to_json(row: &AnyRow) -> Value {
    let mut obj = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        obj.insert(column.name().to_string(), cell(row, idx));
    }
    Value::Object(obj)
}

async fn run_on<'e, E>(executor: E, op: &Operation) -> Result<Value, BackendError>
where
    E: sqlx::Executor<'e, Database = Any>,
{
    if classify::is_write(op, Dialect::Relational) {
        let done = bind_args(op).execute(executor).await.map_err(classify_error)?;
        Ok(json!({ "rows_affected": done.rows_affected() }))
    } else {
        let rows = bind_args(op).fetch_all(executor).await.map_err(classify_error)?;
        Ok(Value::Array(rows.iter().map(row_to_json).collect()))
    }
}

#[async_trait]
impl Backend for SqlBackend {
    async fn execute(&self, descriptor: &str, op: &Operation) -> Result<Value, BackendError> {
        let pool = self.pool(descriptor).await?;
        run_on(&pool, op).await
    }

    async fn execute_batch(
        &self,
        descriptor: &str,
        ops: &[Operation],
        transactional: bool,
    ) -> Result<Vec<Value>, BackendError> {
        let pool = self.pool(descriptor).await?;
        let mut results = Vec::with_capacity(ops.len());

        if transactional {
            let mut tx = pool.begin().await.map_err(classify_error)?;
            for op in ops {
                results.push(run_on(&mut *tx, op).await?);
            }
            tx.commit().await.map_err(classify_error)?;
        } else {
            for op in ops {
                results.push(run_on(&pool, op).await?);
            }
        }
        debug!(endpoint = %redact(descriptor), ops = ops.len(), transactional, "SQL batch applied");
        Ok(results)
    }

    fn evict(&self, descriptor: &str) {
        if let Some((_, pool)) = self.pools.remove(descriptor) {
            debug!(endpoint = %redact(descriptor), "Closing cached SQL pool");
            tokio::spawn(async move { pool.close().await });
        }
    }
}
