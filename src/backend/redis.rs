// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis adapter for the execute contract.
//!
//! One [`ConnectionManager`] per endpoint descriptor, opened on first use and
//! cached. Connection-level failures (I/O, refused, dropped, timeout) are
//! recoverable; server replies such as `WRONGTYPE` are not.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::traits::{Backend, BackendError};
use crate::operation::{value_to_arg, Operation};

pub struct RedisBackend {
    connections: DashMap<String, ConnectionManager>,
}

impl RedisBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    async fn connection(&self, descriptor: &str) -> Result<ConnectionManager, BackendError> {
        if let Some(conn) = self.connections.get(descriptor) {
            return Ok(conn.clone());
        }

        let client = Client::open(descriptor).map_err(|e| BackendError::NonRecoverable(e.to_string()))?;
        let conn = ConnectionManager::new(client).await.map_err(classify)?;
        info!(endpoint = %descriptor, "Redis connection established");

        // A concurrent caller may have connected first; keep whichever landed.
        Ok(self
            .connections
            .entry(descriptor.to_string())
            .or_insert(conn)
            .clone())
    }

    #[must_use]
    pub fn cached_connections(&self) -> usize {
        self.connections.len()
    }
}

impl Default for RedisBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn build_cmd(op: &Operation) -> redis::Cmd {
    let mut cmd = redis::cmd(&op.name);
    for arg in &op.args {
        cmd.arg(value_to_arg(arg));
    }
    cmd
}

/// Sort a Redis error into the retry classes.
pub fn classify(err: RedisError) -> BackendError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        BackendError::Recoverable(err.to_string())
    } else {
        BackendError::NonRecoverable(err.to_string())
    }
}

/// Convert a reply into JSON.
pub fn to_json(value: redis::Value) -> Value {
    match value {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(i) => json!(i),
        redis::Value::BulkString(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Array(e.into_bytes().into_iter().map(|b| json!(b)).collect()),
        },
        redis::Value::Array(items) | redis::Value::Set(items) => {
            Value::Array(items.into_iter().map(to_json).collect())
        }
        redis::Value::SimpleString(s) => Value::String(s),
        redis::Value::Okay => json!("OK"),
        redis::Value::Double(d) => json!(d),
        redis::Value::Boolean(b) => json!(b),
        redis::Value::Map(pairs) => Value::Array(
            pairs
                .into_iter()
                .map(|(k, v)| Value::Array(vec![to_json(k), to_json(v)]))
                .collect(),
        ),
        other => Value::String(format!("{other:?}")),
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn execute(&self, descriptor: &str, op: &Operation) -> Result<Value, BackendError> {
        let mut conn = self.connection(descriptor).await?;
        let reply: redis::Value = build_cmd(op).query_async(&mut conn).await.map_err(classify)?;
        Ok(to_json(reply))
    }

    async fn execute_batch(
        &self,
        descriptor: &str,
        ops: &[Operation],
        transactional: bool,
    ) -> Result<Vec<Value>, BackendError> {
        let mut conn = self.connection(descriptor).await?;
        let mut pipeline = redis::pipe();
        if transactional {
            pipeline.atomic();
        }
        for op in ops {
            pipeline.add_command(build_cmd(op));
        }
        let replies: Vec<redis::Value> = pipeline.query_async(&mut conn).await.map_err(classify)?;
        debug!(endpoint = %descriptor, ops = ops.len(), transactional, "Redis batch applied");
        Ok(replies.into_iter().map(to_json).collect())
    }

    fn evict(&self, descriptor: &str) {
        if self.connections.remove(descriptor).is_some() {
            debug!(endpoint = %descriptor, "Dropped cached Redis connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_conversion() {
        assert_eq!(to_json(redis::Value::Nil), Value::Null);
        assert_eq!(to_json(redis::Value::Okay), json!("OK"));
        assert_eq!(to_json(redis::Value::Int(7)), json!(7));
        assert_eq!(to_json(redis::Value::BulkString(b"hi".to_vec())), json!("hi"));
        assert_eq!(
            to_json(redis::Value::Array(vec![
                redis::Value::Int(1),
                redis::Value::SimpleString("x".into())
            ])),
            json!([1, "x"])
        );
    }

    #[test]
    fn test_error_classification() {
        let io: RedisError = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(classify(io).is_recoverable());

        let typed: RedisError = (redis::ErrorKind::TypeError, "WRONGTYPE").into();
        assert!(!classify(typed).is_recoverable());
    }

    #[test]
    fn test_build_cmd_renders_args() {
        let op = Operation::new("SET", vec![json!("k"), json!(5)]);
        let packed = build_cmd(&op).get_packed_command();
        let text = String::from_utf8(packed).unwrap();
        assert!(text.contains("SET"));
        assert!(text.contains("\r\nk\r\n"));
        assert!(text.contains("\r\n5\r\n"));
    }

    #[tokio::test]
    async fn test_bad_descriptor_is_not_recoverable() {
        let backend = RedisBackend::new();
        let err = backend
            .execute("not a url", &Operation::bare("PING"))
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(backend.cached_connections(), 0);
    }
}
