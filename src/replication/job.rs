// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Units of replication work.
//!
//! Record format (one per log line):
//! ```text
//! {"Args":["SET","k","v"]}                                   single op
//! {"Ops":[{"Args":["INCR","a"]},{"Args":["INCR","b"]}],"Transactional":true}   batch
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Backend, BackendError};
use crate::operation::Operation;
use crate::resilience::retry::{retry, RetryConfig};

/// A write to mirror onto the secondary target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplicationJob {
    Batch {
        #[serde(rename = "Ops")]
        ops: Vec<Operation>,
        #[serde(rename = "Transactional", default)]
        transactional: bool,
    },
    SingleOp(Operation),
}

impl ReplicationJob {
    pub fn single(op: Operation) -> Self {
        Self::SingleOp(op)
    }

    pub fn batch(ops: Vec<Operation>, transactional: bool) -> Self {
        Self::Batch { ops, transactional }
    }

    /// Number of operations carried.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::SingleOp(_) => 1,
            Self::Batch { ops, .. } => ops.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SingleOp(_) => "single",
            Self::Batch { .. } => "batch",
        }
    }

    /// Encode as one log line, without terminator.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end_matches(['\r', '\n']))
    }

    /// Apply to a target. A batch is sent as one ordered unit.
    pub async fn apply(&self, backend: &dyn Backend, descriptor: &str) -> Result<Value, BackendError> {
        match self {
            Self::SingleOp(op) => backend.execute(descriptor, op).await,
            Self::Batch { ops, transactional } => backend
                .execute_batch(descriptor, ops, *transactional)
                .await
                .map(Value::Array),
        }
    }

    /// Apply with bounded retries, each attempt capped at `attempt_timeout`.
    pub async fn apply_with_retry(
        &self,
        backend: &dyn Backend,
        descriptor: &str,
        policy: &RetryConfig,
        attempt_timeout: Duration,
    ) -> Result<Value, BackendError> {
        retry("replication_apply", policy, || async move {
            match tokio::time::timeout(attempt_timeout, self.apply(backend, descriptor)).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Recoverable(format!(
                    "timed out after {}ms",
                    attempt_timeout.as_millis()
                ))),
            }
        })
        .await
    }
}

impl From<Operation> for ReplicationJob {
    fn from(op: Operation) -> Self {
        Self::SingleOp(op)
    }
}
