use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::operation::Operation;

/// Failure reported by a backend, pre-classified for the retry engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Connection-level or transient failure. Worth retrying elsewhere.
    #[error("recoverable: {0}")]
    Recoverable(String),
    /// The backend understood the request and refused it.
    #[error("non-recoverable: {0}")]
    NonRecoverable(String),
}

impl BackendError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

/// The execute contract shared by the primary path and replication.
///
/// `descriptor` is the endpoint's opaque connection string. Implementations
/// own their connection caching; [`Backend::evict`] is called when the
/// router excludes an endpoint.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(&self, descriptor: &str, op: &Operation) -> Result<Value, BackendError>;

    /// Run several operations as one ordered unit.
    /// Default implementation runs them sequentially and stops at the first error.
    async fn execute_batch(
        &self,
        descriptor: &str,
        ops: &[Operation],
        _transactional: bool,
    ) -> Result<Vec<Value>, BackendError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(self.execute(descriptor, op).await?);
        }
        Ok(results)
    }

    /// Drop any cached connection to `descriptor`.
    fn evict(&self, _descriptor: &str) {}
}
