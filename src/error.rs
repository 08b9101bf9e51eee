// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the router.
//!
//! Only [`RouterError::NoBackendAvailable`], [`RouterError::NonRecoverable`],
//! [`RouterError::Recoverable`] (when exhausted) and [`RouterError::Cancelled`]
//! ever reach a primary-path caller. The replication and durability variants are
//! produced and logged inside the pipeline.

use thiserror::Error;

use crate::backend::BackendError;

pub type Result<T, E = RouterError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum RouterError {
    /// Routing found no eligible endpoint.
    #[error("no backend available{}", last_error.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    NoBackendAvailable { last_error: Option<String> },

    #[error("recoverable backend error: {0}")]
    Recoverable(String),

    #[error("backend rejected operation: {0}")]
    NonRecoverable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("replication apply failed for '{target}': {reason}")]
    ReplicationApply { target: String, reason: String },

    #[error("log segment I/O error: {0}")]
    DurabilityIo(#[from] std::io::Error),

    #[error("log record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RouterError {
    /// Error surfaced when routing runs dry, keeping the last transient failure for diagnostics.
    pub fn no_backend(last_error: Option<&BackendError>) -> Self {
        Self::NoBackendAvailable {
            last_error: last_error.map(|e| e.to_string()),
        }
    }
}

impl From<BackendError> for RouterError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Recoverable(msg) => Self::Recoverable(msg),
            BackendError::NonRecoverable(msg) => Self::NonRecoverable(msg),
        }
    }
}
