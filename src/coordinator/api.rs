// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing API: execution and topology control.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ReplicaRouter;
use crate::error::Result;
use crate::operation::{Classification, Dialect, Operation};

impl ReplicaRouter {
    /// Execute one operation with the caller's classification.
    ///
    /// Cancelled when the router shuts down.
    pub async fn execute(&self, op: &Operation, class: &Classification) -> Result<Value> {
        self.engine.execute(op, class, &self.cancel).await
    }

    /// Execute one operation, cancellable by the caller as well as by shutdown.
    pub async fn execute_with_cancel(
        &self,
        op: &Operation,
        class: &Classification,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let token = self.cancel.child_token();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                token.cancel();
                Err(crate::error::RouterError::Cancelled)
            }
            result = self.engine.execute(op, class, &token) => result,
        }
    }

    /// Classify `op` by its command name and execute it under a fresh correlation id.
    pub async fn execute_inferred(&self, op: &Operation, dialect: Dialect) -> Result<Value> {
        let class = Classification::infer(op, dialect).with_correlation(self.engine.next_correlation_id());
        self.execute(op, &class).await
    }

    /// Execute several operations as one ordered unit on one endpoint.
    pub async fn execute_batch(
        &self,
        ops: &[Operation],
        transactional: bool,
        class: &Classification,
    ) -> Result<Vec<Value>> {
        self.engine.execute_batch(ops, transactional, class, &self.cancel).await
    }

    /// Switch the active group. Returns true when the active group changed.
    ///
    /// An unknown name is logged and ignored.
    pub fn set_active(&self, group_name: &str) -> bool {
        self.topology().on_active_changed(group_name)
    }

    pub fn set_region(&self, region: impl Into<String>) {
        self.topology().set_region(region);
    }

    /// Fresh correlation id for callers without one of their own.
    pub fn next_correlation_id(&self) -> i64 {
        self.engine.next_correlation_id()
    }

    /// Release endpoints whose cooldown has elapsed without waiting for the next call.
    pub fn release_expired(&self) {
        let before = self.exclusions().len();
        self.engine.release_expired();
        let released = before.saturating_sub(self.exclusions().len());
        if released > 0 {
            info!(released, "Released expired exclusions");
        }
    }
}
