// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary-path execution with retry, exclusion and re-routing.
//!
//! # Algorithm
//!
//! ```text
//! loop:
//!   prune expired exclusions (endpoints become available again)
//!   route ── none ──────────────────────────────► NoBackendAvailable
//!   replica excluded since it was picked ───────► route again
//!   primary excluded or already exhausted ──────► NoBackendAvailable(last error)
//!   attempt up to retry_times against it:
//!     ok             ─► clear failures, mirror writes, return
//!     non-recoverable ─► return immediately, nothing excluded
//!     recoverable    ─► count failure, sleep retry_delay, try again
//!   exhausted: exclude for cooldown, evict cached connection, loop
//! ```
//!
//! Cancellation is observed before every attempt, during the backend call and
//! during retry delays. A cancelled call never excludes anything.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError};
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::metrics::{self, LatencyTimer};
use crate::operation::{Classification, Operation};
use crate::replication::{ReplicationJob, ReplicationPipeline};
use crate::routing::{self, ExclusionKey, ExclusionSet, GroupStrategy, Route};
use crate::topology::{Endpoint, Topology};

/// Primary-path retry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Attempts against one endpoint before it is excluded (minimum 1)
    pub retry_times: u32,
    pub retry_delay: Duration,
    pub cooldown: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            retry_times: config.retry_times,
            retry_delay: config.retry_delay(),
            cooldown: config.cooldown(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

/// What one call sends to the backend.
#[derive(Debug, Clone, Copy)]
enum Request<'a> {
    Single(&'a Operation),
    Batch { ops: &'a [Operation], transactional: bool },
}

impl Request<'_> {
    fn to_job(self) -> ReplicationJob {
        match self {
            Self::Single(op) => ReplicationJob::single(op.clone()),
            Self::Batch { ops, transactional } => ReplicationJob::batch(ops.to_vec(), transactional),
        }
    }
}

/// Why the attempts against one endpoint stopped.
enum AttemptError {
    /// Surface to the caller as-is.
    Fatal(RouterError),
    /// Every attempt failed recoverably; exclude and re-route.
    Exhausted(BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Call,
    Reroute,
    Refuse,
}

pub struct ExecutionEngine {
    topology: Arc<Topology>,
    strategy: GroupStrategy,
    exclusions: Arc<ExclusionSet>,
    backend: Arc<dyn Backend>,
    replication: Option<Arc<ReplicationPipeline>>,
    settings: EngineSettings,
    next_correlation: AtomicI64,
}

impl ExecutionEngine {
    pub fn new(
        topology: Arc<Topology>,
        strategy: GroupStrategy,
        backend: Arc<dyn Backend>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            topology,
            strategy,
            exclusions: Arc::new(ExclusionSet::new()),
            backend,
            replication: None,
            settings,
            next_correlation: AtomicI64::new(1),
        }
    }

    /// Mirror successful writes through `pipeline`.
    #[must_use]
    pub fn with_replication(mut self, pipeline: Arc<ReplicationPipeline>) -> Self {
        self.replication = Some(pipeline);
        self
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn exclusions(&self) -> &ExclusionSet {
        &self.exclusions
    }

    pub fn strategy(&self) -> GroupStrategy {
        self.strategy
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Fresh correlation id for callers without one of their own.
    pub fn next_correlation_id(&self) -> i64 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Execute one operation.
    pub async fn execute(&self, op: &Operation, class: &Classification, cancel: &CancellationToken) -> Result<Value> {
        self.run(Request::Single(op), class, cancel).await
    }

    /// Execute several operations as one ordered unit on one endpoint.
    ///
    /// A successful write batch is mirrored as a single batch job.
    pub async fn execute_batch(
        &self,
        ops: &[Operation],
        transactional: bool,
        class: &Classification,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        match self.run(Request::Batch { ops, transactional }, class, cancel).await? {
            Value::Array(values) => Ok(values),
            other => Ok(vec![other]),
        }
    }

    async fn run(&self, request: Request<'_>, class: &Classification, cancel: &CancellationToken) -> Result<Value> {
        let _timer = LatencyTimer::new(if class.is_write() { "write" } else { "read" });
        let mut exhausted: HashSet<String> = HashSet::new();
        let mut last_error: Option<BackendError> = None;
        let mut stale_picks = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(RouterError::Cancelled);
            }
            self.release_expired();

            let Some(route) = routing::route(self.strategy, &self.topology, class, &self.exclusions) else {
                debug!(correlation_id = class.correlation_id, "No route available");
                return Err(RouterError::no_backend(last_error.as_ref()));
            };

            match self.admit(&route, &exhausted) {
                Admission::Call => {}
                Admission::Reroute if stale_picks < route.group.replicas().len() => {
                    stale_picks += 1;
                    debug!(endpoint = %route.endpoint, "Replica excluded after selection, routing again");
                    continue;
                }
                Admission::Reroute | Admission::Refuse => {
                    debug!(
                        endpoint = %route.endpoint,
                        group = %route.group.name(),
                        "Only candidate is excluded"
                    );
                    return Err(RouterError::no_backend(last_error.as_ref()));
                }
            }
            let endpoint = route.endpoint;

            match self.attempt(&endpoint, request, class, cancel).await {
                Ok(value) => {
                    self.on_success(&endpoint, request, class);
                    return Ok(value);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Exhausted(e)) => {
                    self.exclude(&endpoint, &e);
                    exhausted.insert(endpoint.name().to_string());
                    last_error = Some(e);
                }
            }
        }
    }

    /// Decide whether a routed endpoint may be called.
    ///
    /// Another caller can exclude a replica between selection and this check;
    /// that pick is stale and routing again skips it. An excluded primary has
    /// no fallback.
    fn admit(&self, route: &Route, exhausted: &HashSet<String>) -> Admission {
        let name = route.endpoint.name();
        if exhausted.contains(name) {
            return Admission::Refuse;
        }
        if !self.exclusions.is_endpoint_excluded(name) {
            return Admission::Call;
        }
        if Arc::ptr_eq(&route.endpoint, route.group.primary()) {
            Admission::Refuse
        } else {
            Admission::Reroute
        }
    }

    /// Up to `retry_times` attempts against one endpoint.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        request: Request<'_>,
        class: &Classification,
        cancel: &CancellationToken,
    ) -> std::result::Result<Value, AttemptError> {
        let access = class.access.to_string();
        let max = self.settings.retry_times.max(1);
        let mut last: Option<BackendError> = None;

        for attempt in 1..=max {
            if attempt > 1 {
                metrics::record_retry(endpoint.name());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AttemptError::Fatal(RouterError::Cancelled)),
                    _ = tokio::time::sleep(self.settings.retry_delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    metrics::record_operation(endpoint.name(), &access, "cancelled");
                    return Err(AttemptError::Fatal(RouterError::Cancelled));
                }
                result = self.call(endpoint, request) => result,
            };

            match result {
                Ok(value) => {
                    metrics::record_operation(endpoint.name(), &access, "success");
                    return Ok(value);
                }
                Err(e) if !e.is_recoverable() => {
                    metrics::record_operation(endpoint.name(), &access, "rejected");
                    debug!(endpoint = %endpoint, error = %e, "Backend rejected operation");
                    return Err(AttemptError::Fatal(e.into()));
                }
                Err(e) => {
                    metrics::record_operation(endpoint.name(), &access, "error");
                    let failures = endpoint.record_failure();
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        max_attempts = max,
                        failures,
                        error = %e,
                        "Recoverable backend error"
                    );
                    last = Some(e);
                }
            }
        }

        Err(AttemptError::Exhausted(
            last.unwrap_or_else(|| BackendError::Recoverable("no attempt made".into())),
        ))
    }

    async fn call(&self, endpoint: &Endpoint, request: Request<'_>) -> std::result::Result<Value, BackendError> {
        match request {
            Request::Single(op) => self.backend.execute(endpoint.descriptor(), op).await,
            Request::Batch { ops, transactional } => self
                .backend
                .execute_batch(endpoint.descriptor(), ops, transactional)
                .await
                .map(Value::Array),
        }
    }

    fn on_success(&self, endpoint: &Endpoint, request: Request<'_>, class: &Classification) {
        let cleared = endpoint.record_success();
        let was_excluded = self.exclusions.remove(&ExclusionKey::endpoint(endpoint.name()));
        if cleared > 0 || was_excluded {
            info!(endpoint = %endpoint, cleared_failures = cleared, "Endpoint recovered");
            metrics::set_endpoint_available(endpoint.name(), true);
        }

        if class.is_write() {
            if let Some(pipeline) = &self.replication {
                // Fire and forget: the caller's result does not depend on it
                pipeline.submit(request.to_job());
            }
        }
    }

    fn exclude(&self, endpoint: &Endpoint, error: &BackendError) {
        let exclusion = self
            .exclusions
            .exclude(ExclusionKey::endpoint(endpoint.name()), self.settings.cooldown);
        endpoint.mark_unavailable();
        self.backend.evict(endpoint.descriptor());

        metrics::record_exclusion(endpoint.name());
        metrics::set_endpoint_available(endpoint.name(), false);
        metrics::set_excluded_count(self.exclusions.len());
        warn!(
            endpoint = %endpoint,
            cooldown_ms = self.settings.cooldown.as_millis() as u64,
            retry_after = ?exclusion.retry_after,
            error = %error,
            "Endpoint excluded"
        );
    }

    /// Drop expired exclusions and mark their endpoints available again.
    pub(crate) fn release_expired(&self) {
        let expired = self.exclusions.prune();
        if expired.is_empty() {
            return;
        }
        for key in &expired {
            if let ExclusionKey::Endpoint(name) = key {
                if let Some(endpoint) = self.topology.endpoint(name) {
                    endpoint.mark_available();
                    metrics::set_endpoint_available(name, true);
                }
            }
            debug!(key = %key, "Exclusion cooldown elapsed");
        }
        metrics::set_excluded_count(self.exclusions.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::balance::LoadBalancePolicy;
    use crate::topology::ReplicaGroup;
    use serde_json::json;

    fn settings(retry_times: u32) -> EngineSettings {
        EngineSettings {
            retry_times,
            retry_delay: Duration::from_millis(100),
            cooldown: Duration::from_secs(60),
        }
    }

    fn topology(replicas: usize) -> Arc<Topology> {
        let groups = ["g0", "g1"]
            .iter()
            .map(|name| {
                ReplicaGroup::new(
                    *name,
                    "az0",
                    Endpoint::new(format!("{name}-p"), format!("mem://{name}-p")),
                    (1..=replicas)
                        .map(|i| Endpoint::new(format!("{name}-r{i}"), format!("mem://{name}-r{i}")))
                        .collect(),
                    LoadBalancePolicy::default(),
                )
            })
            .collect();
        Arc::new(Topology::new(groups, "g0", "az0").unwrap())
    }

    fn engine(backend: Arc<InMemoryBackend>, replicas: usize, retry_times: u32) -> ExecutionEngine {
        ExecutionEngine::new(topology(replicas), GroupStrategy::Pinned, backend, settings(retry_times))
    }

    fn set(k: &str) -> Operation {
        Operation::new("SET", vec![json!(k), json!("v")])
    }

    fn get(k: &str) -> Operation {
        Operation::new("GET", vec![json!(k)])
    }

    #[tokio::test]
    async fn test_write_goes_to_active_primary() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine(backend.clone(), 2, 1);

        let out = engine
            .execute(&set("k"), &Classification::write(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!("OK"));
        assert_eq!(backend.value("mem://g0-p", "k"), Some(json!("v")));
    }

    #[tokio::test]
    async fn test_reads_spread_over_replicas() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine(backend.clone(), 2, 1);
        let cancel = CancellationToken::new();

        for id in 1..=4 {
            engine.execute(&get("k"), &Classification::read(id), &cancel).await.unwrap();
        }
        assert_eq!(backend.calls("mem://g0-r1"), 2);
        assert_eq!(backend.calls("mem://g0-r2"), 2);
        assert_eq!(backend.calls("mem://g0-p"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_replica_is_excluded_and_read_rerouted() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail("mem://g0-r1", BackendError::Recoverable("connection refused".into()));
        let engine = engine(backend.clone(), 2, 2);

        // correlation 1 starts on r1 (cursor 0)
        let out = engine
            .execute(&get("k"), &Classification::read(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, Value::Null);

        assert_eq!(backend.calls("mem://g0-r1"), 2);
        assert_eq!(backend.calls("mem://g0-r2"), 1);
        assert_eq!(backend.evictions("mem://g0-r1"), 1);
        assert!(engine.exclusions().is_endpoint_excluded("g0-r1"));

        let r1 = engine.topology().endpoint("g0-r1").unwrap();
        assert!(!r1.is_available());
        assert_eq!(r1.failure_count(), 2);
    }

    #[test]
    fn test_replica_excluded_after_selection_is_rerouted() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine(backend, 2, 1);
        let group = engine.topology().resolve_group("g0").unwrap();
        let pick = |name: &str| Route {
            group: Arc::clone(&group),
            endpoint: engine.topology().endpoint(name).unwrap(),
        };

        // excluded by another caller between routing and the call
        engine
            .exclusions()
            .exclude(ExclusionKey::endpoint("g0-r1"), Duration::from_secs(60));
        assert_eq!(engine.admit(&pick("g0-r1"), &HashSet::new()), Admission::Reroute);
        assert_eq!(engine.admit(&pick("g0-r2"), &HashSet::new()), Admission::Call);

        let exhausted = HashSet::from(["g0-r2".to_string()]);
        assert_eq!(engine.admit(&pick("g0-r2"), &exhausted), Admission::Refuse);

        engine
            .exclusions()
            .exclude(ExclusionKey::endpoint("g0-p"), Duration::from_secs(60));
        assert_eq!(engine.admit(&pick("g0-p"), &HashSet::new()), Admission::Refuse);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_exhaustion_reports_last_error() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail("mem://g0-p", BackendError::Recoverable("connection refused".into()));
        let engine = engine(backend.clone(), 0, 2);
        let cancel = CancellationToken::new();

        let err = engine.execute(&set("k"), &Classification::write(1), &cancel).await.unwrap_err();
        match err {
            RouterError::NoBackendAvailable { last_error } => {
                assert!(last_error.unwrap().contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.calls("mem://g0-p"), 2);

        // Still excluded: fails without touching the backend
        let err = engine.execute(&set("k"), &Classification::write(2), &cancel).await.unwrap_err();
        assert!(matches!(err, RouterError::NoBackendAvailable { last_error: None }));
        assert_eq!(backend.calls("mem://g0-p"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expiry_restores_endpoint() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail("mem://g0-p", BackendError::Recoverable("connection refused".into()));
        let engine = engine(backend.clone(), 0, 1);
        let cancel = CancellationToken::new();

        assert!(engine.execute(&set("k"), &Classification::write(1), &cancel).await.is_err());
        backend.heal("mem://g0-p");

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(engine.execute(&set("k"), &Classification::write(1), &cancel).await.is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        engine.execute(&set("k"), &Classification::write(1), &cancel).await.unwrap();

        let primary = engine.topology().endpoint("g0-p").unwrap();
        assert!(primary.is_available());
        assert_eq!(primary.failure_count(), 0);
        assert!(engine.exclusions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_recoverable_short_circuits() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail("mem://g0-p", BackendError::NonRecoverable("WRONGTYPE".into()));
        let engine = engine(backend.clone(), 0, 3);

        let started = tokio::time::Instant::now();
        let err = engine
            .execute(&set("k"), &Classification::write(1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RouterError::NonRecoverable(ref m) if m.contains("WRONGTYPE")));
        assert_eq!(backend.calls("mem://g0-p"), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(engine.exclusions().is_empty());
        assert_eq!(engine.topology().endpoint("g0-p").unwrap().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_delay_does_not_exclude() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail("mem://g0-p", BackendError::Recoverable("timeout".into()));
        let engine = Arc::new(engine(backend.clone(), 0, 5));
        let cancel = CancellationToken::new();

        let task = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.execute(&set("k"), &Classification::write(1), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, RouterError::Cancelled));
        assert_eq!(backend.calls("mem://g0-p"), 2);
        assert!(engine.exclusions().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine(backend.clone(), 0, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine.execute(&set("k"), &Classification::write(1), &cancel).await.unwrap_err();
        assert!(matches!(err, RouterError::Cancelled));
        assert_eq!(backend.calls("mem://g0-p"), 0);
    }

    #[tokio::test]
    async fn test_writes_are_mirrored_reads_are_not() {
        let backend = Arc::new(InMemoryBackend::new());
        let secondary = Arc::new(InMemoryBackend::new());
        let pipeline = Arc::new(ReplicationPipeline::new(
            "dr",
            "mem://dr",
            secondary.clone(),
            crate::config::ReplicationConfig::default(),
            None,
        ));
        let engine = engine(backend, 1, 1).with_replication(Arc::clone(&pipeline));
        let cancel = CancellationToken::new();

        engine.execute(&set("k"), &Classification::write(1), &cancel).await.unwrap();
        engine.execute(&get("k"), &Classification::read(2), &cancel).await.unwrap();
        engine
            .execute_batch(&[set("a"), set("b")], true, &Classification::write(3), &cancel)
            .await
            .unwrap();

        assert_eq!(pipeline.stats().submitted, 2);
        pipeline.start();
        pipeline.shutdown().await;
        assert_eq!(secondary.applied_on("mem://dr"), vec![set("k"), set("a"), set("b")]);
    }

    #[tokio::test]
    async fn test_batch_returns_per_op_results() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine(backend, 0, 1);
        let out = engine
            .execute_batch(
                &[set("n"), Operation::new("GET", vec![json!("n")])],
                false,
                &Classification::write(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, vec![json!("OK"), json!("v")]);
    }

    #[test]
    fn test_correlation_ids_increase() {
        let engine = engine(Arc::new(InMemoryBackend::new()), 0, 1);
        let a = engine.next_correlation_id();
        assert!(engine.next_correlation_id() > a);
    }
}
