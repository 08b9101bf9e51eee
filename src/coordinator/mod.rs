// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica router coordinator.
//!
//! The [`ReplicaRouter`] ties together:
//! - the [`Topology`] and its active-switch signal
//! - the [`ExecutionEngine`] (routing, retry, exclusion)
//! - the [`ReplicationPipeline`] mirroring writes to a secondary target
//! - the [`LogSegmentStore`] and startup replay when durability is on
//!
//! # Lifecycle
//!
//! ```text
//! Created → Replaying → Ready → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica_router::{ReplicaRouter, RouterConfig, RouterState, InMemoryBackend};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = RouterConfig::default();
//! let router = Arc::new(ReplicaRouter::new(config, Arc::new(InMemoryBackend::new()), None).unwrap());
//! assert_eq!(router.state(), RouterState::Created);
//!
//! router.start().await;
//! let (_active_tx, active_rx) = watch::channel(String::new());
//! tokio::spawn({
//!     let router = Arc::clone(&router);
//!     async move { router.run(active_rx).await }
//! });
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{HealthCheck, RouterState};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::executor::{EngineSettings, ExecutionEngine};
use crate::replication::wal::{LogSegmentStore, SegmentStatsSnapshot};
use crate::replication::{PipelineStatsSnapshot, ReplicationPipeline};
use crate::routing::{ExclusionSet, GroupStrategy};
use crate::topology::Topology;

/// Main replica router.
///
/// `Send + Sync`; share it behind an `Arc`. All methods take `&self`.
pub struct ReplicaRouter {
    pub(super) config: RouterConfig,

    /// Router state (broadcast to watchers)
    pub(super) state: watch::Sender<RouterState>,
    pub(super) state_rx: watch::Receiver<RouterState>,

    pub(super) engine: ExecutionEngine,

    /// Present only when a secondary target is configured
    pub(super) pipeline: Option<Arc<ReplicationPipeline>>,

    /// Present only when durability is enabled and replication is on
    pub(super) wal: Option<Arc<LogSegmentStore>>,

    /// Stops the run loop and the segment sweeper
    pub(super) cancel: CancellationToken,
    pub(super) sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaRouter {
    /// Create a router.
    ///
    /// `backend` serves the primary path. `secondary` applies replication;
    /// when `None`, the primary backend is reused for the secondary target.
    /// The router starts in `Created` state; call [`start()`](Self::start).
    pub fn new(
        config: RouterConfig,
        backend: Arc<dyn Backend>,
        secondary: Option<Arc<dyn Backend>>,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(RouterState::Created);
        let topology = Arc::new(Topology::from_config(&config)?);
        let strategy = GroupStrategy::from_name(&config.group_strategy);

        let (pipeline, wal) = match &config.replication.secondary {
            Some(target) => {
                let wal = config
                    .durability
                    .enabled
                    .then(|| Arc::new(LogSegmentStore::new(config.durability.clone())));
                let pipeline = Arc::new(ReplicationPipeline::new(
                    target.name.clone(),
                    target.descriptor.clone(),
                    secondary.unwrap_or_else(|| Arc::clone(&backend)),
                    config.replication.clone(),
                    wal.clone(),
                ));
                info!(
                    target_name = %target.name,
                    durable = wal.is_some(),
                    queue_capacity = config.replication.queue_capacity,
                    "Replication enabled"
                );
                (Some(pipeline), wal)
            }
            None => {
                let err = RouterError::Configuration("no secondary target configured".into());
                if config.durability.enabled {
                    warn!(error = %err, "Durability requested but replication is disabled");
                } else {
                    warn!(error = %err, "Replication disabled");
                }
                crate::metrics::record_error("replication", "configure", "missing_secondary");
                (None, None)
            }
        };

        let mut engine = ExecutionEngine::new(topology, strategy, backend, EngineSettings::from_config(&config));
        if let Some(pipeline) = &pipeline {
            engine = engine.with_replication(Arc::clone(pipeline));
        }

        Ok(Self {
            config,
            state: state_tx,
            state_rx,
            engine,
            pipeline,
            wal,
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Get current router state.
    #[must_use]
    pub fn state(&self) -> RouterState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<RouterState> {
        self.state_rx.clone()
    }

    /// Check if the router is ready to route.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), RouterState::Ready | RouterState::Running)
    }

    pub(super) fn set_state(&self, state: RouterState) {
        let _ = self.state.send(state);
        crate::metrics::set_router_state(&state.to_string());
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<Topology> {
        self.engine.topology()
    }

    pub fn exclusions(&self) -> &ExclusionSet {
        self.engine.exclusions()
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    #[must_use]
    pub fn replication_stats(&self) -> Option<PipelineStatsSnapshot> {
        self.pipeline.as_ref().map(|p| p.stats())
    }

    #[must_use]
    pub fn segment_stats(&self) -> Option<SegmentStatsSnapshot> {
        self.wal.as_ref().map(|w| w.stats())
    }

    /// Collect internal state into a [`HealthCheck`].
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = matches!(state, RouterState::Ready | RouterState::Running);
        let topology = self.topology();
        let active = topology.active_group();

        let mut excluded_endpoints: Vec<String> = topology
            .groups()
            .iter()
            .flat_map(|g| g.endpoints())
            .filter(|ep| self.exclusions().is_endpoint_excluded(ep.name()))
            .map(|ep| ep.name().to_string())
            .collect();
        excluded_endpoints.sort();

        let primary_ok = active
            .as_ref()
            .is_some_and(|g| !self.exclusions().is_endpoint_excluded(g.primary().name()));

        HealthCheck {
            state,
            ready,
            active_group: topology.active_name(),
            active_group_known: active.is_some(),
            region: topology.region(),
            switch_count: topology.switch_count(),
            excluded_endpoints,
            replication_enabled: self.pipeline.is_some(),
            replication_pending: self.pipeline.as_ref().map_or(0, |p| p.pending()),
            durable: self.wal.is_some(),
            open_segments: self.wal.as_ref().map_or(0, |w| w.open_count()),
            healthy: ready && primary_ok,
        }
    }
}
