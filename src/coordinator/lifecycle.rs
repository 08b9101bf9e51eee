//! Router lifecycle management: start, run loop, shutdown.
//!
//! This module contains the startup sequence, main run loop, and shutdown logic.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::replication::wal::{ReplayReport, ReplayTarget, SegmentReplayer};
use crate::resilience::retry::RetryConfig;

use super::{ReplicaRouter, RouterState};

/// How often the run loop releases expired exclusions and refreshes gauges.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

impl ReplicaRouter {
    /// Start the router.
    ///
    /// Startup flow:
    /// 1. Replay log segments left over from a previous process (durable mode only)
    /// 2. Start the replication worker
    /// 3. Start the segment sweeper
    /// 4. Ready!
    ///
    /// Replay failures are logged and never block startup. Calling `start`
    /// twice is harmless.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) {
        if self.state() != RouterState::Created {
            debug!(state = %self.state(), "Router already started");
            return;
        }
        let startup_start = Instant::now();
        info!(
            active_group = %self.topology().active_name(),
            region = %self.topology().region(),
            groups = self.topology().groups().len(),
            "Starting replica router"
        );

        // ========== PHASE 1: Replay leftover segments ==========
        if self.wal.is_some() {
            let phase_start = Instant::now();
            self.set_state(RouterState::Replaying);
            match self.replay_now().await {
                Ok(report) => info!(
                    segments = report.segments,
                    applied = report.applied,
                    interruptions = report.interruptions,
                    salvaged = report.salvaged,
                    skipped = report.skipped,
                    "Log segment replay complete"
                ),
                Err(e) => {
                    warn!(error = %e, "Log segment replay failed, continuing startup");
                    crate::metrics::record_error("replay", "startup", "io");
                }
            }
            crate::metrics::record_startup_phase("replay", phase_start.elapsed());
        }

        // ========== PHASE 2: Replication worker ==========
        if let Some(pipeline) = &self.pipeline {
            let phase_start = Instant::now();
            pipeline.start();
            crate::metrics::record_startup_phase("replication_start", phase_start.elapsed());
        }

        // ========== PHASE 3: Segment sweeper ==========
        if let Some(wal) = &self.wal {
            let handle = wal.spawn_sweeper(self.cancel.child_token());
            *self.sweeper.lock() = Some(handle);
        }

        self.set_state(RouterState::Ready);
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        info!(
            elapsed_ms = startup_start.elapsed().as_millis() as u64,
            replication = self.pipeline.is_some(),
            durable = self.wal.is_some(),
            "Replica router ready"
        );
    }

    /// Replay every inactive log segment to the secondary target.
    ///
    /// Segments still being written by this process are skipped. A router
    /// without durability returns an empty report.
    pub async fn replay_now(&self) -> Result<ReplayReport> {
        let (Some(wal), Some(pipeline)) = (&self.wal, &self.pipeline) else {
            return Ok(ReplayReport::default());
        };

        let replication = &self.config.replication;
        let replayer = SegmentReplayer::new(
            wal.dir(),
            RetryConfig::replication(replication),
            replication.attempt_timeout(),
        )
        .with_target(
            pipeline.target(),
            ReplayTarget {
                backend: pipeline.backend(),
                descriptor: pipeline.descriptor().to_string(),
            },
        );

        replayer.replay(&wal.active_paths()).await
    }

    /// Main run loop - consumes active-group changes until shutdown.
    ///
    /// The current value of `active_rx` is applied on entry. When the sender
    /// is dropped, the loop keeps doing maintenance until shutdown.
    #[tracing::instrument(skip(self, active_rx))]
    pub async fn run(&self, mut active_rx: watch::Receiver<String>) {
        self.set_state(RouterState::Running);
        info!("Replica router running");

        {
            let initial = active_rx.borrow_and_update().clone();
            if !initial.is_empty() {
                self.set_active(&initial);
            }
        }

        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        let mut watching = true;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }

                changed = active_rx.changed(), if watching => {
                    match changed {
                        Ok(()) => {
                            let name = active_rx.borrow_and_update().clone();
                            self.set_active(&name);
                        }
                        Err(_) => {
                            warn!("Active-group signal closed, keeping current group");
                            watching = false;
                        }
                    }
                }

                _ = maintenance.tick() => {
                    self.release_expired();
                    if let Some(pipeline) = &self.pipeline {
                        crate::metrics::set_queue_depth(pipeline.pending());
                    }
                }
            }
        }

        info!("Replica router stopped");
    }

    /// Initiate graceful shutdown.
    ///
    /// Cancels in-flight calls and the run loop, drains the replication queue
    /// (bounded by the drain timeout), then flushes and closes open segments.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating replica router shutdown...");
        self.set_state(RouterState::ShuttingDown);
        self.cancel.cancel();

        if let Some(pipeline) = &self.pipeline {
            pipeline.shutdown().await;
            let stats = pipeline.stats();
            info!(
                submitted = stats.submitted,
                applied = stats.applied,
                failed = stats.failed,
                rejected = stats.rejected,
                "Replication pipeline stopped"
            );
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Segment sweeper ended abnormally");
            }
        }
        if let Some(wal) = &self.wal {
            wal.close_all();
        }

        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!(
            elapsed_ms = shutdown_start.elapsed().as_millis() as u64,
            "Replica router shutdown complete"
        );
    }
}
