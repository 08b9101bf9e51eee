// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Double-write pipeline: mirrors successful primary writes to a secondary target.
//!
//! # Flow
//!
//! ```text
//! submit(job) ──► [segment append] ──► bounded queue ──► worker ──► secondary
//!     (many producers)   (durable)        (try_send)     (single)   (retry + timeout)
//! ```
//!
//! `submit` never blocks and never fails the caller. A full queue drops the
//! job (it is still on disk when durability is on). The worker gives each job
//! a bounded number of attempts and then drops it with an error log.
//!
//! With durability on, every outcome is reported back to the segment store:
//! a segment whose lines were all applied live is deleted once closed, and
//! one with a failed or rejected line is kept for replay.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::ReplicationJob;
use super::wal::LogSegmentStore;
use crate::backend::Backend;
use crate::config::ReplicationConfig;
use crate::resilience::retry::RetryConfig;

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub submitted: AtomicU64,
    pub applied: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
    pub durable_appends: AtomicU64,
    pub durability_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub submitted: u64,
    pub applied: u64,
    pub failed: u64,
    pub rejected: u64,
    pub durable_appends: u64,
    pub durability_errors: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            durable_appends: self.durable_appends.load(Ordering::Relaxed),
            durability_errors: self.durability_errors.load(Ordering::Relaxed),
        }
    }
}

/// A job on its way to the worker, with the segment line it was logged to.
struct Queued {
    job: ReplicationJob,
    segment: Option<PathBuf>,
}

/// Everything the worker task owns.
struct Worker {
    target: String,
    descriptor: String,
    backend: Arc<dyn Backend>,
    retry: RetryConfig,
    attempt_timeout: Duration,
    stats: Arc<PipelineStats>,
    wal: Option<Arc<LogSegmentStore>>,
}

impl Worker {
    async fn apply(&self, queued: Queued) {
        let Queued { job, segment } = queued;
        let applied = match job
            .apply_with_retry(self.backend.as_ref(), &self.descriptor, &self.retry, self.attempt_timeout)
            .await
        {
            Ok(_) => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_replication(&self.target, job.kind(), "applied");
                true
            }
            Err(e) => {
                // Dropped here; recovery is the segment log's job
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_replication(&self.target, job.kind(), "failed");
                error!(
                    target_name = %self.target,
                    kind = job.kind(),
                    ops = job.len(),
                    error = %e,
                    "Replication job dropped after retries"
                );
                false
            }
        };

        if let (Some(wal), Some(path)) = (&self.wal, segment) {
            if applied {
                wal.record_applied(&path);
            } else {
                wal.record_dropped(&path);
            }
        }
    }

    async fn run(self, mut rx: mpsc::Receiver<Queued>, cancel: CancellationToken) {
        info!(target_name = %self.target, "Replication worker started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => self.apply(job).await,
                    None => break,
                },
            }
        }

        // Refuse new work and finish what is already queued
        rx.close();
        let mut drained = 0usize;
        while let Some(job) = rx.recv().await {
            self.apply(job).await;
            drained += 1;
        }
        info!(target_name = %self.target, drained, "Replication worker stopped");
    }
}

pub struct ReplicationPipeline {
    target: String,
    descriptor: String,
    backend: Arc<dyn Backend>,
    config: ReplicationConfig,
    tx: mpsc::Sender<Queued>,
    rx: Mutex<Option<mpsc::Receiver<Queued>>>,
    wal: Option<Arc<LogSegmentStore>>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationPipeline {
    /// Create a pipeline for one secondary target. Nothing runs until [`start`](Self::start).
    pub fn new(
        target: impl Into<String>,
        descriptor: impl Into<String>,
        backend: Arc<dyn Backend>,
        config: ReplicationConfig,
        wal: Option<Arc<LogSegmentStore>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            target: target.into(),
            descriptor: descriptor.into(),
            backend,
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            wal,
            stats: Arc::new(PipelineStats::default()),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Jobs waiting in the in-memory queue.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the single consumer. Calling it twice is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            debug!(target_name = %self.target, "Replication worker already started");
            return;
        };
        let worker = Worker {
            target: self.target.clone(),
            descriptor: self.descriptor.clone(),
            backend: Arc::clone(&self.backend),
            retry: RetryConfig::replication(&self.config),
            attempt_timeout: self.config.attempt_timeout(),
            stats: Arc::clone(&self.stats),
            wal: self.wal.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, self.cancel.clone()));
        *self.worker.lock() = Some(handle);
    }

    /// Hand a job to the pipeline. Returns whether it reached the in-memory queue.
    ///
    /// Durability and queue failures are logged and counted, never returned.
    pub fn submit(&self, job: ReplicationJob) -> bool {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let segment = self.wal.as_ref().and_then(|wal| match wal.append(&self.target, &job) {
            Ok(path) => {
                self.stats.durable_appends.fetch_add(1, Ordering::Relaxed);
                Some(path)
            }
            Err(e) => {
                // Degrade to the in-memory path
                self.stats.durability_errors.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_error("wal", "append", "io");
                warn!(target_name = %self.target, error = %e, "Segment append failed, continuing without durability");
                None
            }
        });

        match self.tx.try_send(Queued { job, segment }) {
            Ok(()) => {
                crate::metrics::set_queue_depth(self.pending());
                true
            }
            Err(TrySendError::Full(queued)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_queue_rejected(&self.target);
                self.keep_segment(queued.segment.as_deref());
                warn!(
                    target_name = %self.target,
                    kind = queued.job.kind(),
                    capacity = self.tx.max_capacity(),
                    durable = self.is_durable(),
                    "Replication queue full, job dropped"
                );
                false
            }
            Err(TrySendError::Closed(queued)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_queue_rejected(&self.target);
                self.keep_segment(queued.segment.as_deref());
                debug!(target_name = %self.target, "Replication pipeline closed, job dropped");
                false
            }
        }
    }

    /// A line that never reached the worker pins its segment for replay.
    fn keep_segment(&self, segment: Option<&Path>) {
        if let (Some(wal), Some(path)) = (&self.wal, segment) {
            wal.record_dropped(path);
        }
    }

    /// Stop the worker, letting it drain the queue for at most the drain timeout.
    #[tracing::instrument(skip(self), fields(target_name = %self.target))]
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handle = self.worker.lock().take();
        let Some(mut handle) = handle else {
            return;
        };

        let drain_timeout = self.config.drain_timeout();
        match tokio::time::timeout(drain_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Replication worker panicked"),
            Err(_) => {
                warn!(
                    drain_timeout_ms = drain_timeout.as_millis() as u64,
                    pending = self.pending(),
                    "Replication drain timed out, abandoning queued jobs"
                );
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, InMemoryBackend};
    use crate::config::DurabilityConfig;
    use crate::operation::Operation;
    use serde_json::json;

    fn config() -> ReplicationConfig {
        ReplicationConfig {
            queue_capacity: 16,
            retry_times: 2,
            retry_delay_ms: 1,
            attempt_timeout_ms: 500,
            drain_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    fn set(k: &str) -> ReplicationJob {
        ReplicationJob::single(Operation::new("SET", vec![json!(k), json!("v")]))
    }

    fn pipeline(backend: Arc<InMemoryBackend>, config: ReplicationConfig) -> ReplicationPipeline {
        ReplicationPipeline::new("dr", "dr-desc", backend, config, None)
    }

    #[tokio::test]
    async fn test_applies_in_submission_order() {
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = pipeline(backend.clone(), config());
        pipeline.start();

        for k in ["a", "b", "c"] {
            assert!(pipeline.submit(set(k)));
        }
        pipeline.shutdown().await;

        let keys: Vec<String> = backend.applied_on("dr-desc").iter().filter_map(|op| op.arg_str(0)).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(pipeline.stats().applied, 3);
    }

    #[tokio::test]
    async fn test_unreachable_target_drops_after_retries() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail("dr-desc", BackendError::Recoverable("connection refused".into()));
        let pipeline = pipeline(backend.clone(), config());
        pipeline.start();

        assert!(pipeline.submit(set("a")));
        pipeline.shutdown().await;

        let stats = pipeline.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.applied, 0);
        assert_eq!(backend.calls("dr-desc"), 2);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = pipeline(
            backend,
            ReplicationConfig {
                queue_capacity: 1,
                ..config()
            },
        );

        // worker not started, so the queue stays full
        assert!(pipeline.submit(set("a")));
        assert!(!pipeline.submit(set("b")));
        assert_eq!(pipeline.stats().rejected, 1);
        assert_eq!(pipeline.pending(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_jobs_queued_before_start() {
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = pipeline(backend.clone(), config());

        for k in ["a", "b", "c"] {
            pipeline.submit(set(k));
        }
        pipeline.start();
        pipeline.shutdown().await;

        assert_eq!(backend.applied_on("dr-desc").len(), 3);
        assert!(!pipeline.is_running());
        assert!(!pipeline.submit(set("late")));
    }

    #[tokio::test]
    async fn test_durable_append_precedes_queue() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(LogSegmentStore::new(DurabilityConfig {
            enabled: true,
            dir: dir.path().to_path_buf(),
            flush_lines: 1,
            ..Default::default()
        }));
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = ReplicationPipeline::new("dr", "dr-desc", backend, config(), Some(wal.clone()));

        // Appended before it reaches the queue
        let queued = pipeline.submit(set("a"));
        assert!(queued);
        assert_eq!(pipeline.stats().durable_appends, 1);

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(wal.stats().appends, 1);
    }

    fn durable(dir: &std::path::Path, backend: Arc<InMemoryBackend>, config: ReplicationConfig) -> (ReplicationPipeline, Arc<LogSegmentStore>) {
        let wal = Arc::new(LogSegmentStore::new(DurabilityConfig {
            enabled: true,
            dir: dir.to_path_buf(),
            flush_lines: 1,
            ..Default::default()
        }));
        let pipeline = ReplicationPipeline::new("dr", "dr-desc", backend, config, Some(wal.clone()));
        (pipeline, wal)
    }

    fn segment_count(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    fn incr(k: &str) -> ReplicationJob {
        ReplicationJob::single(Operation::new("INCR", vec![json!(k)]))
    }

    #[tokio::test]
    async fn test_fully_applied_segment_is_retired_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let (pipeline, wal) = durable(dir.path(), backend.clone(), config());
        pipeline.start();

        pipeline.submit(incr("n"));
        pipeline.submit(incr("n"));
        pipeline.shutdown().await;
        assert_eq!(segment_count(dir.path()), 1);

        wal.close_all();
        assert_eq!(segment_count(dir.path()), 0);
        assert_eq!(wal.stats().retired, 1);
        assert_eq!(backend.value("dr-desc", "n"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_failed_job_keeps_segment() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail("dr-desc", BackendError::Recoverable("connection refused".into()));
        let (pipeline, wal) = durable(dir.path(), backend, config());
        pipeline.start();

        pipeline.submit(incr("n"));
        pipeline.shutdown().await;
        wal.close_all();

        assert_eq!(segment_count(dir.path()), 1);
        assert_eq!(wal.stats().retired, 0);
    }

    #[tokio::test]
    async fn test_rejected_job_keeps_segment() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let (pipeline, wal) = durable(
            dir.path(),
            backend.clone(),
            ReplicationConfig {
                queue_capacity: 1,
                ..config()
            },
        );

        assert!(pipeline.submit(incr("n")));
        assert!(!pipeline.submit(incr("n")));
        pipeline.start();
        pipeline.shutdown().await;
        wal.close_all();

        // the first line applied, the second only exists on disk
        assert_eq!(backend.value("dr-desc", "n"), Some(json!(1)));
        assert_eq!(segment_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_segment_with_queued_lines_is_shielded_from_replay() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let (pipeline, wal) = durable(dir.path(), backend, config());

        // worker not started: the line is in flight
        pipeline.submit(incr("n"));
        wal.close_all();
        assert_eq!(wal.open_count(), 0);
        assert_eq!(wal.active_paths().len(), 1);

        pipeline.start();
        pipeline.shutdown().await;
        assert!(wal.active_paths().is_empty());
        assert_eq!(segment_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = pipeline(backend, config());
        pipeline.start();
        pipeline.start();
        assert!(pipeline.is_running());
        pipeline.shutdown().await;
    }
}
