// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append side of the segment log.
//!
//! One active segment per backend name. Every append-or-rotate runs under
//! that backend's mutex, so each segment has exactly one writer. The file
//! handle lives inside the slot and is flushed and dropped whenever the slot
//! is emptied (rotation, idle close, shutdown).
//!
//! # Retirement
//!
//! Each segment written by this process keeps a ledger of its lines:
//!
//! ```text
//! appended ── worker applied ──► applied
//!          └─ failed / rejected ► dropped
//! ```
//!
//! Once a segment is closed and nothing is in flight, it is deleted if every
//! line was applied live. A segment with any dropped line stays on disk for
//! replay. Segments from a crashed process have no ledger and are always
//! replayed.
//!
//! File I/O blocks. On a multi-threaded runtime it runs inside
//! `block_in_place` so other tasks move off the worker thread.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::segment::{epoch_millis, SegmentName};
use crate::config::DurabilityConfig;
use crate::error::{Result, RouterError};
use crate::replication::job::ReplicationJob;

const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Counters for the segment store.
#[derive(Debug, Default)]
pub struct SegmentStats {
    pub appends: AtomicU64,
    pub rotations: AtomicU64,
    pub flushes: AtomicU64,
    pub idle_closes: AtomicU64,
    /// Closed segments deleted because every line was applied live
    pub retired: AtomicU64,
}

/// Point-in-time copy of [`SegmentStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStatsSnapshot {
    pub appends: u64,
    pub rotations: u64,
    pub flushes: u64,
    pub idle_closes: u64,
    pub retired: u64,
}

impl SegmentStats {
    pub fn snapshot(&self) -> SegmentStatsSnapshot {
        SegmentStatsSnapshot {
            appends: self.appends.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            idle_closes: self.idle_closes.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
        }
    }
}

struct ActiveSegment {
    name: SegmentName,
    path: PathBuf,
    writer: BufWriter<File>,
    lines: u64,
    unflushed: u64,
    opened_at: Instant,
    last_write: Instant,
    last_flush: Instant,
}

impl ActiveSegment {
    fn flush(&mut self, stats: &SegmentStats) -> std::io::Result<()> {
        if self.unflushed == 0 {
            return Ok(());
        }
        self.writer.flush()?;
        self.unflushed = 0;
        self.last_flush = Instant::now();
        stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

type Slot = Arc<Mutex<Option<ActiveSegment>>>;

/// Live outcome of the lines in one segment.
#[derive(Debug, Default)]
struct SegmentLedger {
    appended: u64,
    applied: u64,
    dropped: u64,
    closed: bool,
}

impl SegmentLedger {
    fn in_flight(&self) -> u64 {
        self.appended.saturating_sub(self.applied + self.dropped)
    }

    fn is_settled(&self) -> bool {
        self.closed && self.in_flight() == 0
    }
}

/// Run blocking file work without stalling a runtime worker thread.
fn blocking_io<R>(f: impl FnOnce() -> R) -> R {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

pub struct LogSegmentStore {
    config: DurabilityConfig,
    segments: DashMap<String, Slot>,
    ledgers: DashMap<PathBuf, SegmentLedger>,
    open: AtomicUsize,
    stats: SegmentStats,
}

impl LogSegmentStore {
    pub fn new(config: DurabilityConfig) -> Self {
        Self {
            config,
            segments: DashMap::new(),
            ledgers: DashMap::new(),
            open: AtomicUsize::new(0),
            stats: SegmentStats::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn stats(&self) -> SegmentStatsSnapshot {
        self.stats.snapshot()
    }

    fn slot(&self, backend: &str) -> Slot {
        self.segments
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Append one job to the backend's active segment, opening or rotating as needed.
    ///
    /// Returns the path written to.
    pub fn append(&self, backend: &str, job: &ReplicationJob) -> Result<PathBuf> {
        let line = job.encode()?;
        let slot = self.slot(backend);
        blocking_io(|| self.append_line(backend, &slot, &line))
    }

    fn append_line(&self, backend: &str, slot: &Slot, line: &str) -> Result<PathBuf> {
        let mut guard = slot.lock();
        let now = Instant::now();

        let rotate = guard.as_ref().is_some_and(|seg| {
            seg.lines >= self.config.max_lines
                || now.duration_since(seg.opened_at) >= self.config.rotation_window()
        });
        if rotate {
            if let Some(seg) = guard.take() {
                self.close(seg, "rotated");
                self.stats.rotations.fetch_add(1, Ordering::Relaxed);
            }
        }

        if guard.is_none() {
            *guard = Some(self.open(backend)?);
        }
        let Some(seg) = guard.as_mut() else {
            return Err(RouterError::Configuration(format!("no active segment for '{backend}'")));
        };

        let written = seg
            .writer
            .write_all(line.as_bytes())
            .and_then(|()| seg.writer.write_all(LINE_TERMINATOR));
        if let Err(e) = written {
            // Give up the handle; the next append starts a fresh segment.
            error!(backend, path = %seg.path.display(), error = %e, "Segment write failed");
            // A torn line: keep the file for replay
            if let Some(mut ledger) = self.ledgers.get_mut(&seg.path) {
                ledger.appended += 1;
                ledger.dropped += 1;
            }
            if let Some(seg) = guard.take() {
                self.close(seg, "write_error");
            }
            return Err(e.into());
        }

        seg.lines += 1;
        seg.unflushed += 1;
        seg.last_write = now;
        if let Some(mut ledger) = self.ledgers.get_mut(&seg.path) {
            ledger.appended += 1;
        }
        self.stats.appends.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_wal_append(backend);

        if seg.unflushed >= self.config.flush_lines.max(1)
            || now.duration_since(seg.last_flush) >= self.config.flush_interval()
        {
            seg.flush(&self.stats)?;
        }

        Ok(seg.path.clone())
    }

    fn open(&self, backend: &str) -> Result<ActiveSegment> {
        fs::create_dir_all(&self.config.dir)?;

        let mut name = SegmentName::new(backend, epoch_millis(), 0);
        loop {
            let path = name.path_in(&self.config.dir);
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => {
                    let now = Instant::now();
                    debug!(backend, path = %path.display(), "Opened log segment");
                    let open = self.open.fetch_add(1, Ordering::Relaxed) + 1;
                    crate::metrics::set_wal_open_segments(open);
                    self.ledgers.insert(path.clone(), SegmentLedger::default());
                    return Ok(ActiveSegment {
                        name,
                        path,
                        writer: BufWriter::new(file),
                        lines: 0,
                        unflushed: 0,
                        opened_at: now,
                        last_write: now,
                        last_flush: now,
                    });
                }
                // Same millisecond as an existing segment
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    name = name.next_version();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&self, mut seg: ActiveSegment, reason: &str) {
        if let Err(e) = seg.flush(&self.stats) {
            error!(segment = %seg.name, error = %e, "Failed to flush segment on close");
            crate::metrics::record_error("wal", "flush", "io");
        }
        debug!(segment = %seg.name, lines = seg.lines, reason, "Closed log segment");
        let open = self.open.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        crate::metrics::record_wal_close(&seg.name.backend, reason);
        crate::metrics::set_wal_open_segments(open);

        if let Some(mut ledger) = self.ledgers.get_mut(&seg.path) {
            ledger.closed = true;
        }
        self.retire_if_settled(&seg.path);
    }

    /// Record that a line of `path` reached the secondary target.
    pub fn record_applied(&self, path: &Path) {
        if let Some(mut ledger) = self.ledgers.get_mut(path) {
            ledger.applied += 1;
        }
        self.retire_if_settled(path);
    }

    /// Record that a line of `path` was given up on (failed or never queued).
    pub fn record_dropped(&self, path: &Path) {
        if let Some(mut ledger) = self.ledgers.get_mut(path) {
            ledger.dropped += 1;
        }
        self.retire_if_settled(path);
    }

    /// Delete a closed segment whose lines were all applied live.
    fn retire_if_settled(&self, path: &Path) {
        let Some((path, ledger)) = self.ledgers.remove_if(path, |_, ledger| ledger.is_settled()) else {
            return;
        };
        if ledger.dropped > 0 {
            info!(
                path = %path.display(),
                appended = ledger.appended,
                dropped = ledger.dropped,
                "Keeping segment with unapplied lines for replay"
            );
            return;
        }
        match blocking_io(|| fs::remove_file(&path)) {
            Ok(()) => {
                self.stats.retired.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), lines = ledger.appended, "Retired fully applied segment");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove applied segment");
                crate::metrics::record_error("wal", "retire", "io");
            }
        }
    }

    /// Flush stale buffers and close segments idle for longer than the rotation window.
    ///
    /// Returns the number of segments closed.
    pub fn sweep(&self) -> usize {
        blocking_io(|| self.sweep_slots())
    }

    fn sweep_slots(&self) -> usize {
        let now = Instant::now();
        let window = self.config.rotation_window();
        let interval = self.config.flush_interval();
        let mut closed = 0;

        let slots: Vec<Slot> = self.segments.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            let mut guard = slot.lock();
            let idle = guard
                .as_ref()
                .is_some_and(|seg| now.duration_since(seg.last_write) > window);
            if idle {
                if let Some(seg) = guard.take() {
                    self.close(seg, "idle");
                    self.stats.idle_closes.fetch_add(1, Ordering::Relaxed);
                    closed += 1;
                }
            } else if let Some(seg) = guard.as_mut() {
                if now.duration_since(seg.last_flush) >= interval {
                    if let Err(e) = seg.flush(&self.stats) {
                        warn!(segment = %seg.name, error = %e, "Periodic segment flush failed");
                        crate::metrics::record_error("wal", "flush", "io");
                    }
                }
            }
        }
        closed
    }

    /// Flush and close every open segment.
    pub fn close_all(&self) {
        let slots: Vec<Slot> = self.segments.iter().map(|e| e.value().clone()).collect();
        blocking_io(|| {
            for slot in slots {
                if let Some(seg) = slot.lock().take() {
                    self.close(seg, "shutdown");
                }
            }
        });
    }

    /// Paths replay must not touch: segments open for writing and segments
    /// with lines still queued for the live worker.
    pub fn active_paths(&self) -> HashSet<PathBuf> {
        let mut paths: HashSet<PathBuf> = self
            .segments
            .iter()
            .filter_map(|e| e.value().lock().as_ref().map(|seg| seg.path.clone()))
            .collect();
        paths.extend(
            self.ledgers
                .iter()
                .filter(|e| e.value().in_flight() > 0)
                .map(|e| e.key().clone()),
        );
        paths
    }

    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    /// Run [`sweep`](Self::sweep) on the configured interval until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(dir = %store.dir().display(), "Segment sweeper started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = store.sweep();
                        if closed > 0 {
                            debug!(closed, "Closed idle segments");
                        }
                    }
                }
            }
            store.close_all();
            info!("Segment sweeper stopped");
        })
    }
}

impl Drop for LogSegmentStore {
    fn drop(&mut self) {
        for entry in self.segments.iter() {
            if let Some(mut seg) = entry.value().lock().take() {
                let _ = seg.flush(&self.stats);
            }
        }
    }
}
