// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Startup (or on-demand) replay of unfinished segments.
//!
//! # Per-segment outcome
//!
//! ```text
//!   lines:   A   B   C          (B fails to apply)
//!   prefix:  1                  (lines applied before the first failure)
//!   salvage: B   C   -> {name}-{createdAt}-{version+1}.dat
//!   original segment deleted
//! ```
//!
//! Every line is attempted even after a failure, so later lines may have been
//! applied and are applied again when the salvage segment is replayed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Split};
use tracing::{debug, error, info, warn};

use super::segment::{epoch_millis, SegmentName, SEGMENT_EXTENSION};
use crate::backend::{Backend, BackendError};
use crate::error::Result;
use crate::replication::job::ReplicationJob;
use crate::resilience::retry::RetryConfig;

/// Where replayed jobs for one backend name are applied.
#[derive(Clone)]
pub struct ReplayTarget {
    pub backend: Arc<dyn Backend>,
    pub descriptor: String,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Segments replayed and removed
    pub segments: usize,
    pub applied: usize,
    pub interruptions: usize,
    /// Salvage segments written for the unapplied remainder
    pub salvaged: usize,
    /// Files left on disk: malformed names, unknown targets, active or fresh segments
    pub skipped: usize,
}

impl ReplayReport {
    fn merge(&mut self, other: &SegmentOutcome) {
        self.segments += 1;
        self.applied += other.applied;
        self.interruptions += other.interruptions;
        if other.salvaged.is_some() {
            self.salvaged += 1;
        }
    }
}

#[derive(Debug, Default)]
struct SegmentOutcome {
    applied: usize,
    interruptions: usize,
    salvaged: Option<PathBuf>,
}

pub struct SegmentReplayer {
    dir: PathBuf,
    targets: HashMap<String, ReplayTarget>,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl SegmentReplayer {
    pub fn new(dir: impl Into<PathBuf>, retry: RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            targets: HashMap::new(),
            retry,
            attempt_timeout,
        }
    }

    #[must_use]
    pub fn with_target(mut self, name: impl Into<String>, target: ReplayTarget) -> Self {
        self.targets.insert(name.into(), target);
        self
    }

    /// Replay every eligible segment in the directory.
    ///
    /// `active` holds paths still being written; they and anything created
    /// after the scan starts are left alone.
    #[tracing::instrument(skip(self, active), fields(dir = %self.dir.display()))]
    pub async fn replay(&self, active: &HashSet<PathBuf>) -> Result<ReplayReport> {
        let scan_started_ms = epoch_millis();
        let mut report = ReplayReport::default();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No segment directory, nothing to replay");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        let mut candidates: BTreeMap<String, Vec<(SegmentName, PathBuf)>> = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = SegmentName::from_path(&path) else {
                warn!(file = %path.display(), "Skipping file with malformed segment name");
                report.skipped += 1;
                continue;
            };
            if active.contains(&path) || name.created_at_ms > scan_started_ms {
                debug!(segment = %name, "Skipping segment still being written");
                report.skipped += 1;
                continue;
            }
            candidates.entry(name.backend.clone()).or_default().push((name, path));
        }

        for (backend, mut segments) in candidates {
            let Some(target) = self.targets.get(&backend) else {
                warn!(backend = %backend, segments = segments.len(), "No replay target configured, leaving segments on disk");
                crate::metrics::record_error("replay", "target", "unknown_backend");
                report.skipped += segments.len();
                continue;
            };

            segments.sort();
            for (name, path) in segments {
                let outcome = self.replay_segment(&name, &path, target).await;
                let label = if outcome.salvaged.is_some() { "salvaged" } else { "clean" };
                crate::metrics::record_replay_segment(&backend, label, outcome.applied);
                report.merge(&outcome);
            }
        }

        info!(
            segments = report.segments,
            applied = report.applied,
            interruptions = report.interruptions,
            salvaged = report.salvaged,
            skipped = report.skipped,
            "Segment replay complete"
        );
        Ok(report)
    }

    async fn apply(&self, target: &ReplayTarget, job: &ReplicationJob) -> std::result::Result<(), BackendError> {
        job.apply_with_retry(target.backend.as_ref(), &target.descriptor, &self.retry, self.attempt_timeout)
            .await
            .map(|_| ())
    }

    async fn replay_segment(&self, name: &SegmentName, path: &Path, target: &ReplayTarget) -> SegmentOutcome {
        let mut outcome = SegmentOutcome::default();

        let mut lines = match SegmentLines::open(path).await {
            Ok(lines) => lines,
            Err(e) => {
                // Unreadable: leave it for the next pass rather than lose it
                error!(segment = %name, error = %e, "Failed to open segment");
                crate::metrics::record_error("replay", "read", "io");
                return outcome;
            }
        };

        // Lines applied cleanly before the first interruption
        let mut clean_prefix: Option<usize> = None;
        let mut total = 0usize;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!(segment = %name, line = total + 1, error = %e, "Failed to read segment");
                    crate::metrics::record_error("replay", "read", "io");
                    return outcome;
                }
            };
            let idx = total;
            total += 1;

            let applied = match std::str::from_utf8(&line).map_err(|e| e.to_string()).and_then(|text| {
                ReplicationJob::decode(text).map_err(|e| e.to_string())
            }) {
                Ok(job) => match self.apply(target, &job).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(segment = %name, line = idx + 1, error = %e, "Replay apply failed");
                        false
                    }
                },
                Err(e) => {
                    warn!(segment = %name, line = idx + 1, error = %e, "Undecodable segment line");
                    false
                }
            };

            if applied {
                outcome.applied += 1;
            } else {
                outcome.interruptions += 1;
                clean_prefix.get_or_insert(idx);
            }
        }
        drop(lines);

        if let Some(prefix) = clean_prefix {
            match self.salvage(name, path, prefix).await {
                Ok((salvage_path, copied)) => {
                    info!(
                        segment = %name,
                        salvage = %salvage_path.display(),
                        lines = copied,
                        "Salvaged unapplied remainder"
                    );
                    outcome.salvaged = Some(salvage_path);
                }
                Err(e) => {
                    error!(segment = %name, error = %e, "Failed to write salvage segment");
                    crate::metrics::record_error("replay", "salvage", "io");
                }
            }
        }

        if let Err(e) = fs::remove_file(path).await {
            error!(segment = %name, error = %e, "Failed to remove replayed segment");
            crate::metrics::record_error("replay", "remove", "io");
        } else {
            debug!(segment = %name, applied = outcome.applied, "Removed replayed segment");
        }
        outcome
    }

    /// Copy every line of `source` after the first `skip` into a new segment
    /// with the next free version. Returns its path and the lines copied.
    async fn salvage(&self, name: &SegmentName, source: &Path, skip: usize) -> std::io::Result<(PathBuf, usize)> {
        let mut next = name.next_version();
        while fs::try_exists(next.path_in(&self.dir)).await? {
            next = next.next_version();
        }

        // Written under a temporary name so a crash never leaves a half-written segment
        let final_path = next.path_in(&self.dir);
        let tmp = final_path.with_extension(format!("{SEGMENT_EXTENSION}.tmp"));
        let copied = match copy_lines(source, &tmp, skip).await {
            Ok(copied) => copied,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        fs::rename(&tmp, &final_path).await?;
        Ok((final_path, copied))
    }
}

/// Stream `source` into `dest`, skipping the first `skip` lines and writing
/// the rest CRLF-terminated.
async fn copy_lines(source: &Path, dest: &Path, skip: usize) -> std::io::Result<usize> {
    let mut lines = SegmentLines::open(source).await?;
    let mut out = BufWriter::new(fs::File::create(dest).await?);
    let mut idx = 0usize;
    let mut copied = 0usize;
    while let Some(line) = lines.next_line().await? {
        if idx >= skip {
            out.write_all(&line).await?;
            out.write_all(b"\r\n").await?;
            copied += 1;
        }
        idx += 1;
    }
    out.flush().await?;
    out.into_inner().sync_all().await?;
    Ok(copied)
}

/// Non-blank lines of a segment file, read incrementally. Accepts LF or CRLF.
struct SegmentLines {
    inner: Split<BufReader<fs::File>>,
}

impl SegmentLines {
    async fn open(path: &Path) -> std::io::Result<Self> {
        let file = fs::File::open(path).await?;
        Ok(Self {
            inner: BufReader::new(file).split(b'\n'),
        })
    }

    async fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        while let Some(mut line) = self.inner.next_segment().await? {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }
}
