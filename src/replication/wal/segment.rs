// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Segment file naming.
//!
//! ```text
//! {dir}/{backend}-{createdAtEpochMillis, 13 digits}-{version}.dat
//! ```
//!
//! Backend names may themselves contain `-`; the timestamp and version are
//! always the last two dash-separated fields.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

pub const SEGMENT_EXTENSION: &str = "dat";

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.+)-(\d{13})-(\d+)\.dat$").unwrap_or_else(|e| unreachable!("static segment pattern: {e}"))
    })
}

/// Parsed identity of one segment file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName {
    pub backend: String,
    pub created_at_ms: u64,
    pub version: u32,
}

impl SegmentName {
    pub fn new(backend: impl Into<String>, created_at_ms: u64, version: u32) -> Self {
        Self {
            backend: backend.into(),
            created_at_ms,
            version,
        }
    }

    /// Parse a bare file name. Returns `None` for anything not matching the grammar.
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = pattern().captures(file_name)?;
        let backend = caps.get(1)?.as_str();
        let created_at_ms = caps.get(2)?.as_str().parse().ok()?;
        let version = caps.get(3)?.as_str().parse().ok()?;
        Some(Self::new(backend, created_at_ms, version))
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name().and_then(|n| n.to_str()).and_then(Self::parse)
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{}-{:013}-{}.{SEGMENT_EXTENSION}",
            self.backend, self.created_at_ms, self.version
        )
    }

    #[must_use]
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Same segment identity, next version.
    #[must_use]
    pub fn next_version(&self) -> Self {
        Self::new(self.backend.clone(), self.created_at_ms, self.version.saturating_add(1))
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Replay order within one backend: timestamp, then version.
impl Ord for SegmentName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.backend
            .cmp(&other.backend)
            .then(self.created_at_ms.cmp(&other.created_at_ms))
            .then(self.version.cmp(&other.version))
    }
}

impl PartialOrd for SegmentName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Wall-clock milliseconds since the epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
