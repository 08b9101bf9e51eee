// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! A single physical backend target and its liveness bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::EndpointConfig;

/// One primary or replica connection target.
///
/// Created once from configuration and never destroyed at runtime. Only the
/// execution engine mutates the liveness fields; routing reads them.
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    descriptor: String,
    /// Cleared while excluded
    available: AtomicBool,
    consecutive_failures: AtomicU32,
    last_retry_at: Mutex<Option<Instant>>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            available: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_retry_at: Mutex::new(None),
        }
    }

    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(config.name.clone(), config.descriptor.clone())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_retry_at(&self) -> Option<Instant> {
        *self.last_retry_at.lock()
    }

    /// Record a successful call. Returns the failure streak that was cleared.
    pub fn record_success(&self) -> u32 {
        self.available.store(true, Ordering::Release);
        self.consecutive_failures.swap(0, Ordering::AcqRel)
    }

    /// Record a recoverable failure. Returns the new streak length.
    pub fn record_failure(&self) -> u32 {
        *self.last_retry_at.lock() = Some(Instant::now());
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::Release);
    }

    /// Cooldown elapsed: eligible again, but the failure streak is kept
    /// until a call actually succeeds.
    pub fn mark_available(&self) {
        self.available.store(true, Ordering::Release);
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let ep = Endpoint::new("p0", "redis://p0");
        assert!(ep.is_available());
        assert_eq!(ep.failure_count(), 0);
        assert!(ep.last_retry_at().is_none());
        assert_eq!(ep.to_string(), "p0");
    }

    #[test]
    fn test_failures_accumulate_and_success_resets() {
        let ep = Endpoint::new("p0", "redis://p0");
        assert_eq!(ep.record_failure(), 1);
        assert_eq!(ep.record_failure(), 2);
        assert!(ep.last_retry_at().is_some());

        ep.mark_unavailable();
        assert!(!ep.is_available());

        assert_eq!(ep.record_success(), 2);
        assert_eq!(ep.failure_count(), 0);
        assert!(ep.is_available());
    }

    #[test]
    fn test_mark_available_keeps_streak() {
        let ep = Endpoint::new("r1", "redis://r1");
        ep.record_failure();
        ep.mark_unavailable();
        ep.mark_available();
        assert!(ep.is_available());
        assert_eq!(ep.failure_count(), 1);
    }
}
