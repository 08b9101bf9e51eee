// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Temporary removal of endpoints (and, rarely, groups) from routing.
//!
//! There is no timer: expired entries are dropped by [`ExclusionSet::prune`]
//! at the start of every routing decision.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExclusionKey {
    Group(String),
    Endpoint(String),
}

impl ExclusionKey {
    pub fn endpoint(name: &str) -> Self {
        Self::Endpoint(name.to_string())
    }

    pub fn group(name: &str) -> Self {
        Self::Group(name.to_string())
    }
}

impl std::fmt::Display for ExclusionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Group(name) => write!(f, "group:{name}"),
            Self::Endpoint(name) => write!(f, "endpoint:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exclusion {
    pub excluded_at: Instant,
    pub retry_after: Instant,
}

/// Concurrent exclusion table shared by all primary-path callers.
#[derive(Debug, Default)]
pub struct ExclusionSet {
    entries: DashMap<ExclusionKey, Exclusion>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude `key` for `cooldown` from now. Re-excluding restarts the cooldown.
    pub fn exclude(&self, key: ExclusionKey, cooldown: Duration) -> Exclusion {
        let now = Instant::now();
        let exclusion = Exclusion {
            excluded_at: now,
            retry_after: now + cooldown,
        };
        self.entries.insert(key, exclusion);
        exclusion
    }

    pub fn remove(&self, key: &ExclusionKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop entries whose cooldown has elapsed, returning their keys.
    pub fn prune(&self) -> Vec<ExclusionKey> {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> Vec<ExclusionKey> {
        let expired: Vec<ExclusionKey> = self
            .entries
            .iter()
            .filter(|e| e.value().retry_after <= now)
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter(|key| {
                self.entries
                    .remove_if(key, |_, v| v.retry_after <= now)
                    .is_some()
            })
            .collect()
    }

    #[must_use]
    pub fn is_excluded(&self, key: &ExclusionKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn is_endpoint_excluded(&self, name: &str) -> bool {
        self.is_excluded(&ExclusionKey::endpoint(name))
    }

    #[must_use]
    pub fn is_group_excluded(&self, name: &str) -> bool {
        self.is_excluded(&ExclusionKey::group(name))
    }

    pub fn get(&self, key: &ExclusionKey) -> Option<Exclusion> {
        self.entries.get(key).map(|e| *e.value())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
