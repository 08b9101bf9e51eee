// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Load-balancing policies over a group's replicas.
//!
//! Chosen once per group from configuration:
//! - **Random**: uniform pick, ignores the correlation id
//! - **RoundRobinAffinity**: a correlation id that has been seen continues to
//!   the next replica after the one it used last; a fresh id takes the next
//!   slot of a shared cursor
//!
//! # Example
//!
//! ```
//! use replica_router::LoadBalancePolicy;
//!
//! let policy = LoadBalancePolicy::from_name(Some("round_robin"), 10);
//! assert_eq!(policy.select_index(100, 3), Some(0));
//! assert_eq!(policy.select_index(100, 3), Some(1)); // same request moves on
//! assert_eq!(policy.select_index(200, 3), Some(1)); // fresh request uses the cursor
//! ```

pub mod affinity;

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use tracing::warn;

pub use affinity::AffinityCache;

#[derive(Debug)]
pub enum LoadBalancePolicy {
    Random,
    RoundRobinAffinity {
        cursor: AtomicUsize,
        affinity: AffinityCache,
    },
}

impl LoadBalancePolicy {
    pub fn round_robin(affinity_capacity: usize) -> Self {
        Self::RoundRobinAffinity {
            cursor: AtomicUsize::new(0),
            affinity: AffinityCache::new(affinity_capacity),
        }
    }

    /// Policy named in configuration. Unknown or missing names fall back to
    /// round robin.
    pub fn from_name(name: Option<&str>, affinity_capacity: usize) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()) {
            Some(n) if n == "random" => Self::Random,
            Some(n) if n.is_empty() || n == "round_robin" || n == "roundrobin" => {
                Self::round_robin(affinity_capacity)
            }
            None => Self::round_robin(affinity_capacity),
            Some(other) => {
                warn!(policy = %other, "Unknown load balance policy, using round robin");
                Self::round_robin(affinity_capacity)
            }
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::RoundRobinAffinity { .. } => "round_robin",
        }
    }

    /// Pick an index into a candidate list of length `len`.
    pub fn select_index(&self, correlation_id: i64, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let idx = match self {
            Self::Random => rand::thread_rng().gen_range(0..len),
            Self::RoundRobinAffinity { cursor, affinity } => affinity.update(correlation_id, |cached| {
                match cached {
                    Some(prev) => (prev + 1) % len,
                    None => cursor.fetch_add(1, Ordering::Relaxed) % len,
                }
            }),
        };
        Some(idx)
    }

    /// Pick one candidate.
    pub fn select_one<'a, T>(&self, correlation_id: i64, candidates: &'a [T]) -> Option<&'a T> {
        self.select_index(correlation_id, candidates.len())
            .and_then(|idx| candidates.get(idx))
    }
}

impl Default for LoadBalancePolicy {
    fn default() -> Self {
        Self::round_robin(affinity::DEFAULT_AFFINITY_CAPACITY)
    }
}
