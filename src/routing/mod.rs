// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-level routing: pick a replica group, then an endpoint inside it.
//!
//! ```text
//!  Classification ──► GroupStrategy ──► ReplicaGroup ──► node selection ──► Endpoint
//!                    (Pinned | Locality)                (primary | LB over replicas)
//!                           ▲                                  ▲
//!                           └───────────── ExclusionSet ───────┘
//! ```
//!
//! Node selection rules:
//! - writes, and anything inside a non-read-only transaction, go to the primary
//! - a group without replicas always answers with its primary
//! - reads ask the group's policy up to `replicas.len()` times, skipping
//!   excluded replicas; if all are excluded the primary is used

pub mod exclusion;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::operation::Classification;
use crate::topology::{Endpoint, ReplicaGroup, Topology};

pub use exclusion::{Exclusion, ExclusionKey, ExclusionSet};

/// Group-level strategy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStrategy {
    /// Always the active group.
    Pinned,
    /// Reads prefer a group in the local region; writes use the active group.
    LocalityAware,
}

impl GroupStrategy {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pinned" | "" => Self::Pinned,
            "locality" | "locality_aware" => Self::LocalityAware,
            other => {
                warn!(strategy = %other, "Unknown group strategy, using pinned");
                Self::Pinned
            }
        }
    }

    /// Choose a replica group, or `None` if the choice is missing or excluded.
    pub fn select_group(
        &self,
        topology: &Topology,
        class: &Classification,
        exclusions: &ExclusionSet,
    ) -> Option<Arc<ReplicaGroup>> {
        let group = match self {
            Self::Pinned => topology.active_group(),
            Self::LocalityAware if !class.pins_primary() => {
                let region = topology.region();
                topology
                    .groups()
                    .iter()
                    .find(|g| g.region() == region)
                    .cloned()
                    .or_else(|| topology.active_group())
            }
            Self::LocalityAware => topology.active_group(),
        }?;

        if exclusions.is_group_excluded(group.name()) {
            debug!(group = %group.name(), "Selected group is excluded");
            return None;
        }
        Some(group)
    }
}

/// Choose an endpoint inside `group`.
pub fn select_endpoint(
    group: &ReplicaGroup,
    class: &Classification,
    exclusions: &ExclusionSet,
) -> Arc<Endpoint> {
    let replicas = group.replicas();
    if class.pins_primary() || replicas.is_empty() {
        return group.primary().clone();
    }

    for _ in 0..replicas.len() {
        match group.policy().select_one(class.correlation_id, replicas) {
            Some(candidate) if !exclusions.is_endpoint_excluded(candidate.name()) => {
                return candidate.clone();
            }
            _ => continue,
        }
    }

    debug!(group = %group.name(), "All replicas excluded, reading from primary");
    group.primary().clone()
}

/// The result of one routing decision.
#[derive(Debug, Clone)]
pub struct Route {
    pub group: Arc<ReplicaGroup>,
    pub endpoint: Arc<Endpoint>,
}

/// Group-level then node-level selection.
pub fn route(
    strategy: GroupStrategy,
    topology: &Topology,
    class: &Classification,
    exclusions: &ExclusionSet,
) -> Option<Route> {
    let group = strategy.select_group(topology, class, exclusions)?;
    let endpoint = select_endpoint(&group, class, exclusions);
    Some(Route { group, endpoint })
}
