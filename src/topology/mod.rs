// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topology model: named replica groups and which one is active.
//!
//! The active pointer is the only thing that changes at runtime, through
//! [`Topology::set_active`]. A switch is not retroactive: a caller that has
//! already resolved a group keeps its `Arc<ReplicaGroup>` (and the endpoint
//! chosen from it) until its operation finishes.
//!
//! # Example
//!
//! ```
//! use replica_router::{Topology, RouterConfig};
//!
//! let config: RouterConfig = serde_json::from_str(r#"{
//!     "active_group": "blue",
//!     "groups": [
//!         { "name": "blue",  "primary": { "name": "blue-p",  "descriptor": "redis://blue" } },
//!         { "name": "green", "primary": { "name": "green-p", "descriptor": "redis://green" } }
//!     ]
//! }"#).unwrap();
//!
//! let topology = Topology::from_config(&config).unwrap();
//! assert_eq!(topology.active_name(), "blue");
//!
//! assert!(topology.set_active("green"));
//! assert!(!topology.set_active("green"));   // no-op
//! assert!(!topology.set_active("purple"));  // unknown, ignored
//! assert_eq!(topology.switch_count(), 1);
//! ```

mod endpoint;
mod group;

pub use endpoint::Endpoint;
pub use group::ReplicaGroup;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};

/// Process-wide replica group layout.
#[derive(Debug)]
pub struct Topology {
    /// Configuration order; locality routing takes the first match.
    groups: Vec<Arc<ReplicaGroup>>,
    active: RwLock<String>,
    region: RwLock<String>,
    switch_count: AtomicU64,
}

impl Topology {
    /// Build a topology. Group and endpoint names must be unique.
    ///
    /// An active name that matches no group is logged and kept: routing
    /// reports no backend until a valid switch arrives.
    pub fn new(groups: Vec<ReplicaGroup>, active: impl Into<String>, region: impl Into<String>) -> Result<Self> {
        let mut group_names = HashSet::new();
        let mut endpoint_names = HashSet::new();
        for group in &groups {
            if !group_names.insert(group.name().to_string()) {
                return Err(RouterError::Configuration(format!(
                    "duplicate replica group '{}'",
                    group.name()
                )));
            }
            for ep in group.endpoints() {
                if !endpoint_names.insert(ep.name().to_string()) {
                    return Err(RouterError::Configuration(format!(
                        "duplicate endpoint '{}' in group '{}'",
                        ep.name(),
                        group.name()
                    )));
                }
            }
        }

        let active = active.into();
        if !group_names.contains(&active) {
            warn!(active = %active, "Active group is not configured, routing will fail closed");
            crate::metrics::record_error("topology", "configure", "unknown_active");
        }

        Ok(Self {
            groups: groups.into_iter().map(Arc::new).collect(),
            active: RwLock::new(active),
            region: RwLock::new(region.into()),
            switch_count: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let groups = config
            .groups
            .iter()
            .map(|g| ReplicaGroup::from_config(g, config.affinity_capacity))
            .collect();
        Self::new(groups, config.active_group.clone(), config.region.clone())
    }

    /// Apply an active-switch signal.
    ///
    /// Returns `true` if the active group changed. Same name is a no-op; an
    /// unknown name is logged and ignored.
    pub fn set_active(&self, group_name: &str) -> bool {
        if self.resolve_group(group_name).is_none() {
            warn!(requested = %group_name, "Ignoring switch to unknown replica group");
            crate::metrics::record_error("topology", "set_active", "unknown_group");
            return false;
        }

        let mut active = self.active.write();
        if *active == group_name {
            return false;
        }
        let previous = std::mem::replace(&mut *active, group_name.to_string());
        drop(active);

        let switches = self.switch_count.fetch_add(1, Ordering::AcqRel) + 1;
        info!(from = %previous, to = %group_name, switches, "Active replica group switched");
        crate::metrics::record_active_switch(group_name);
        true
    }

    /// Entry point for the external configuration watcher.
    pub fn on_active_changed(&self, group_name: &str) -> bool {
        self.set_active(group_name)
    }

    pub fn resolve_group(&self, name: &str) -> Option<Arc<ReplicaGroup>> {
        self.groups.iter().find(|g| g.name() == name).cloned()
    }

    /// The currently active group, if the active name is valid.
    pub fn active_group(&self) -> Option<Arc<ReplicaGroup>> {
        let active = self.active.read();
        self.resolve_group(&active)
    }

    #[must_use]
    pub fn active_name(&self) -> String {
        self.active.read().clone()
    }

    #[must_use]
    pub fn region(&self) -> String {
        self.region.read().clone()
    }

    /// Move this process to another region. Only locality-aware routing cares.
    pub fn set_region(&self, region: impl Into<String>) {
        let region = region.into();
        let previous = std::mem::replace(&mut *self.region.write(), region.clone());
        if previous != region {
            info!(from = %previous, to = %region, "Local region changed");
        }
    }

    #[must_use]
    pub fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::Acquire)
    }

    pub fn groups(&self) -> &[Arc<ReplicaGroup>] {
        &self.groups
    }

    /// Find an endpoint anywhere in the topology.
    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.groups
            .iter()
            .flat_map(|g| g.endpoints())
            .find(|e| e.name() == name)
            .cloned()
    }
}
