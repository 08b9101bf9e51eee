// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use crate::balance::LoadBalancePolicy;
use crate::config::GroupConfig;

use super::Endpoint;

/// A primary plus its ordered replicas; the unit that can be made active.
///
/// Membership is fixed after construction. A configuration reload builds a
/// new group rather than editing this one.
#[derive(Debug)]
pub struct ReplicaGroup {
    name: String,
    region: String,
    primary: Arc<Endpoint>,
    replicas: Vec<Arc<Endpoint>>,
    policy: LoadBalancePolicy,
}

impl ReplicaGroup {
    pub fn new(
        name: impl Into<String>,
        region: impl Into<String>,
        primary: Endpoint,
        replicas: Vec<Endpoint>,
        policy: LoadBalancePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            primary: Arc::new(primary),
            replicas: replicas.into_iter().map(Arc::new).collect(),
            policy,
        }
    }

    pub fn from_config(config: &GroupConfig, affinity_capacity: usize) -> Self {
        Self::new(
            config.name.clone(),
            config.region.clone(),
            Endpoint::from_config(&config.primary),
            config.replicas.iter().map(Endpoint::from_config).collect(),
            LoadBalancePolicy::from_name(config.load_balance.as_deref(), affinity_capacity),
        )
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    #[must_use]
    pub fn primary(&self) -> &Arc<Endpoint> {
        &self.primary
    }

    #[must_use]
    pub fn replicas(&self) -> &[Arc<Endpoint>] {
        &self.replicas
    }

    #[must_use]
    pub fn policy(&self) -> &LoadBalancePolicy {
        &self.policy
    }

    /// Primary followed by replicas.
    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }
}
