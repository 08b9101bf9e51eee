//! # Replica Router
//!
//! A resilience and topology-routing layer in front of replicated SQL and
//! key-value backends.
//!
//! ## Architecture
//!
//! Every call is routed to one physical endpoint, retried there, excluded on
//! exhaustion and re-routed. Successful writes are mirrored asynchronously to
//! a secondary target:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionEngine                        │
//! │  • Classification: read / write / transaction              │
//! │  • Retry N times per endpoint, then exclude for cooldown   │
//! │  • Cancellation observed on every attempt and delay        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (GroupStrategy → node selection)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Topology                             │
//! │  • Named replica groups, one active                        │
//! │  • Writes → primary, reads → load-balanced replicas        │
//! │  • Active switch via watch channel                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (successful writes only)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ReplicationPipeline                       │
//! │  • Bounded queue, never blocks the caller                  │
//! │  • Optional log segments, replayed on startup              │
//! │  • Failures logged, never surfaced                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica_router::{Classification, Operation, RedisBackend, ReplicaRouter, RouterConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: RouterConfig = serde_json::from_str(r#"{
//!         "active_group": "g0",
//!         "groups": [
//!             { "name": "g0",
//!               "primary":  { "name": "g0-p",  "descriptor": "redis://10.0.0.1:6379" },
//!               "replicas": [ { "name": "g0-r1", "descriptor": "redis://10.0.0.2:6379" } ] }
//!         ],
//!         "replication": { "secondary": { "name": "dr", "descriptor": "redis://10.1.0.1:6379" } }
//!     }"#).unwrap();
//!
//!     let router = ReplicaRouter::new(config, Arc::new(RedisBackend::new()), None).unwrap();
//!     router.start().await;
//!
//!     let id = router.next_correlation_id();
//!     router
//!         .execute(&Operation::new("SET", vec![json!("k"), json!("v")]), &Classification::write(id))
//!         .await
//!         .unwrap();
//!
//!     router.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`ReplicaRouter`] and its lifecycle
//! - [`executor`]: Retry, exclusion and re-routing on the primary path
//! - [`topology`]: Replica groups and the active pointer
//! - [`routing`]: Group strategy, node selection, exclusion set
//! - [`balance`]: Random and round-robin-with-affinity policies
//! - [`replication`]: Double-write pipeline and durable log segments
//! - [`backend`]: Redis, SQL and in-memory backends
//! - [`resilience`]: Retry policies

pub mod backend;
pub mod balance;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod operation;
pub mod replication;
pub mod resilience;
pub mod routing;
pub mod topology;

pub use backend::{Backend, BackendError, InMemoryBackend, RedisBackend, SqlBackend};
pub use balance::LoadBalancePolicy;
pub use config::{DurabilityConfig, EndpointConfig, GroupConfig, ReplicationConfig, RouterConfig};
pub use coordinator::{HealthCheck, ReplicaRouter, RouterState};
pub use error::{Result, RouterError};
pub use executor::{EngineSettings, ExecutionEngine};
pub use operation::{Access, Classification, Dialect, Operation};
pub use replication::wal::{LogSegmentStore, ReplayReport, SegmentName, SegmentReplayer};
pub use replication::{PipelineStatsSnapshot, ReplicationJob, ReplicationPipeline};
pub use resilience::retry::RetryConfig;
pub use routing::{ExclusionSet, GroupStrategy};
pub use topology::{Endpoint, ReplicaGroup, Topology};
pub use crate::metrics::LatencyTimer;
