//! Configuration for the replica router.
//!
//! # Example
//!
//! ```
//! use replica_router::RouterConfig;
//!
//! // Minimal config (uses defaults)
//! let config = RouterConfig::default();
//! assert_eq!(config.retry_times, 1);
//! assert_eq!(config.cooldown_ms, 60_000);
//!
//! // Topology from JSON
//! let config: RouterConfig = serde_json::from_str(r#"{
//!     "region": "az0",
//!     "active_group": "g0",
//!     "groups": [
//!         { "name": "g0", "region": "az0",
//!           "primary": { "name": "g0-p", "descriptor": "redis://10.0.0.1:6379" },
//!           "replicas": [ { "name": "g0-r1", "descriptor": "redis://10.0.0.2:6379" } ] }
//!     ]
//! }"#).unwrap();
//! assert_eq!(config.groups[0].replicas.len(), 1);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// One backend endpoint as configured.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
    /// Opaque connection string handed to the backend.
    pub descriptor: String,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

/// One replica group: a primary plus ordered replicas.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub region: String,
    /// `"random"` or `"round_robin"`; anything else falls back to round robin.
    #[serde(default)]
    pub load_balance: Option<String>,
    pub primary: EndpointConfig,
    #[serde(default)]
    pub replicas: Vec<EndpointConfig>,
}

/// Secondary-target mirroring settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    /// Where writes are mirrored. `None` disables replication.
    #[serde(default)]
    pub secondary: Option<EndpointConfig>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Attempts per job against the secondary target
    #[serde(default = "default_replication_retry_times")]
    pub retry_times: usize,
    #[serde(default = "default_replication_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// How long shutdown waits for the worker to drain the queue
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_queue_capacity() -> usize { 10_000 }
fn default_replication_retry_times() -> usize { 3 }
fn default_replication_retry_delay_ms() -> u64 { 100 }
fn default_attempt_timeout_ms() -> u64 { 3_000 }
fn default_drain_timeout_ms() -> u64 { 5_000 }

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            secondary: None,
            queue_capacity: default_queue_capacity(),
            retry_times: default_replication_retry_times(),
            retry_delay_ms: default_replication_retry_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ReplicationConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Write-ahead log segment settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DurabilityConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wal_dir")]
    pub dir: PathBuf,
    /// Flush the buffered writer after this many lines
    #[serde(default = "default_flush_lines")]
    pub flush_lines: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Segment age before rotation, also the idle-close threshold
    #[serde(default = "default_rotation_window_ms")]
    pub rotation_window_ms: u64,
    /// Hard cap on lines per segment
    #[serde(default = "default_max_lines")]
    pub max_lines: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_wal_dir() -> PathBuf { PathBuf::from("./replication_wal") }
fn default_flush_lines() -> u64 { 1024 }
fn default_flush_interval_ms() -> u64 { 10_000 }
fn default_rotation_window_ms() -> u64 { 60_000 }
fn default_max_lines() -> u64 { 1 << 20 }
fn default_sweep_interval_ms() -> u64 { 5_000 }

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_wal_dir(),
            flush_lines: default_flush_lines(),
            flush_interval_ms: default_flush_interval_ms(),
            rotation_window_ms: default_rotation_window_ms(),
            max_lines: default_max_lines(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl DurabilityConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn rotation_window(&self) -> Duration {
        Duration::from_millis(self.rotation_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Configuration for the router.
///
/// All tuning fields have defaults. At minimum, `groups` and `active_group`
/// must be supplied for routing to find anything.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Region of this process, used by locality-aware routing
    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub active_group: String,

    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// `"pinned"` or `"locality"`
    #[serde(default = "default_group_strategy")]
    pub group_strategy: String,

    /// Attempts against one endpoint before it is excluded
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,

    /// Fixed delay between attempts on the same endpoint
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How long an excluded endpoint stays out of routing
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Correlation ids remembered by round-robin affinity
    #[serde(default = "default_affinity_capacity")]
    pub affinity_capacity: usize,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub durability: DurabilityConfig,
}

fn default_group_strategy() -> String { "pinned".to_string() }
fn default_retry_times() -> u32 { 1 }
fn default_retry_delay_ms() -> u64 { 1_000 }
fn default_cooldown_ms() -> u64 { 60_000 }
fn default_affinity_capacity() -> usize { 10 }

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            active_group: String::new(),
            groups: Vec::new(),
            group_strategy: default_group_strategy(),
            retry_times: default_retry_times(),
            retry_delay_ms: default_retry_delay_ms(),
            cooldown_ms: default_cooldown_ms(),
            affinity_capacity: default_affinity_capacity(),
            replication: ReplicationConfig::default(),
            durability: DurabilityConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}
