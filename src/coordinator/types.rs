//! Public types for the replica router coordinator.

/// Router lifecycle state.
///
/// Use [`super::ReplicaRouter::state()`] to check current state or
/// [`super::ReplicaRouter::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// Just created, not yet started
    Created,
    /// Replaying unfinished log segments to the secondary target
    Replaying,
    /// Ready to route
    Ready,
    /// Run loop is consuming active-switch signals
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Replaying => write!(f, "Replaying"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Point-in-time health snapshot. Cheap: no backend I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: RouterState,
    pub ready: bool,
    pub active_group: String,
    /// False when the active name matches no configured group
    pub active_group_known: bool,
    pub region: String,
    pub switch_count: u64,
    /// Endpoints currently out of routing
    pub excluded_endpoints: Vec<String>,
    pub replication_enabled: bool,
    pub replication_pending: usize,
    pub durable: bool,
    pub open_segments: usize,
    /// Ready, active group known, and its primary is not excluded
    pub healthy: bool,
}
