//! Domain types for the Fleet state store.
//!
//! These types represent the persisted state of services, task versions,
//! and replicas. All types are serializable to/from JSON for storage in
//! redb tables.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use fleet_core::{LoadBalancingPolicyId, ServiceTask};
use serde::{Deserialize, Serialize};

/// Replica identifier, unique within a service and never reused.
pub type ReplicaId = u64;

/// Monotonically increasing task version number.
pub type VersionNumber = u64;

// ── Service ───────────────────────────────────────────────────────

/// One row per logical service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub name: String,
    /// Process id of the supervisor hosting the controller.
    pub controller_pid: u32,
    /// Autoscaling policy descriptor.
    pub policy: String,
    /// Requested-resources descriptor.
    pub requested_resources: String,
    pub load_balancing_policy: LoadBalancingPolicyId,
    pub tls_encrypted: bool,
    pub controller_port: Option<u16>,
    pub load_balancer_port: Option<u16>,
    pub status: ServiceStatus,
    /// Versions whose replicas currently serve traffic.
    pub active_versions: Vec<VersionNumber>,
    /// Next replica id to hand out.
    pub next_replica_id: ReplicaId,
    /// Launch failures since the last successful launch.
    pub consecutive_launch_failures: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ServiceRecord {
    /// A fresh row in `ControllerInit`.
    pub fn new(name: &str, task: &ServiceTask) -> Self {
        let now = epoch_secs();
        Self {
            name: name.to_string(),
            controller_pid: std::process::id(),
            policy: task.service.replica_policy.describe(),
            requested_resources: task.resources_descriptor(),
            load_balancing_policy: task.service.load_balancing_policy,
            tls_encrypted: task.service.tls.is_some(),
            controller_port: None,
            load_balancer_port: None,
            status: ServiceStatus::ControllerInit,
            active_versions: Vec::new(),
            next_replica_id: 1,
            consecutive_launch_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Service-level lifecycle.
///
/// ```text
/// CONTROLLER_INIT → REPLICA_INIT → READY ⇄ UPDATING → SHUTTING_DOWN → REMOVED
///                         NO_REPLICA / FAILED ↗
/// any → FAILED_CLEANUP
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Supervisor is starting the controller and load balancer.
    ControllerInit,
    /// Controller is up; no replica is ready yet.
    ReplicaInit,
    Ready,
    /// A new version is being rolled out.
    Updating,
    /// Scaled to zero replicas.
    NoReplica,
    /// Launch failures exceeded the configured bound.
    Failed,
    ShuttingDown,
    /// All resources reclaimed. The row is deleted right after.
    Removed,
    /// Teardown could not reclaim every resource; needs an operator.
    FailedCleanup,
}

impl ServiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed | Self::FailedCleanup)
    }

    /// Statuses the controller moves between while the service runs.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::ControllerInit
                | Self::ReplicaInit
                | Self::Ready
                | Self::Updating
                | Self::NoReplica
                | Self::Failed
        )
    }

    pub fn can_transition_to(&self, next: ServiceStatus) -> bool {
        if *self == next {
            return !self.is_terminal() || next == Self::FailedCleanup;
        }
        match next {
            Self::FailedCleanup => *self != Self::Removed,
            Self::ShuttingDown => self.is_live(),
            Self::Removed => *self == Self::ShuttingDown,
            _ => self.is_live(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControllerInit => "CONTROLLER_INIT",
            Self::ReplicaInit => "REPLICA_INIT",
            Self::Ready => "READY",
            Self::Updating => "UPDATING",
            Self::NoReplica => "NO_REPLICA",
            Self::Failed => "FAILED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Removed => "REMOVED",
            Self::FailedCleanup => "FAILED_CLEANUP",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Version ───────────────────────────────────────────────────────

/// How replicas move from an old version to a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Replace old replicas as new ones become ready.
    #[default]
    Rolling,
    /// Bring up a full new set, then switch traffic at once.
    BlueGreen,
}

/// One immutable task snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionRecord {
    pub service_name: String,
    pub version: VersionNumber,
    pub task: ServiceTask,
    /// Frozen task file on disk.
    pub task_path: PathBuf,
    pub update_mode: UpdateMode,
    pub created_at: u64,
}

impl VersionRecord {
    pub fn table_key(&self) -> String {
        version_key(&self.service_name, self.version)
    }
}

// ── Replica ───────────────────────────────────────────────────────

/// Progress of one provisioning or teardown operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    /// Requested, not started yet.
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Health as determined by readiness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Display status derived from the launch/teardown sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaStatus {
    Provisioning,
    /// Launched, waiting for the first successful probe.
    Starting,
    Ready,
    /// Was ready once, now failing probes.
    NotReady,
    ShuttingDown,
    FailedProvision,
    FailedCleanup,
}

/// One row per replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaInfo {
    pub service_name: String,
    pub replica_id: ReplicaId,
    pub version: VersionNumber,
    /// Backend cluster identifier.
    pub cluster_name: String,
    /// `host:port` the workload answers on, once launched.
    pub endpoint: Option<String>,
    pub launch_status: ProcessStatus,
    /// Absent until teardown is requested.
    pub teardown_status: Option<ProcessStatus>,
    pub health: HealthStatus,
    pub consecutive_probe_failures: u32,
    pub first_ready_at: Option<u64>,
    pub created_at: u64,
    pub launched_at: Option<u64>,
    pub updated_at: u64,
}

impl ReplicaInfo {
    /// A fresh row with launch `PENDING`.
    pub fn new(service_name: &str, replica_id: ReplicaId, version: VersionNumber) -> Self {
        let now = epoch_secs();
        Self {
            service_name: service_name.to_string(),
            replica_id,
            version,
            cluster_name: cluster_name(service_name, replica_id),
            endpoint: None,
            launch_status: ProcessStatus::Pending,
            teardown_status: None,
            health: HealthStatus::Unknown,
            consecutive_probe_failures: 0,
            first_ready_at: None,
            created_at: now,
            launched_at: None,
            updated_at: now,
        }
    }

    pub fn table_key(&self) -> String {
        replica_key(&self.service_name, self.replica_id)
    }

    /// Teardown has been requested, is running, or has finished.
    pub fn is_terminating(&self) -> bool {
        matches!(
            self.teardown_status,
            Some(ProcessStatus::Pending | ProcessStatus::Running | ProcessStatus::Succeeded)
        )
    }

    pub fn is_launching(&self) -> bool {
        matches!(
            self.launch_status,
            ProcessStatus::Pending | ProcessStatus::Running
        )
    }

    /// Whether the load balancer may send traffic here.
    pub fn is_routable(&self) -> bool {
        self.launch_status == ProcessStatus::Succeeded
            && !self.is_terminating()
            && self.teardown_status != Some(ProcessStatus::Failed)
            && self.health == HealthStatus::Healthy
            && self.endpoint.is_some()
    }

    /// Whether the replica counts towards the desired replica total.
    pub fn is_alive(&self) -> bool {
        self.teardown_status.is_none() && self.launch_status != ProcessStatus::Failed
    }

    pub fn url(&self) -> Option<String> {
        self.endpoint.as_ref().map(|ep| format!("http://{ep}"))
    }

    pub fn status(&self) -> ReplicaStatus {
        match self.teardown_status {
            Some(ProcessStatus::Failed) => return ReplicaStatus::FailedCleanup,
            Some(_) => return ReplicaStatus::ShuttingDown,
            None => {}
        }
        match self.launch_status {
            ProcessStatus::Pending | ProcessStatus::Running => ReplicaStatus::Provisioning,
            ProcessStatus::Failed => ReplicaStatus::FailedProvision,
            ProcessStatus::Succeeded => match self.health {
                HealthStatus::Healthy => ReplicaStatus::Ready,
                HealthStatus::Unhealthy if self.first_ready_at.is_some() => {
                    ReplicaStatus::NotReady
                }
                _ => ReplicaStatus::Starting,
            },
        }
    }
}

/// Backend cluster name for a replica.
pub fn cluster_name(service_name: &str, replica_id: ReplicaId) -> String {
    format!("{service_name}-{replica_id}")
}

/// Build the composite key for the versions table.
pub fn version_key(service_name: &str, version: VersionNumber) -> String {
    format!("{service_name}:{version:020}")
}

/// Build the composite key for the replicas table.
pub fn replica_key(service_name: &str, replica_id: ReplicaId) -> String {
    format!("{service_name}:{replica_id:020}")
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
