//! JSON bodies shared by the controller API and its client.

use fleet_state::{
    HealthStatus, ProcessStatus, ReplicaId, ReplicaInfo, ReplicaStatus, ServiceRecord,
    UpdateMode, VersionNumber, VersionRecord,
};
use serde::{Deserialize, Serialize};

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default = "none", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn none<T>() -> Option<T> {
    None
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Periodic report from the load balancer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LbSyncRequest {
    /// Epoch seconds of every request received since the last sync.
    #[serde(default)]
    pub request_timestamps: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadyReplicas {
    pub ready_replica_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateServiceRequest {
    /// Task file contents (TOML).
    pub task: String,
    #[serde(default)]
    pub mode: UpdateMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateServiceResponse {
    pub version: VersionNumber,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TerminateReplicaRequest {
    pub replica_id: ReplicaId,
}

/// One replica as shown by `fleetd status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSummary {
    pub replica_id: ReplicaId,
    pub version: VersionNumber,
    pub cluster_name: String,
    pub endpoint: Option<String>,
    pub status: ReplicaStatus,
    pub launch_status: ProcessStatus,
    pub teardown_status: Option<ProcessStatus>,
    pub health: HealthStatus,
    pub created_at: u64,
}

impl From<&ReplicaInfo> for ReplicaSummary {
    fn from(info: &ReplicaInfo) -> Self {
        Self {
            replica_id: info.replica_id,
            version: info.version,
            cluster_name: info.cluster_name.clone(),
            endpoint: info.endpoint.clone(),
            status: info.status(),
            launch_status: info.launch_status,
            teardown_status: info.teardown_status,
            health: info.health,
            created_at: info.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: VersionNumber,
    pub update_mode: UpdateMode,
    pub policy: String,
    pub created_at: u64,
}

impl From<&VersionRecord> for VersionSummary {
    fn from(record: &VersionRecord) -> Self {
        Self {
            version: record.version,
            update_mode: record.update_mode,
            policy: record.task.service.replica_policy.describe(),
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub service: ServiceRecord,
    pub versions: Vec<VersionSummary>,
    pub replicas: Vec<ReplicaSummary>,
    pub target_replicas: u32,
    pub qps: f64,
}
