//! Service status derivation.

use fleet_rollout::RolloutPhase;
use fleet_state::{ReplicaInfo, ServiceStatus};

/// The status a live service should report after a tick.
///
/// Statuses owned by the supervisor (`SHUTTING_DOWN` and the terminal
/// ones) are returned unchanged.
pub fn derive_status(
    current: ServiceStatus,
    phase: &RolloutPhase,
    target: u32,
    replicas: &[ReplicaInfo],
    launch_blocked: bool,
) -> ServiceStatus {
    if !current.is_live() {
        return current;
    }
    if launch_blocked {
        return ServiceStatus::Failed;
    }
    if phase.is_updating() {
        return ServiceStatus::Updating;
    }
    if replicas.iter().any(ReplicaInfo::is_routable) {
        ServiceStatus::Ready
    } else if target == 0 {
        ServiceStatus::NoReplica
    } else {
        ServiceStatus::ReplicaInit
    }
}
