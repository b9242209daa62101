//! Rollout planner — decides launches and terminations for one tick.
//!
//! The planner is a pure function of the replica rows, the latest version,
//! and the autoscaler's target. Replicas already being torn down or whose
//! launch failed are not counted.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use fleet_state::{ReplicaId, ReplicaInfo, VersionNumber};
use tracing::debug;

use crate::strategy::RolloutStrategy;

/// Where the service stands relative to its latest version.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RolloutPhase {
    /// Every live replica runs the latest version.
    Steady,
    /// Old replicas are being replaced as new ones become ready.
    Rolling { ready: u32, target: u32 },
    /// The new set is warming up behind the old one.
    BlueGreenWarming { ready: u32, target: u32 },
}

impl RolloutPhase {
    pub fn is_updating(&self) -> bool {
        !matches!(self, Self::Steady)
    }
}

/// What the controller should do this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutPlan {
    /// Number of latest-version replicas to launch.
    pub launch: u32,
    /// Replicas to terminate, in order.
    pub terminate: Vec<ReplicaId>,
    /// Versions whose ready replicas may receive traffic, ascending.
    pub serving_versions: Vec<VersionNumber>,
    pub phase: RolloutPhase,
}

/// Plan one tick.
///
/// Old-version replicas are only retired once enough latest-version
/// replicas are ready to take their place: the number of old replicas kept
/// is `max(0, target - new_ready)`.
pub fn plan(
    strategy: &RolloutStrategy,
    latest: VersionNumber,
    target: u32,
    replicas: &[ReplicaInfo],
) -> RolloutPlan {
    let alive: Vec<&ReplicaInfo> = replicas.iter().filter(|r| r.is_alive()).collect();
    let (new, old): (Vec<&ReplicaInfo>, Vec<&ReplicaInfo>) =
        alive.iter().copied().partition(|r| r.version >= latest);

    let new_alive = new.len() as u32;
    let new_ready = new.iter().filter(|r| r.is_routable()).count() as u32;

    let mut terminate = Vec::new();

    // Latest version above target: ordinary scale-down.
    if new_alive > target {
        terminate.extend(select_for_scale_down(&new, (new_alive - target) as usize));
    }

    if old.is_empty() {
        let launch = target.saturating_sub(new_alive);
        return RolloutPlan {
            launch,
            terminate,
            serving_versions: vec![latest],
            phase: RolloutPhase::Steady,
        };
    }

    let (launch, retire, phase) = match strategy {
        RolloutStrategy::Rolling(cfg) => {
            let batch = cfg.batch_size.max(1);
            let ceiling = target.min(new_ready + batch);
            let launch = ceiling.saturating_sub(new_alive);
            let keep = target.saturating_sub(new_ready) as usize;
            let retire = old.len().saturating_sub(keep);
            (
                launch,
                retire,
                RolloutPhase::Rolling {
                    ready: new_ready,
                    target,
                },
            )
        }
        RolloutStrategy::BlueGreen => {
            let launch = target.saturating_sub(new_alive);
            let retire = if new_ready >= target { old.len() } else { 0 };
            (
                launch,
                retire,
                RolloutPhase::BlueGreenWarming {
                    ready: new_ready,
                    target,
                },
            )
        }
    };

    terminate.extend(select_for_scale_down(&old, retire));

    let serving_versions = match strategy {
        RolloutStrategy::BlueGreen if new_ready < target => {
            versions_of(&old).into_iter().collect()
        }
        RolloutStrategy::BlueGreen => vec![latest],
        RolloutStrategy::Rolling(_) => versions_of(&alive).into_iter().collect(),
    };

    debug!(
        latest,
        target,
        new_alive,
        new_ready,
        old = old.len(),
        launch,
        retire,
        "rollout planned"
    );

    RolloutPlan {
        launch,
        terminate,
        serving_versions,
        phase,
    }
}

/// Choose `count` replicas to terminate.
///
/// Preference order: replicas not serving traffic, then older versions,
/// then the newest replica id.
pub fn select_for_scale_down(candidates: &[&ReplicaInfo], count: usize) -> Vec<ReplicaId> {
    let mut ordered: Vec<&ReplicaInfo> = candidates.to_vec();
    ordered.sort_by_key(|r| (r.is_routable(), r.version, Reverse(r.replica_id)));
    ordered.iter().take(count).map(|r| r.replica_id).collect()
}

fn versions_of(replicas: &[&ReplicaInfo]) -> BTreeSet<VersionNumber> {
    replicas.iter().map(|r| r.version).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RollingConfig;
    use fleet_state::{HealthStatus, ProcessStatus};

    fn ready(id: ReplicaId, version: VersionNumber) -> ReplicaInfo {
        let mut info = ReplicaInfo::new("svc", id, version);
        info.launch_status = ProcessStatus::Succeeded;
        info.endpoint = Some(format!("10.0.0.{id}:8080"));
        info.health = HealthStatus::Healthy;
        info
    }

    fn launching(id: ReplicaId, version: VersionNumber) -> ReplicaInfo {
        ReplicaInfo::new("svc", id, version)
    }

    fn rolling() -> RolloutStrategy {
        RolloutStrategy::default()
    }

    #[test]
    fn steady_state_closes_gap() {
        let tick = plan(&rolling(), 1, 3, &[ready(1, 1)]);
        assert_eq!(tick.launch, 2);
        assert!(tick.terminate.is_empty());
        assert_eq!(tick.phase, RolloutPhase::Steady);
        assert_eq!(tick.serving_versions, vec![1]);
    }

    #[test]
    fn launching_replicas_count_towards_target() {
        let tick = plan(&rolling(), 1, 2, &[ready(1, 1), launching(2, 1)]);
        assert_eq!(tick.launch, 0);
    }

    #[test]
    fn failed_and_terminating_replicas_are_ignored() {
        let mut failed = launching(2, 1);
        failed.launch_status = ProcessStatus::Failed;
        let mut leaving = ready(3, 1);
        leaving.teardown_status = Some(ProcessStatus::Running);

        let tick = plan(&rolling(), 1, 2, &[ready(1, 1), failed, leaving]);
        assert_eq!(tick.launch, 1);
        assert!(tick.terminate.is_empty());
    }

    #[test]
    fn scale_down_prefers_unready_then_newest() {
        let replicas = [ready(1, 1), ready(2, 1), launching(3, 1), ready(4, 1)];
        let tick = plan(&rolling(), 1, 2, &replicas);
        assert_eq!(tick.terminate, vec![3, 4]);
    }

    #[test]
    fn rolling_update_starts_one_batch() {
        let replicas = [ready(1, 1), ready(2, 1)];
        let tick = plan(&rolling(), 2, 2, &replicas);
        assert_eq!(tick.launch, 1);
        assert!(tick.terminate.is_empty());
        assert_eq!(tick.serving_versions, vec![1]);
        assert!(tick.phase.is_updating());
    }

    #[test]
    fn rolling_update_never_retires_more_than_replaced() {
        // One new replica launching, not ready yet: keep both old.
        let replicas = [ready(1, 1), ready(2, 1), launching(3, 2)];
        let tick = plan(&rolling(), 2, 2, &replicas);
        assert_eq!(tick.launch, 0);
        assert!(tick.terminate.is_empty());

        // One new replica ready: exactly one old replica may go.
        let replicas = [ready(1, 1), ready(2, 1), ready(3, 2)];
        let tick = plan(&rolling(), 2, 2, &replicas);
        assert_eq!(tick.launch, 1);
        assert_eq!(tick.terminate, vec![2]);
        assert_eq!(tick.serving_versions, vec![1, 2]);
        assert_eq!(tick.phase, RolloutPhase::Rolling { ready: 1, target: 2 });
    }

    #[test]
    fn rolling_update_finishes() {
        let replicas = [ready(2, 1), ready(3, 2), ready(4, 2)];
        let tick = plan(&rolling(), 2, 2, &replicas);
        assert_eq!(tick.launch, 0);
        assert_eq!(tick.terminate, vec![2]);

        let tick = plan(&rolling(), 2, 2, &[ready(3, 2), ready(4, 2)]);
        assert_eq!(tick.phase, RolloutPhase::Steady);
        assert_eq!(tick.serving_versions, vec![2]);
    }

    #[test]
    fn wider_batches_launch_more_at_once() {
        let strategy = RolloutStrategy::Rolling(RollingConfig { batch_size: 2 });
        let replicas = [ready(1, 1), ready(2, 1), ready(3, 1)];
        let tick = plan(&strategy, 2, 3, &replicas);
        assert_eq!(tick.launch, 2);
    }

    #[test]
    fn unready_old_replicas_go_first() {
        let replicas = [ready(1, 1), launching(2, 1), ready(3, 2)];
        let tick = plan(&rolling(), 2, 2, &replicas);
        assert_eq!(tick.terminate, vec![2]);
    }

    #[test]
    fn blue_green_waits_for_full_set() {
        let strategy = RolloutStrategy::BlueGreen;
        let replicas = [ready(1, 1), ready(2, 1), ready(3, 2), launching(4, 2)];
        let tick = plan(&strategy, 2, 2, &replicas);
        assert_eq!(tick.launch, 0);
        assert!(tick.terminate.is_empty());
        assert_eq!(tick.serving_versions, vec![1]);
        assert_eq!(tick.phase, RolloutPhase::BlueGreenWarming { ready: 1, target: 2 });

        let replicas = [ready(1, 1), ready(2, 1), ready(3, 2), ready(4, 2)];
        let tick = plan(&strategy, 2, 2, &replicas);
        assert_eq!(tick.terminate, vec![2, 1]);
        assert_eq!(tick.serving_versions, vec![2]);
    }

    #[test]
    fn blue_green_launches_full_set() {
        let tick = plan(&RolloutStrategy::BlueGreen, 2, 3, &[ready(1, 1)]);
        assert_eq!(tick.launch, 3);
    }
}
