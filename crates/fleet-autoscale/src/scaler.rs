//! Autoscaler — request-rate driven replica targets.
//!
//! A [`ScalingPolicy`] proposes a replica count from observed load. The
//! [`Autoscaler`] owns the request window and the current target, and only
//! reports a [`ScaleDecision`] when the target actually moves.

use fleet_core::ReplicaPolicy;
use fleet_core::constants::QPS_WINDOW_SECS;
use tracing::{debug, info};

use crate::window::RequestWindow;

/// A scaling decision for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified replica count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

/// Decides how many replicas a service should run.
pub trait ScalingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Target replica count given the current load and target.
    fn desired_replicas(&mut self, qps: f64, current_target: u32, now: f64) -> u32;
}

/// Always the same count.
#[derive(Debug, Clone)]
pub struct FixedReplicas {
    count: u32,
}

impl FixedReplicas {
    pub fn new(count: u32) -> Self {
        Self { count }
    }
}

impl ScalingPolicy for FixedReplicas {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn desired_replicas(&mut self, _qps: f64, _current_target: u32, _now: f64) -> u32 {
        self.count
    }
}

/// Scales on queries per second per replica.
///
/// A proposal different from the current target must hold for the
/// upscale (or downscale) delay before it is adopted, so short bursts and
/// lulls do not cause churn.
#[derive(Debug, Clone)]
pub struct RequestRate {
    min: u32,
    max: u32,
    target_qps_per_replica: f64,
    upscale_delay_secs: f64,
    downscale_delay_secs: f64,
    /// When the current upscale proposal first appeared.
    upscale_since: Option<f64>,
    /// When the current downscale proposal first appeared.
    downscale_since: Option<f64>,
}

impl RequestRate {
    pub fn new(policy: &ReplicaPolicy, target_qps_per_replica: f64) -> Self {
        Self {
            min: policy.min_replicas,
            max: policy.max(),
            target_qps_per_replica,
            upscale_delay_secs: policy.upscale_delay_seconds as f64,
            downscale_delay_secs: policy.downscale_delay_seconds as f64,
            upscale_since: None,
            downscale_since: None,
        }
    }

    /// Replica count that would serve `qps` at the per-replica target.
    pub fn proposal(&self, qps: f64) -> u32 {
        let raw = (qps / self.target_qps_per_replica).ceil();
        // Saturating float-to-int cast; NaN maps to 0.
        (raw as u32).clamp(self.min, self.max)
    }
}

impl ScalingPolicy for RequestRate {
    fn name(&self) -> &'static str {
        "request_rate"
    }

    fn desired_replicas(&mut self, qps: f64, current_target: u32, now: f64) -> u32 {
        let proposal = self.proposal(qps);

        if proposal > current_target {
            self.downscale_since = None;
            let since = *self.upscale_since.get_or_insert(now);
            if now - since >= self.upscale_delay_secs {
                self.upscale_since = None;
                return proposal;
            }
            debug!(proposal, current_target, waited = now - since, "upscale pending");
        } else if proposal < current_target {
            self.upscale_since = None;
            let since = *self.downscale_since.get_or_insert(now);
            if now - since >= self.downscale_delay_secs {
                self.downscale_since = None;
                return proposal;
            }
            debug!(proposal, current_target, waited = now - since, "downscale pending");
        } else {
            self.upscale_since = None;
            self.downscale_since = None;
        }

        current_target
    }
}

/// Per-service autoscaler state.
pub struct Autoscaler {
    policy: Box<dyn ScalingPolicy>,
    window: RequestWindow,
    min: u32,
    max: u32,
    target: u32,
}

impl Autoscaler {
    /// Build the autoscaler for a replica policy. Starts at `min_replicas`.
    pub fn new(policy: &ReplicaPolicy) -> Self {
        Self {
            policy: policy_for(policy),
            window: RequestWindow::new(QPS_WINDOW_SECS),
            min: policy.min_replicas,
            max: policy.max(),
            target: policy.min_replicas,
        }
    }

    /// Switch to a new version's policy. Request history is kept and the
    /// current target is clamped into the new bounds.
    pub fn update_policy(&mut self, policy: &ReplicaPolicy) {
        self.policy = policy_for(policy);
        self.min = policy.min_replicas;
        self.max = policy.max();
        self.target = self.target.clamp(self.min, self.max);
        info!(
            policy = self.policy.name(),
            target = self.target,
            "autoscaling policy updated"
        );
    }

    /// Adopt the replica count a previous controller left running, so a
    /// restart does not snap the target back to `min_replicas`.
    pub fn resume_at(&mut self, replicas: u32) {
        self.target = replicas.clamp(self.min, self.max);
    }

    /// Feed request timestamps reported by the load balancer.
    pub fn record_requests(&mut self, timestamps: &[f64]) {
        self.window.record(timestamps);
    }

    pub fn qps(&mut self, now: f64) -> f64 {
        self.window.qps(now)
    }

    /// Current target replica count.
    pub fn target(&self) -> u32 {
        self.target
    }

    /// Re-evaluate the target at time `now`.
    pub fn evaluate(&mut self, now: f64) -> ScaleDecision {
        let qps = self.window.qps(now);
        let desired = self
            .policy
            .desired_replicas(qps, self.target, now)
            .clamp(self.min, self.max);

        if desired == self.target {
            return ScaleDecision::NoChange;
        }

        info!(
            policy = self.policy.name(),
            from = self.target,
            to = desired,
            qps,
            "autoscaler target changed"
        );
        self.target = desired;
        ScaleDecision::ScaleTo(desired)
    }
}

fn policy_for(policy: &ReplicaPolicy) -> Box<dyn ScalingPolicy> {
    match policy.target_qps_per_replica {
        Some(target) if policy.is_autoscaling() => Box::new(RequestRate::new(policy, target)),
        _ => Box::new(FixedReplicas::new(policy.min_replicas)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn autoscaling(min: u32, max: u32, target: f64, up: u64, down: u64) -> ReplicaPolicy {
        ReplicaPolicy {
            min_replicas: min,
            max_replicas: Some(max),
            target_qps_per_replica: Some(target),
            upscale_delay_seconds: up,
            downscale_delay_seconds: down,
        }
    }

    /// `count` requests spread over the 60s before `now`.
    fn burst(now: f64, count: usize) -> Vec<f64> {
        (0..count)
            .map(|i| now - 59.0 + (i as f64 * 59.0 / count as f64))
            .collect()
    }

    #[test]
    fn fixed_policy_never_moves() {
        let mut scaler = Autoscaler::new(&ReplicaPolicy {
            min_replicas: 2,
            ..ReplicaPolicy::default()
        });
        scaler.record_requests(&burst(1000.0, 6000));
        assert_eq!(scaler.target(), 2);
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::NoChange);
    }

    #[test]
    fn scale_up_without_delay() {
        let mut scaler = Autoscaler::new(&autoscaling(1, 10, 1.0, 0, 0));
        // 180 requests / 60s = 3 qps → 3 replicas.
        scaler.record_requests(&burst(1000.0, 180));
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::ScaleTo(3));
        assert_eq!(scaler.target(), 3);
    }

    #[test]
    fn respects_max_replicas() {
        let mut scaler = Autoscaler::new(&autoscaling(1, 5, 1.0, 0, 0));
        scaler.record_requests(&burst(1000.0, 6000));
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::ScaleTo(5));
    }

    #[test]
    fn idle_service_scales_to_min() {
        let mut scaler = Autoscaler::new(&autoscaling(0, 4, 1.0, 0, 0));
        assert_eq!(scaler.target(), 0);
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::NoChange);

        scaler.record_requests(&[999.0]);
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::ScaleTo(1));

        // The request ages out of the window.
        assert_eq!(scaler.evaluate(1100.0), ScaleDecision::ScaleTo(0));
    }

    #[test]
    fn upscale_waits_for_delay() {
        let mut scaler = Autoscaler::new(&autoscaling(1, 10, 1.0, 300, 0));
        scaler.record_requests(&burst(1000.0, 120));
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::NoChange);

        scaler.record_requests(&burst(1200.0, 120));
        assert_eq!(scaler.evaluate(1200.0), ScaleDecision::NoChange);

        scaler.record_requests(&burst(1300.0, 120));
        assert_eq!(scaler.evaluate(1300.0), ScaleDecision::ScaleTo(2));
    }

    #[test]
    fn lull_resets_pending_upscale() {
        let mut scaler = Autoscaler::new(&autoscaling(1, 10, 1.0, 100, 0));
        scaler.record_requests(&burst(1000.0, 120));
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::NoChange);

        // Traffic drops back: the pending proposal is forgotten.
        assert_eq!(scaler.evaluate(1070.0), ScaleDecision::NoChange);

        scaler.record_requests(&burst(1080.0, 120));
        assert_eq!(scaler.evaluate(1080.0), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(1100.0), ScaleDecision::NoChange);
    }

    #[test]
    fn downscale_waits_for_delay() {
        let mut scaler = Autoscaler::new(&autoscaling(1, 10, 1.0, 0, 600));
        scaler.record_requests(&burst(1000.0, 240));
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::ScaleTo(4));

        // Quiet from here on.
        assert_eq!(scaler.evaluate(1100.0), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(1500.0), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(1700.0), ScaleDecision::ScaleTo(1));
    }

    #[test]
    fn resume_keeps_running_replicas() {
        let mut scaler = Autoscaler::new(&autoscaling(1, 5, 1.0, 0, 600));
        scaler.resume_at(4);
        assert_eq!(scaler.target(), 4);
        // No traffic yet, but the downscale delay still applies.
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::NoChange);

        scaler.resume_at(9);
        assert_eq!(scaler.target(), 5);
    }

    #[test]
    fn policy_update_clamps_target() {
        let mut scaler = Autoscaler::new(&autoscaling(1, 10, 1.0, 0, 0));
        scaler.record_requests(&burst(1000.0, 480));
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::ScaleTo(8));

        scaler.update_policy(&autoscaling(1, 3, 1.0, 0, 0));
        assert_eq!(scaler.target(), 3);

        scaler.update_policy(&ReplicaPolicy {
            min_replicas: 2,
            ..ReplicaPolicy::default()
        });
        assert_eq!(scaler.target(), 2);
        assert_eq!(scaler.evaluate(1000.0), ScaleDecision::NoChange);
    }
}
