//! Periodic exchange with the controller.

use std::sync::Arc;
use std::time::Duration;

use fleet_controller::ControllerClient;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::proxy::LoadBalancer;

/// Ship request timestamps to the controller and adopt the ready replica
/// set it answers with. Runs once immediately, then every `interval`.
///
/// When the controller is unreachable the last known replica set stays
/// in use and the timestamps are kept for the next attempt.
pub async fn run_sync(
    lb: Arc<LoadBalancer>,
    client: ControllerClient,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        service = %lb.service_name(),
        controller = %client.address(),
        interval_ms = interval.as_millis() as u64,
        "controller sync started"
    );

    loop {
        sync_once(&lb, &client).await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                debug!(service = %lb.service_name(), "controller sync stopped");
                break;
            }
        }
    }
}

/// One sync round. Returns whether the controller answered.
pub async fn sync_once(lb: &LoadBalancer, client: &ControllerClient) -> bool {
    let timestamps = lb.take_request_timestamps();
    match client.load_balancer_sync(timestamps.clone()).await {
        Ok(urls) => {
            lb.policy().set_ready_replicas(urls);
            true
        }
        Err(e) => {
            warn!(service = %lb.service_name(), error = %e, "controller sync failed");
            lb.restore_request_timestamps(timestamps);
            false
        }
    }
}
