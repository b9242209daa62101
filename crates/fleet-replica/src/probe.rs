//! Readiness probes.
//!
//! A probe is a plain HTTP GET against `<endpoint><readiness_path>`. Probe
//! outcomes fold into the replica row so the verdict survives controller
//! restarts.

use std::time::Duration;

use fleet_state::{HealthStatus, ReplicaInfo};
use tracing::{debug, warn};

/// Result of a single readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The readiness endpoint returned 2xx.
    Healthy,
    /// The readiness endpoint returned non-2xx.
    Unhealthy,
    /// Connection error or timeout.
    Failed,
}

/// Perform an HTTP readiness probe against `address` (`host:port`).
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "readiness probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "readiness probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "fleet-probe/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "invalid readiness probe request");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "readiness probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "readiness probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "readiness probe timed out");
        ProbeResult::Failed
    })
}

/// Fold one probe result into a replica row.
///
/// Returns `true` when the replica should be replaced: it was ready once and
/// has now failed `threshold` probes in a row, or it has never been ready
/// and `initial_delay_secs` have passed since launch.
pub fn record_probe(
    info: &mut ReplicaInfo,
    result: ProbeResult,
    threshold: u32,
    initial_delay_secs: u64,
    now: u64,
) -> bool {
    if result == ProbeResult::Healthy {
        if info.health != HealthStatus::Healthy {
            debug!(replica_id = info.replica_id, "replica ready");
        }
        info.consecutive_probe_failures = 0;
        info.health = HealthStatus::Healthy;
        info.first_ready_at.get_or_insert(now);
        return false;
    }

    info.consecutive_probe_failures += 1;

    if info.first_ready_at.is_some() {
        if info.consecutive_probe_failures >= threshold {
            warn!(
                replica_id = info.replica_id,
                failures = info.consecutive_probe_failures,
                threshold,
                "replica marked unhealthy"
            );
            info.health = HealthStatus::Unhealthy;
            return true;
        }
        return false;
    }

    let launched_at = info.launched_at.unwrap_or(info.created_at);
    if now.saturating_sub(launched_at) > initial_delay_secs {
        warn!(
            replica_id = info.replica_id,
            initial_delay_secs, "replica never became ready"
        );
        info.health = HealthStatus::Unhealthy;
        return true;
    }
    false
}
