//! The relay itself.
//!
//! `LoadBalancer` accepts HTTP/1 connections (optionally over TLS), one
//! tokio task per connection, and forwards every request to a ready
//! replica picked by the service's policy. The ready set is fetched from
//! the controller for every request; the last answer is kept for when the
//! controller cannot be reached.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fleet_controller::ControllerClient;
use fleet_core::constants::{DEFAULT_LB_MAX_BODY_BYTES, LB_MAX_ATTEMPTS, QPS_WINDOW_SECS};
use http::request::Parts;
use http::{HeaderValue, StatusCode, header};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::{LbError, LbResult};
use crate::policy::LoadBalancingPolicy;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for asking the controller for the ready set on each request.
const ENDPOINTS_TIMEOUT: Duration = Duration::from_secs(2);

/// Headers that describe one connection rather than the message.
const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
];

pub struct LoadBalancer {
    service_name: String,
    policy: Arc<dyn LoadBalancingPolicy>,
    /// Source of the ready set. Without one, the policy's set is used as is.
    controller: Option<ControllerClient>,
    max_body_bytes: usize,
    /// Arrival times of requests not yet delivered to the controller,
    /// never older than the QPS window.
    request_timestamps: Mutex<Vec<f64>>,
}

impl LoadBalancer {
    pub fn new(service_name: impl Into<String>, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        Self {
            service_name: service_name.into(),
            policy,
            controller: None,
            max_body_bytes: DEFAULT_LB_MAX_BODY_BYTES,
            request_timestamps: Mutex::new(Vec::new()),
        }
    }

    /// Ask `controller` for the ready set before routing each request.
    pub fn with_controller(mut self, controller: ControllerClient) -> Self {
        self.controller = Some(controller.with_timeout(ENDPOINTS_TIMEOUT));
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn policy(&self) -> &Arc<dyn LoadBalancingPolicy> {
        &self.policy
    }

    /// Drain the timestamps recorded since the last call.
    pub fn take_request_timestamps(&self) -> Vec<f64> {
        std::mem::take(&mut *self.lock_timestamps())
    }

    /// Put back timestamps a failed sync could not deliver. Those that
    /// have left the QPS window are dropped.
    pub fn restore_request_timestamps(&self, mut timestamps: Vec<f64>) {
        let mut current = self.lock_timestamps();
        timestamps.append(&mut current);
        *current = timestamps;
        trim_window(&mut current, now_secs());
    }

    fn record_request(&self) {
        let now = now_secs();
        let mut current = self.lock_timestamps();
        trim_window(&mut current, now);
        current.push(now);
    }

    /// Replace the policy's ready set with the controller's current one.
    /// When the controller does not answer, the last known set stays.
    async fn refresh_ready_replicas(&self) {
        let Some(controller) = &self.controller else {
            return;
        };
        match controller.endpoints().await {
            Ok(urls) => self.policy.set_ready_replicas(urls),
            Err(e) => {
                debug!(service = %self.service_name, error = %e, "using last known replicas")
            }
        }
    }

    fn lock_timestamps(&self) -> std::sync::MutexGuard<'_, Vec<f64>> {
        self.request_timestamps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Relay one request.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        self.record_request();

        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                debug!(service = %self.service_name, limit = self.max_body_bytes, "request body too large");
                return plain(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
            }
            Err(e) => {
                debug!(error = %e, "failed to read request body");
                return plain(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        self.refresh_ready_replicas().await;

        let mut tried: Vec<String> = Vec::new();
        for attempt in 1..=LB_MAX_ATTEMPTS {
            let Some(target) = self.policy.select(&tried) else {
                break;
            };

            self.policy.request_started(&target);
            let result = forward(&target, &parts, body.clone()).await;
            self.policy.request_finished(&target);

            match result {
                Ok(resp) => return resp,
                Err(e) => {
                    warn!(
                        service = %self.service_name,
                        %target,
                        attempt,
                        error = %e,
                        "forward failed"
                    );
                    tried.push(target);
                }
            }
        }

        if tried.is_empty() {
            debug!(service = %self.service_name, "no ready replicas");
            return plain(
                StatusCode::SERVICE_UNAVAILABLE,
                "No ready replicas. Use `fleetd status` to check the service.",
            );
        }
        plain(StatusCode::BAD_GATEWAY, "All replicas failed to respond")
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> LbResult<()> {
        let addr = listener.local_addr()?;
        info!(
            service = %self.service_name,
            %addr,
            policy = self.policy.name(),
            tls = tls.is_some(),
            "load balancer listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let lb = Arc::clone(&self);
                    let tls = tls.clone();

                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => lb.serve_connection(stream).await,
                                Err(e) => {
                                    debug!(%peer_addr, error = %e, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => lb.serve_connection(stream).await,
                        };
                        if let Err(e) = result {
                            debug!(%peer_addr, error = %e, "connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!(service = %self.service_name, "load balancer shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<(), hyper::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let svc = service_fn(move |req: Request<Incoming>| {
            let lb = Arc::clone(&self);
            async move { Ok::<_, hyper::Error>(lb.handle(req).await) }
        });
        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), svc)
            .await
    }
}

/// Serve traffic for one service and keep its replica set in sync with
/// `controller`.
pub async fn serve(
    lb: Arc<LoadBalancer>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    controller: ControllerClient,
    sync_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> LbResult<()> {
    let sync = tokio::spawn(crate::sync::run_sync(
        Arc::clone(&lb),
        controller,
        sync_interval,
        shutdown.clone(),
    ));

    let served = lb.serve(listener, tls, shutdown).await;
    if let Err(e) = sync.await {
        error!(error = %e, "controller sync task panicked");
    }
    served
}

/// Send one buffered request to `target` (`http://host:port`).
async fn forward(target: &str, parts: &Parts, body: Bytes) -> LbResult<Response<Full<Bytes>>> {
    let fail = |reason: String| LbError::Forward {
        target: target.to_string(),
        reason,
    };

    let address = target
        .strip_prefix("http://")
        .unwrap_or(target)
        .trim_end_matches('/');

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(address))
        .await
        .map_err(|_| fail("connect timed out".to_string()))?
        .map_err(|e| fail(e.to_string()))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| fail(e.to_string()))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut req = Request::builder()
        .method(parts.method.clone())
        .uri(path)
        .body(Full::new(body))
        .map_err(|e| fail(e.to_string()))?;
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name.as_str()) && name != header::HOST && name != header::CONTENT_LENGTH {
            req.headers_mut().append(name.clone(), value.clone());
        }
    }
    let host = HeaderValue::from_str(address).map_err(|e| fail(e.to_string()))?;
    req.headers_mut().insert(header::HOST, host);

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| fail(e.to_string()))?;

    let (resp_parts, resp_body) = resp.into_parts();
    let bytes = resp_body
        .collect()
        .await
        .map_err(|e| fail(e.to_string()))?
        .to_bytes();

    let mut out = Response::new(Full::new(bytes));
    *out.status_mut() = resp_parts.status;
    for (name, value) in &resp_parts.headers {
        if !is_hop_by_hop(name.as_str()) && name != header::CONTENT_LENGTH {
            out.headers_mut().append(name.clone(), value.clone());
        }
    }
    Ok(out)
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

fn plain(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Drop timestamps older than the QPS window ending at `now`.
fn trim_window(timestamps: &mut Vec<f64>, now: f64) {
    let oldest = now - QPS_WINDOW_SECS as f64;
    timestamps.retain(|&t| t >= oldest);
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
