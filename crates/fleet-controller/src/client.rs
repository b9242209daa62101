//! Typed client for the controller API.
//!
//! Used by the load balancer's sync loop and by `fleetd status`/`update`.
//! Each call opens its own HTTP/1 connection; calls are infrequent and the
//! controller may have restarted in between.

use std::time::Duration;

use bytes::Bytes;
use fleet_state::{ReplicaId, UpdateMode, VersionNumber};
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ControllerError, ControllerResult};
use crate::protocol::{
    ApiResponse, LbSyncRequest, ReadyReplicas, StatusReport, TerminateReplicaRequest,
    UpdateServiceRequest, UpdateServiceResponse,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ControllerClient {
    /// `host:port` of the controller.
    address: String,
    timeout: Duration,
}

impl ControllerClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Report request timestamps and fetch the ready replica URLs.
    pub async fn load_balancer_sync(&self, request_timestamps: Vec<f64>) -> ControllerResult<Vec<String>> {
        let body = LbSyncRequest { request_timestamps };
        let ready: ReadyReplicas = self
            .send("POST", "/controller/load_balancer_sync", Some(&body))
            .await?;
        Ok(ready.ready_replica_urls)
    }

    pub async fn endpoints(&self) -> ControllerResult<Vec<String>> {
        let ready: ReadyReplicas = self.send::<(), _>("GET", "/controller/endpoints", None).await?;
        Ok(ready.ready_replica_urls)
    }

    pub async fn status(&self) -> ControllerResult<StatusReport> {
        self.send::<(), _>("GET", "/controller/status", None).await
    }

    pub async fn update_service(&self, task: String, mode: UpdateMode) -> ControllerResult<VersionNumber> {
        let body = UpdateServiceRequest { task, mode };
        let resp: UpdateServiceResponse = self
            .send("POST", "/controller/update_service", Some(&body))
            .await?;
        Ok(resp.version)
    }

    pub async fn terminate_replica(&self, replica_id: ReplicaId) -> ControllerResult<String> {
        let body = TerminateReplicaRequest { replica_id };
        self.send("POST", "/controller/terminate_replica", Some(&body))
            .await
    }

    async fn send<B, T>(&self, method: &str, path: &str, body: Option<&B>) -> ControllerResult<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let payload = match body {
            Some(body) => Bytes::from(
                serde_json::to_vec(body).map_err(|e| ControllerError::Http(e.to_string()))?,
            ),
            None => Bytes::new(),
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, self.exchange(method, path, payload))
            .await
            .map_err(|_| ControllerError::Http(format!("{method} {path} timed out")))??;

        let envelope: ApiResponse<T> = serde_json::from_slice(&bytes).map_err(|e| {
            ControllerError::Http(format!("invalid response from {path} ({status}): {e}"))
        })?;

        match envelope {
            ApiResponse {
                success: true,
                data: Some(data),
                ..
            } => Ok(data),
            ApiResponse { error, .. } => Err(ControllerError::Api {
                status: status.as_u16(),
                message: error.unwrap_or_else(|| "empty response".to_string()),
            }),
        }
    }

    async fn exchange(
        &self,
        method: &str,
        path: &str,
        payload: Bytes,
    ) -> ControllerResult<(http::StatusCode, Bytes)> {
        let stream = tokio::net::TcpStream::connect(self.address.as_str()).await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ControllerError::Http(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", &self.address)
            .header("content-type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| ControllerError::Http(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ControllerError::Http(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ControllerError::Http(e.to_string()))?
            .to_bytes();
        Ok((status, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleet_core::constants::INITIAL_VERSION;
    use fleet_core::{ServeConfig, ServiceTask};
    use fleet_replica::ReplicaManager;
    use fleet_replica::mock::MockProvisioner;
    use fleet_state::{ServiceRecord, StateStore, VersionRecord};

    use crate::controller::Controller;

    const TASK: &str = "[service]\nreplica_port = 7000\n";

    async fn spawn_controller(dir: &tempfile::TempDir) -> (Arc<Controller>, String) {
        let config = ServeConfig::with_state_dir(dir.path());
        let store = StateStore::open_in_memory().unwrap();
        let task = ServiceTask::from_toml_str(TASK).unwrap();
        store.add_service(&ServiceRecord::new("api", &task)).unwrap();
        store
            .add_version(&VersionRecord {
                service_name: "api".to_string(),
                version: INITIAL_VERSION,
                task,
                task_path: config.task_path("api", INITIAL_VERSION),
                update_mode: UpdateMode::Rolling,
                created_at: 0,
            })
            .unwrap();
        let replicas = ReplicaManager::new("api", store.clone(), Arc::new(MockProvisioner::new()));
        let controller = Arc::new(Controller::new("api", store, replicas, config).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let app = crate::api::build_router(Arc::clone(&controller));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (controller, addr)
    }

    #[tokio::test]
    async fn sync_and_status_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, addr) = spawn_controller(&dir).await;
        controller.tick().await.unwrap();
        controller.replica_manager().wait_idle().await;

        let client = ControllerClient::new(addr);
        let urls = client.load_balancer_sync(vec![1.0]).await.unwrap();
        assert_eq!(urls, vec!["http://api-1.mock:7000"]);
        assert_eq!(client.endpoints().await.unwrap(), urls);

        let report = client.status().await.unwrap();
        assert_eq!(report.service.name, "api");
        assert_eq!(report.replicas.len(), 1);
    }

    #[tokio::test]
    async fn update_and_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, addr) = spawn_controller(&dir).await;
        controller.tick().await.unwrap();
        controller.replica_manager().wait_idle().await;

        let client = ControllerClient::new(addr);
        let version = client
            .update_service(TASK.to_string(), UpdateMode::BlueGreen)
            .await
            .unwrap();
        assert_eq!(version, 2);

        let message = client.terminate_replica(1).await.unwrap();
        assert!(message.contains("terminating"));
    }

    #[tokio::test]
    async fn api_errors_carry_status() {
        let dir = tempfile::tempdir().unwrap();
        let (_controller, addr) = spawn_controller(&dir).await;

        let err = ControllerClient::new(addr)
            .terminate_replica(9)
            .await
            .unwrap_err();
        match err {
            ControllerError::Api { status, message } => {
                assert_eq!(status, 404);
                assert!(message.contains("replica 9"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_controller_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = ControllerClient::new(addr).with_timeout(Duration::from_secs(2));
        assert!(client.endpoints().await.is_err());
    }
}
