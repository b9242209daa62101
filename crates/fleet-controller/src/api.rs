//! Controller HTTP handlers.
//!
//! Every handler answers with an [`ApiResponse`] envelope.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;

use crate::controller::Controller;
use crate::error::ControllerError;
use crate::protocol::{
    ApiResponse, LbSyncRequest, ReadyReplicas, TerminateReplicaRequest, UpdateServiceRequest,
    UpdateServiceResponse,
};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<Controller>,
}

/// Build the controller API router.
pub fn build_router(controller: Arc<Controller>) -> Router {
    let routes = Router::new()
        .route("/load_balancer_sync", post(load_balancer_sync))
        .route("/endpoints", get(endpoints))
        .route("/status", get(status))
        .route("/update_service", post(update_service))
        .route("/terminate_replica", post(terminate_replica))
        .with_state(ApiState { controller });

    Router::new().nest("/controller", routes)
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse::ok(data)).into_response()
}

fn error_response(err: &ControllerError) -> Response {
    let status = match err {
        ControllerError::ServiceNotFound(_)
        | ControllerError::ReplicaNotFound(_)
        | ControllerError::NoVersion(_) => StatusCode::NOT_FOUND,
        ControllerError::Config(_) => StatusCode::BAD_REQUEST,
        ControllerError::NotAccepting { .. } | ControllerError::VersionConflict { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "controller request failed");
    }
    (status, Json(ApiResponse::<String>::err(err.to_string()))).into_response()
}

/// POST /controller/load_balancer_sync
pub async fn load_balancer_sync(
    State(state): State<ApiState>,
    Json(req): Json<LbSyncRequest>,
) -> Response {
    match state.controller.record_lb_sync(&req.request_timestamps) {
        Ok(urls) => ok(ReadyReplicas {
            ready_replica_urls: urls,
        }),
        Err(e) => error_response(&e),
    }
}

/// GET /controller/endpoints
pub async fn endpoints(State(state): State<ApiState>) -> Response {
    match state.controller.ready_urls() {
        Ok(urls) => ok(ReadyReplicas {
            ready_replica_urls: urls,
        }),
        Err(e) => error_response(&e),
    }
}

/// GET /controller/status
pub async fn status(State(state): State<ApiState>) -> Response {
    match state.controller.status_report() {
        Ok(report) => ok(report),
        Err(e) => error_response(&e),
    }
}

/// POST /controller/update_service
pub async fn update_service(
    State(state): State<ApiState>,
    Json(req): Json<UpdateServiceRequest>,
) -> Response {
    match state.controller.update_service(&req.task, req.mode) {
        Ok(version) => (
            StatusCode::CREATED,
            Json(ApiResponse::ok(UpdateServiceResponse { version })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /controller/terminate_replica
pub async fn terminate_replica(
    State(state): State<ApiState>,
    Json(req): Json<TerminateReplicaRequest>,
) -> Response {
    match state.controller.terminate_replica(req.replica_id) {
        Ok(()) => ok(format!("replica {} terminating", req.replica_id)),
        Err(e) => error_response(&e),
    }
}
