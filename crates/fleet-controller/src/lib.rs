//! fleet-controller — the per-service control loop.
//!
//! A [`Controller`] owns one service. On every tick it probes replicas,
//! asks the autoscaler for a target, plans the rollout towards the latest
//! version, and hands launches and terminations to the replica manager.
//! Nothing is kept only in memory: a restarted controller rebuilds its view
//! from the state store.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/controller/load_balancer_sync` | Report request timestamps, get ready replica URLs |
//! | GET | `/controller/endpoints` | Ready replica URLs |
//! | GET | `/controller/status` | Service, versions, and replicas |
//! | POST | `/controller/update_service` | Register a new version |
//! | POST | `/controller/terminate_replica` | Tear down one replica |

pub mod api;
pub mod client;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod status;

pub use api::{ApiState, build_router};
pub use client::ControllerClient;
pub use controller::{Controller, serve};
pub use error::{ControllerError, ControllerResult};
pub use protocol::{ApiResponse, ReplicaSummary, StatusReport, VersionSummary};
pub use status::derive_status;
