//! fleetd — the Fleet service supervisor.
//!
//! One `fleetd run` process supervises one service: it admits or recovers
//! the service, binds its controller and load balancer ports, runs both
//! components in-process, and tears everything down when an operator
//! raises the terminate signal with `fleetd down`.
//!
//! ```text
//! fleetd run --service svc1 --task task.toml
//! fleetd status --service svc1
//! fleetd update --service svc1 --task task_v2.toml --mode blue-green
//! fleetd down --service svc1
//! ```

pub mod error;
pub mod lock;
pub mod logging;
pub mod ports;
pub mod signal;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use signal::{SignalChannel, UserSignal};
pub use supervisor::{ServiceOutcome, Supervisor, stage_task};
