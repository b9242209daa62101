//! Error types for the controller and its client.

use fleet_state::{ReplicaId, ServiceStatus, VersionNumber};
use thiserror::Error;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    State(#[from] fleet_state::StateError),

    #[error(transparent)]
    Replica(#[from] fleet_replica::ReplicaError),

    #[error(transparent)]
    Config(#[from] fleet_core::ConfigError),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("replica {0} not found")]
    ReplicaNotFound(ReplicaId),

    #[error("service {0} has no registered version")]
    NoVersion(String),

    #[error("service {service} is {status} and does not accept updates")]
    NotAccepting {
        service: String,
        status: ServiceStatus,
    },

    #[error("version {version} of {service} was registered concurrently")]
    VersionConflict {
        service: String,
        version: VersionNumber,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("controller request failed: {0}")]
    Http(String),

    #[error("controller returned {status}: {message}")]
    Api { status: u16, message: String },
}
