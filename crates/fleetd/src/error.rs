//! Error types for the service supervisor.

use thiserror::Error;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    State(#[from] fleet_state::StateError),

    #[error(transparent)]
    Replica(#[from] fleet_replica::ReplicaError),

    #[error(transparent)]
    Controller(#[from] fleet_controller::ControllerError),

    #[error(transparent)]
    Lb(#[from] fleet_lb::LbError),

    #[error(transparent)]
    Config(#[from] fleet_core::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("service {0} already exists")]
    AlreadyExists(String),

    #[error("max number of services reached ({max})")]
    CeilingReached { max: usize },

    #[error("service {0} has no registered version")]
    NoVersion(String),

    #[error("service {0} is new and no task file was given")]
    MissingTask(String),

    #[error("stale version rows found for new service {0}")]
    StaleVersions(String),

    #[error("{0} exceeded its restart limit")]
    ComponentFailed(&'static str),

    #[error("no free port at or above {start} on {host}")]
    NoFreePort { host: String, start: u16 },
}
