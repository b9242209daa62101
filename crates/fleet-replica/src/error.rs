//! Error types for replica lifecycle operations.

use thiserror::Error;

pub type ReplicaResult<T> = Result<T, ReplicaError>;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    State(#[from] fleet_state::StateError),

    #[error("provisioning {cluster} failed: {reason}")]
    Launch { cluster: String, reason: String },

    #[error("teardown of {cluster} failed: {reason}")]
    Teardown { cluster: String, reason: String },

    #[error("no provisioner command configured for {0}")]
    NotConfigured(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
