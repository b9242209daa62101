//! fleet-core — shared types for the Fleet serving control plane.
//!
//! Parses service task files (`task.toml`), holds the daemon
//! configuration (`fleet.toml`), and defines the on-disk layout every
//! other crate agrees on.

pub mod config;
pub mod constants;
pub mod error;
pub mod name;
pub mod task;

pub use config::{ProvisionerConfig, ServeConfig};
pub use error::{ConfigError, ConfigResult};
pub use name::validate_service_name;
pub use task::{LoadBalancingPolicyId, ReplicaPolicy, ServiceSection, ServiceTask, TlsCredential};
