//! fleet-replica — per-replica lifecycle for Fleet services.
//!
//! The [`ReplicaManager`] turns scale decisions into provisioning and
//! teardown operations against a [`Provisioner`] backend. Each operation
//! runs in its own tokio task so slow cloud calls never stall the caller,
//! and at most one task drives a given replica at a time.
//!
//! Launch and teardown progress is recorded on the replica's row in the
//! state store as two independent sub-states. A replica row is removed only
//! after its teardown succeeds; a failed teardown leaves the row behind so
//! the leak stays visible.

pub mod error;
pub mod manager;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod probe;
pub mod provisioner;
pub mod storage;

pub use error::{ReplicaError, ReplicaResult};
pub use manager::ReplicaManager;
pub use probe::{ProbeResult, http_probe};
pub use provisioner::{CommandProvisioner, LaunchRequest, Provisioner};
pub use storage::{LocalStorageCleaner, StorageCleaner};
