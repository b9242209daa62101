//! fleet-state — durable state store for Fleet services.
//!
//! Backed by [redb](https://docs.rs/redb), records services, their
//! immutable task versions, and per-replica lifecycle rows. It is the
//! single source of truth that survives supervisor, controller, and
//! load balancer restarts.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{service}:{version:020}`, `{service}:{replica_id:020}`)
//! keep one service's rows contiguous and numerically ordered.
//!
//! Every mutation commits in a single write transaction, so a row is
//! never observed half-updated. The on-disk store opens the database per
//! transaction and waits while another process holds it, which lets
//! several supervisors on one host share a single state file.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
