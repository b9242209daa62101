//! fleet-lb — the public entry point of a Fleet service.
//!
//! The load balancer keeps no durable state. It asks the controller for
//! the ready replica set on every request, and on a fixed interval reports
//! the timestamps of the requests it relayed so the controller can
//! autoscale. Each request is buffered up to a size limit, sent to the
//! replica chosen by the service's [`LoadBalancingPolicy`], and retried on
//! another replica if the forward fails.

pub mod error;
pub mod policy;
pub mod proxy;
pub mod sync;
pub mod tls;

pub use error::{LbError, LbResult};
pub use policy::{LeastLoad, LoadBalancingPolicy, RoundRobin, policy_for};
pub use proxy::{LoadBalancer, serve};
pub use tls::load_tls_acceptor;
