//! fleet-autoscale — replica count decisions for Fleet services.
//!
//! The load balancer reports request timestamps; the [`Autoscaler`] keeps
//! the ones inside a sliding window and asks its [`ScalingPolicy`] for a
//! target replica count.
//!
//! # Scaling Algorithm
//!
//! ```text
//! qps      = requests in the last 60s / 60
//! proposal = clamp(ceil(qps / target_qps_per_replica), min, max)
//!
//! if proposal > target for upscale_delay:   target = proposal
//! if proposal < target for downscale_delay: target = proposal
//! ```
//!
//! Services without a QPS target keep a fixed count of `min_replicas`.

pub mod scaler;
pub mod window;

pub use scaler::{Autoscaler, FixedReplicas, RequestRate, ScaleDecision, ScalingPolicy};
pub use window::RequestWindow;
