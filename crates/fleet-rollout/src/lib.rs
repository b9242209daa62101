//! Fleet version rollouts — rolling and blue-green replacement.
//!
//! Rollouts are planned from scratch on every controller tick from the
//! replica rows in the state store, so a restarted controller picks up a
//! half-finished rollout exactly where the previous one left it.
//!
//! # Components
//!
//! - **`strategy`** — Rollout strategy configuration (Rolling, BlueGreen)
//! - **`planner`** — Turns replica rows and a target count into launches,
//!   terminations, and the set of versions that may serve traffic

pub mod planner;
pub mod strategy;

pub use planner::{RolloutPhase, RolloutPlan, plan, select_for_scale_down};
pub use strategy::{RollingConfig, RolloutStrategy};
