//! Rollout strategies — rolling update, blue-green.

use fleet_state::UpdateMode;

/// How to move replicas from an old version to a new one.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RolloutStrategy {
    /// Replace replicas in batches as new ones become ready. Default.
    Rolling(RollingConfig),
    /// Bring up a full new set, then switch all traffic at once.
    BlueGreen,
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self::Rolling(RollingConfig::default())
    }
}

impl From<UpdateMode> for RolloutStrategy {
    fn from(mode: UpdateMode) -> Self {
        match mode {
            UpdateMode::Rolling => Self::Rolling(RollingConfig::default()),
            UpdateMode::BlueGreen => Self::BlueGreen,
        }
    }
}

/// Configuration for rolling updates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RollingConfig {
    /// New replicas allowed to be provisioning but not yet ready at once.
    pub batch_size: u32,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self { batch_size: 1 }
    }
}
