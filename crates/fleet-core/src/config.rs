//! fleet.toml daemon configuration and on-disk layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    CONTROLLER_PORT_START, DEFAULT_LB_MAX_BODY_BYTES, DEFAULT_MAX_SERVICES, KUBERNETES_HOST_ENV,
    LOAD_BALANCER_PORT_START,
};
use crate::error::{ConfigError, ConfigResult};

/// Host-wide configuration shared by every service supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServeConfig {
    /// Root directory for the state database, service directories,
    /// signal files, and the port selection lock.
    pub state_dir: PathBuf,
    pub controller_port_start: u16,
    pub load_balancer_port_start: u16,
    /// Admission-control ceiling on concurrently registered services.
    pub max_services: usize,
    pub signal_poll_interval_ms: u64,
    pub autoscaler_interval_ms: u64,
    pub lb_sync_interval_ms: u64,
    /// Request bodies above this size are rejected by the load balancer.
    pub lb_max_body_bytes: usize,
    /// Launch failures in a row before the controller stops launching.
    pub max_consecutive_launch_failures: u32,
    /// Consecutive controller crashes tolerated before giving up.
    pub controller_restart_limit: u32,
    /// Bind address for the controller. Defaults to loopback, or all
    /// interfaces inside a Kubernetes pod.
    pub controller_host: Option<String>,
    pub provisioner: ProvisionerConfig,
}

/// Shell command templates for the command-driven provisioner.
///
/// `{cluster}` expands to the replica's cluster name and `{task}` to the
/// frozen task file of the replica's version.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub launch_command: Option<String>,
    pub terminate_command: Option<String>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/fleet"),
            controller_port_start: CONTROLLER_PORT_START,
            load_balancer_port_start: LOAD_BALANCER_PORT_START,
            max_services: DEFAULT_MAX_SERVICES,
            signal_poll_interval_ms: 1000,
            autoscaler_interval_ms: 20_000,
            lb_sync_interval_ms: 20_000,
            lb_max_body_bytes: DEFAULT_LB_MAX_BODY_BYTES,
            max_consecutive_launch_failures: 3,
            controller_restart_limit: 5,
            controller_host: None,
            provisioner: ProvisionerConfig::default(),
        }
    }
}

impl ServeConfig {
    /// Load a config file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Defaults rooted at `state_dir`.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_interval_ms)
    }

    pub fn autoscaler_interval(&self) -> Duration {
        Duration::from_millis(self.autoscaler_interval_ms)
    }

    pub fn lb_sync_interval(&self) -> Duration {
        Duration::from_millis(self.lb_sync_interval_ms)
    }

    pub fn controller_host(&self) -> String {
        if let Some(host) = &self.controller_host {
            return host.clone();
        }
        if std::env::var_os(KUBERNETES_HOST_ENV).is_some() {
            "0.0.0.0".to_string()
        } else {
            // Loopback by address, not "localhost", to stay on IPv4.
            "127.0.0.1".to_string()
        }
    }

    // ── On-disk layout ───────────────────────────────────────────

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("fleet.redb")
    }

    pub fn port_lock_path(&self) -> PathBuf {
        self.state_dir.join("port_selection.lock")
    }

    pub fn service_dir(&self, service: &str) -> PathBuf {
        self.state_dir.join("services").join(service)
    }

    /// Frozen task file for one version of a service.
    pub fn task_path(&self, service: &str, version: u64) -> PathBuf {
        self.service_dir(service).join(format!("task_v{version}.toml"))
    }

    /// Staging area for one version's local file mounts.
    pub fn storage_dir(&self, service: &str, version: u64) -> PathBuf {
        self.state_dir
            .join("storage")
            .join(service)
            .join(format!("v{version}"))
    }

    /// Holding area for task files that have not passed admission yet.
    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    pub fn load_balancer_log_path(&self, service: &str) -> PathBuf {
        self.service_dir(service).join("load_balancer.log")
    }

    pub fn signal_path(&self, service: &str) -> PathBuf {
        self.state_dir.join("signals").join(service)
    }
}
