//! Service task parser.
//!
//! A task file describes one version of a service: what to run, the
//! resources each replica needs, how many replicas to keep, and how the
//! load balancer should route between them.
//!
//! ```toml
//! name = "llm"
//! run = "python -m server --port 8080"
//!
//! [resources]
//! cloud = "aws"
//! accelerators = "A10G:1"
//!
//! [service]
//! readiness_path = "/health"
//! replica_port = 8080
//! load_balancing_policy = "round_robin"
//!
//! [service.replica_policy]
//! min_replicas = 1
//! max_replicas = 4
//! target_qps_per_replica = 2.5
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// A parsed service task file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceTask {
    pub name: Option<String>,
    /// Command each replica runs.
    pub run: Option<String>,
    /// Free-form resource requirements handed to the provisioning backend.
    #[serde(default)]
    pub resources: BTreeMap<String, toml::Value>,
    /// Destination path on the replica → local source path or bucket URL.
    #[serde(default)]
    pub file_mounts: BTreeMap<String, String>,
    /// Destination path on the replica → storage bucket name.
    #[serde(default)]
    pub storage_mounts: BTreeMap<String, String>,
    pub service: ServiceSection,
}

/// The `[service]` section of a task file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// HTTP path probed to decide whether a replica is ready. Without one,
    /// a replica is ready as soon as provisioning succeeds.
    pub readiness_path: Option<String>,
    /// Grace period before a never-ready replica is replaced.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: u64,
    /// Per-probe timeout.
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_seconds: u64,
    /// Port the workload listens on inside each replica.
    #[serde(default = "default_replica_port")]
    pub replica_port: u16,
    #[serde(default)]
    pub load_balancing_policy: LoadBalancingPolicyId,
    #[serde(default)]
    pub replica_policy: ReplicaPolicy,
    pub tls: Option<TlsCredential>,
}

/// Autoscaling bounds and targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaPolicy {
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,
    pub max_replicas: Option<u32>,
    pub target_qps_per_replica: Option<f64>,
    #[serde(default = "default_upscale_delay")]
    pub upscale_delay_seconds: u64,
    #[serde(default = "default_downscale_delay")]
    pub downscale_delay_seconds: u64,
}

impl Default for ReplicaPolicy {
    fn default() -> Self {
        Self {
            min_replicas: default_min_replicas(),
            max_replicas: None,
            target_qps_per_replica: None,
            upscale_delay_seconds: default_upscale_delay(),
            downscale_delay_seconds: default_downscale_delay(),
        }
    }
}

impl ReplicaPolicy {
    /// Whether this policy scales on load rather than pinning a count.
    pub fn is_autoscaling(&self) -> bool {
        self.target_qps_per_replica.is_some()
            && self.max_replicas.is_some_and(|max| max > self.min_replicas)
    }

    /// Upper bound on replica count.
    pub fn max(&self) -> u32 {
        self.max_replicas.unwrap_or(self.min_replicas)
    }

    /// Human-readable descriptor stored on the service row.
    pub fn describe(&self) -> String {
        if !self.is_autoscaling() {
            let plural = if self.min_replicas == 1 { "" } else { "s" };
            return format!("Fixed {} replica{plural}", self.min_replicas);
        }
        let target = self.target_qps_per_replica.unwrap_or_default();
        format!(
            "Autoscaling from {} to {} replicas (target QPS per replica: {target})",
            self.min_replicas,
            self.max()
        )
    }

    fn validate(&self) -> ConfigResult<()> {
        if let Some(max) = self.max_replicas
            && max < self.min_replicas
        {
            return Err(ConfigError::Invalid(format!(
                "max_replicas ({max}) is smaller than min_replicas ({})",
                self.min_replicas
            )));
        }
        if let Some(target) = self.target_qps_per_replica {
            if target.is_nan() || target <= 0.0 {
                return Err(ConfigError::Invalid(
                    "target_qps_per_replica must be positive".to_string(),
                ));
            }
            if self.max_replicas.is_none() {
                return Err(ConfigError::Invalid(
                    "target_qps_per_replica requires max_replicas".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Load-balancing policy selected per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicyId {
    #[default]
    RoundRobin,
    LeastLoad,
}

impl LoadBalancingPolicyId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoad => "least_load",
        }
    }
}

impl fmt::Display for LoadBalancingPolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingPolicyId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_load" => Ok(Self::LeastLoad),
            other => Err(ConfigError::Invalid(format!(
                "unknown load balancing policy: {other}"
            ))),
        }
    }
}

/// PEM files used to terminate TLS at the load balancer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsCredential {
    pub keyfile: PathBuf,
    pub certfile: PathBuf,
}

impl ServiceTask {
    /// Load and validate a task file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a task from TOML text.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let task: ServiceTask = toml::from_str(content)?;
        task.validate()?;
        Ok(task)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.service.replica_policy.validate()?;
        if let Some(path) = &self.service.readiness_path
            && !path.starts_with('/')
        {
            return Err(ConfigError::Invalid(format!(
                "readiness_path must start with '/': {path}"
            )));
        }
        Ok(())
    }

    /// Resource descriptor stored on the service row, e.g. `cloud=aws, cpus=4`.
    pub fn resources_descriptor(&self) -> String {
        if self.resources.is_empty() {
            return "default".to_string();
        }
        self.resources
            .iter()
            .map(|(key, value)| match value {
                toml::Value::String(s) => format!("{key}={s}"),
                other => format!("{key}={other}"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// File mount sources that live on the local disk (not bucket URLs).
    pub fn local_mount_sources(&self) -> Vec<PathBuf> {
        self.file_mounts
            .values()
            .filter(|source| !is_cloud_store_url(source))
            .map(PathBuf::from)
            .collect()
    }
}

/// Whether a mount source points at a cloud bucket rather than a local path.
pub fn is_cloud_store_url(source: &str) -> bool {
    ["s3://", "gs://", "r2://", "cos://", "oci://", "https://", "az://"]
        .iter()
        .any(|scheme| source.starts_with(scheme))
}

fn default_initial_delay() -> u64 {
    1200
}

fn default_readiness_timeout() -> u64 {
    15
}

fn default_replica_port() -> u16 {
    8080
}

fn default_min_replicas() -> u32 {
    1
}

fn default_upscale_delay() -> u64 {
    300
}

fn default_downscale_delay() -> u64 {
    1200
}
