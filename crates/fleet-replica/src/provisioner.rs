//! Provisioning backend seam.
//!
//! A [`Provisioner`] creates and destroys the compute cluster behind one
//! replica. Both calls may take minutes; the replica manager always invokes
//! them from a dedicated task.

use std::path::PathBuf;

use async_trait::async_trait;
use fleet_core::{ServeConfig, ServiceTask};
use fleet_state::{ReplicaId, VersionNumber};
use tracing::debug;

use crate::error::{ReplicaError, ReplicaResult};

/// Everything a backend needs to bring up one replica.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub service_name: String,
    pub replica_id: ReplicaId,
    pub version: VersionNumber,
    pub cluster_name: String,
    /// Frozen task file of the replica's version.
    pub task_path: PathBuf,
    pub task: ServiceTask,
}

#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Provision the cluster and return the `host:port` the workload
    /// answers on.
    async fn launch(&self, request: &LaunchRequest) -> ReplicaResult<String>;

    /// Tear the cluster down. Must succeed when the cluster is already gone.
    async fn terminate(&self, cluster_name: &str) -> ReplicaResult<()>;
}

/// Drives an external CLI through shell command templates.
///
/// Templates may use `{cluster}`, `{task}`, `{port}`, and `{storage}`. The
/// launch command must print the replica endpoint as the last line of its
/// stdout; a bare host gets the task's replica port appended.
pub struct CommandProvisioner {
    config: ServeConfig,
}

impl CommandProvisioner {
    pub fn new(config: ServeConfig) -> Self {
        Self { config }
    }

    fn render_launch(&self, template: &str, request: &LaunchRequest) -> String {
        let storage = self
            .config
            .storage_dir(&request.service_name, request.version);
        template
            .replace("{cluster}", &request.cluster_name)
            .replace("{task}", &request.task_path.to_string_lossy())
            .replace("{port}", &request.task.service.replica_port.to_string())
            .replace("{storage}", &storage.to_string_lossy())
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn launch(&self, request: &LaunchRequest) -> ReplicaResult<String> {
        let template = self
            .config
            .provisioner
            .launch_command
            .as_deref()
            .ok_or(ReplicaError::NotConfigured("launch"))?;
        let command = self.render_launch(template, request);

        let stdout = run_shell(&command)
            .await
            .map_err(|reason| ReplicaError::Launch {
                cluster: request.cluster_name.clone(),
                reason,
            })?;

        let Some(line) = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
            return Err(ReplicaError::Launch {
                cluster: request.cluster_name.clone(),
                reason: "launch command printed no endpoint".to_string(),
            });
        };

        if line.contains(':') {
            Ok(line.to_string())
        } else {
            Ok(format!("{line}:{}", request.task.service.replica_port))
        }
    }

    async fn terminate(&self, cluster_name: &str) -> ReplicaResult<()> {
        let template = self
            .config
            .provisioner
            .terminate_command
            .as_deref()
            .ok_or(ReplicaError::NotConfigured("terminate"))?;
        let command = template.replace("{cluster}", cluster_name);

        run_shell(&command)
            .await
            .map_err(|reason| ReplicaError::Teardown {
                cluster: cluster_name.to_string(),
                reason,
            })?;
        Ok(())
    }
}

/// Run `command` under `sh -c`, returning stdout on a zero exit status.
async fn run_shell(command: &str) -> Result<String, String> {
    debug!(%command, "running provisioner command");
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| format!("failed to spawn shell: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} ({})", output.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::ProvisionerConfig;

    fn request() -> LaunchRequest {
        LaunchRequest {
            service_name: "svc1".to_string(),
            replica_id: 1,
            version: 1,
            cluster_name: "svc1-1".to_string(),
            task_path: PathBuf::from("/tmp/svc1/task_v1.toml"),
            task: ServiceTask::from_toml_str("[service]\nreplica_port = 9000\n").unwrap(),
        }
    }

    fn provisioner(launch: Option<&str>, terminate: Option<&str>) -> CommandProvisioner {
        CommandProvisioner::new(ServeConfig {
            provisioner: ProvisionerConfig {
                launch_command: launch.map(str::to_string),
                terminate_command: terminate.map(str::to_string),
            },
            ..ServeConfig::with_state_dir("/tmp/fleet")
        })
    }

    #[tokio::test]
    async fn launch_reads_endpoint_from_last_line() {
        let p = provisioner(Some("echo provisioning {cluster}; echo 10.0.0.7:8000"), None);
        assert_eq!(p.launch(&request()).await.unwrap(), "10.0.0.7:8000");
    }

    #[tokio::test]
    async fn bare_host_gets_replica_port() {
        let p = provisioner(Some("echo 10.0.0.7"), None);
        assert_eq!(p.launch(&request()).await.unwrap(), "10.0.0.7:9000");
    }

    #[tokio::test]
    async fn placeholders_are_expanded() {
        let p = provisioner(Some("echo {cluster}-{port}:1"), None);
        assert_eq!(p.launch(&request()).await.unwrap(), "svc1-1-9000:1");
    }

    #[tokio::test]
    async fn failing_launch_is_reported() {
        let p = provisioner(Some("echo boom >&2; exit 3"), None);
        let err = p.launch(&request()).await.unwrap_err();
        assert!(matches!(err, ReplicaError::Launch { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn silent_launch_is_an_error() {
        let p = provisioner(Some("true"), None);
        assert!(p.launch(&request()).await.is_err());
    }

    #[tokio::test]
    async fn terminate_exit_status_decides_outcome() {
        assert!(provisioner(None, Some("true")).terminate("c").await.is_ok());
        let err = provisioner(None, Some("exit 1")).terminate("c").await.unwrap_err();
        assert!(matches!(err, ReplicaError::Teardown { .. }));
    }

    #[tokio::test]
    async fn missing_templates_are_reported() {
        let p = provisioner(None, None);
        assert!(matches!(
            p.launch(&request()).await.unwrap_err(),
            ReplicaError::NotConfigured("launch")
        ));
        assert!(matches!(
            p.terminate("c").await.unwrap_err(),
            ReplicaError::NotConfigured("terminate")
        ));
    }
}
