//! Per-version storage staging and cleanup.
//!
//! Local file mounts are copied into a per-version staging directory when a
//! version is registered, so the provisioner can ship them to replicas even
//! if the originals change. Cleanup removes that directory again; bucket
//! URLs are left to their owners.

use std::io;
use std::path::{Path, PathBuf};

use fleet_core::{ServeConfig, ServiceTask};
use fleet_state::VersionRecord;
use tracing::{debug, warn};

/// Releases storage created for one version of a service.
pub trait StorageCleaner: Send + Sync {
    /// Idempotent. Returns `false` if anything could not be removed.
    fn cleanup(&self, version: &VersionRecord) -> bool;
}

/// Stages local mounts under `<state_dir>/storage/<service>/v<version>`.
#[derive(Debug, Clone)]
pub struct LocalStorageCleaner {
    config: ServeConfig,
}

impl LocalStorageCleaner {
    pub fn new(config: ServeConfig) -> Self {
        Self { config }
    }

    /// Copy the task's local file mount sources into the staging directory.
    /// Returns the staging directory.
    pub fn stage(
        &self,
        service: &str,
        version: u64,
        task: &ServiceTask,
    ) -> io::Result<PathBuf> {
        let dest = self.config.storage_dir(service, version);
        std::fs::create_dir_all(&dest)?;
        for source in task.local_mount_sources() {
            let source = expand_home(&source);
            let Some(name) = source.file_name() else {
                continue;
            };
            copy_recursive(&source, &dest.join(name))?;
        }
        debug!(%service, version, dest = %dest.display(), "staged file mounts");
        Ok(dest)
    }
}

impl StorageCleaner for LocalStorageCleaner {
    fn cleanup(&self, version: &VersionRecord) -> bool {
        let dir = self
            .config
            .storage_dir(&version.service_name, version.version);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to remove staged storage");
                false
            }
        }
    }
}

/// Expand a leading `~` using `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn copy_recursive(source: &Path, dest: &Path) -> io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(source, dest)?;
    }
    Ok(())
}
