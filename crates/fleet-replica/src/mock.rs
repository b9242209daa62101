//! In-memory provisioning doubles with fault injection.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleet_state::VersionRecord;

use crate::error::{ReplicaError, ReplicaResult};
use crate::provisioner::{LaunchRequest, Provisioner};
use crate::storage::StorageCleaner;

/// A provisioner that sleeps instead of calling a cloud.
#[derive(Default)]
pub struct MockProvisioner {
    launch_delay: Duration,
    terminate_delay: Duration,
    endpoint: Option<String>,
    fail_all_launches: AtomicBool,
    failing_launches: Mutex<HashSet<String>>,
    failing_teardowns: Mutex<HashSet<String>>,
    launches: AtomicUsize,
    live: Mutex<HashSet<String>>,
    terminated: Mutex<Vec<String>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn with_terminate_delay(mut self, delay: Duration) -> Self {
        self.terminate_delay = delay;
        self
    }

    /// Report this endpoint for every replica instead of a fake one.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn fail_launch_of(&self, cluster: &str) {
        lock(&self.failing_launches).insert(cluster.to_string());
    }

    pub fn fail_all_launches(&self, fail: bool) {
        self.fail_all_launches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_teardown_of(&self, cluster: &str) {
        lock(&self.failing_teardowns).insert(cluster.to_string());
    }

    /// Number of launch calls, successful or not.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Clusters that currently exist on the fake backend.
    pub fn live_clusters(&self) -> Vec<String> {
        let mut live: Vec<_> = lock(&self.live).iter().cloned().collect();
        live.sort();
        live
    }

    /// Clusters torn down successfully, in completion order.
    pub fn terminated(&self) -> Vec<String> {
        lock(&self.terminated).clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn launch(&self, request: &LaunchRequest) -> ReplicaResult<String> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.launch_delay).await;

        // A failed launch may still leave a partial cluster behind.
        lock(&self.live).insert(request.cluster_name.clone());

        let fail = self.fail_all_launches.load(Ordering::SeqCst)
            || lock(&self.failing_launches).contains(&request.cluster_name);
        if fail {
            return Err(ReplicaError::Launch {
                cluster: request.cluster_name.clone(),
                reason: "injected launch failure".to_string(),
            });
        }

        Ok(self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("{}.mock:{}", request.cluster_name, request.task.service.replica_port)))
    }

    async fn terminate(&self, cluster_name: &str) -> ReplicaResult<()> {
        tokio::time::sleep(self.terminate_delay).await;

        if lock(&self.failing_teardowns).contains(cluster_name) {
            return Err(ReplicaError::Teardown {
                cluster: cluster_name.to_string(),
                reason: "injected teardown failure".to_string(),
            });
        }

        lock(&self.live).remove(cluster_name);
        lock(&self.terminated).push(cluster_name.to_string());
        Ok(())
    }
}

/// Storage cleaner that records calls and can be told to fail.
#[derive(Default)]
pub struct MockStorageCleaner {
    fail: AtomicBool,
    cleaned: Mutex<Vec<(String, u64)>>,
}

impl MockStorageCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn cleaned(&self) -> Vec<(String, u64)> {
        lock(&self.cleaned).clone()
    }
}

impl StorageCleaner for MockStorageCleaner {
    fn cleanup(&self, version: &VersionRecord) -> bool {
        lock(&self.cleaned).push((version.service_name.clone(), version.version));
        !self.fail.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
