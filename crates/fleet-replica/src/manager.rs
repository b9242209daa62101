//! Replica lifecycle driver.
//!
//! Every provisioning or teardown call runs in its own tokio task (a
//! *unit*). The in-flight map tracks at most one unit per replica id.
//! Launch outcomes are written under the map's lock, so a terminate
//! request racing a launch is either deferred to the launching unit or
//! handled after it, never both. Teardown outcomes are written without
//! it and only then is the unit removed from the map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fleet_state::{
    HealthStatus, ProcessStatus, ReplicaId, ReplicaInfo, StateStore, VersionNumber,
    VersionRecord, epoch_secs,
};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::ReplicaResult;
use crate::probe::{ProbeResult, http_probe, record_probe};
use crate::provisioner::{LaunchRequest, Provisioner};

/// Drives the replicas of one service.
#[derive(Clone)]
pub struct ReplicaManager {
    inner: Arc<Inner>,
}

struct Inner {
    service_name: String,
    store: StateStore,
    provisioner: Arc<dyn Provisioner>,
    inflight: Mutex<HashMap<ReplicaId, JoinHandle<()>>>,
}

/// Readiness settings of one version.
struct ProbeTarget {
    path: String,
    timeout: Duration,
    initial_delay_secs: u64,
}

impl ReplicaManager {
    pub fn new(
        service_name: impl Into<String>,
        store: StateStore,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                service_name: service_name.into(),
                store,
                provisioner,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// All replica rows of the service, by id.
    pub fn replicas(&self) -> ReplicaResult<Vec<ReplicaInfo>> {
        Ok(self.inner.store.list_replicas(&self.inner.service_name)?)
    }

    /// URLs of replicas the load balancer may route to, by id.
    pub fn ready_urls(&self) -> ReplicaResult<Vec<String>> {
        Ok(self
            .replicas()?
            .into_iter()
            .filter(ReplicaInfo::is_routable)
            .filter_map(|r| r.url())
            .collect())
    }

    /// Whether a unit is currently driving `id`.
    pub fn is_busy(&self, id: ReplicaId) -> bool {
        self.inner
            .lock_inflight()
            .get(&id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Start provisioning one replica of `version`.
    ///
    /// Returns as soon as the `PENDING` row is written; the launch itself
    /// runs in the background and is never retried here.
    pub fn launch_replica(&self, version: &VersionRecord) -> ReplicaResult<ReplicaId> {
        let service = &self.inner.service_name;
        let id = self.inner.store.allocate_replica_id(service)?;
        let row = ReplicaInfo::new(service, id, version.version);
        self.inner.store.put_replica(&row)?;

        let request = LaunchRequest {
            service_name: service.clone(),
            replica_id: id,
            version: version.version,
            cluster_name: row.cluster_name.clone(),
            task_path: version.task_path.clone(),
            task: version.task.clone(),
        };
        let ready_on_launch = version.task.service.readiness_path.is_none();

        let mut inflight = self.inner.lock_inflight();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_launch(request, ready_on_launch).await });
        inflight.insert(id, handle);

        info!(service = %service, replica_id = id, version = version.version, "replica launch started");
        Ok(id)
    }

    /// Request teardown of one replica.
    ///
    /// A no-op when the row is absent or teardown was already requested.
    /// If a launch is still running, teardown is marked `PENDING` and the
    /// launching unit performs it once the backend call returns.
    pub fn terminate_replica(&self, id: ReplicaId) -> ReplicaResult<()> {
        let service = &self.inner.service_name;
        let mut inflight = self.inner.lock_inflight();

        let Some(row) = self.inner.store.get_replica(service, id)? else {
            debug!(service = %service, replica_id = id, "terminate: replica already gone");
            return Ok(());
        };
        if row.teardown_status.is_some() {
            debug!(
                service = %service,
                replica_id = id,
                teardown = ?row.teardown_status,
                "terminate: teardown already requested"
            );
            return Ok(());
        }

        if row.is_launching() {
            self.inner.store.update_replica(service, id, |r| {
                r.teardown_status = Some(ProcessStatus::Pending);
            })?;
            info!(service = %service, replica_id = id, "teardown deferred until launch returns");
            return Ok(());
        }

        self.inner.store.update_replica(service, id, |r| {
            r.teardown_status = Some(ProcessStatus::Running);
        })?;
        let inner = Arc::clone(&self.inner);
        let cluster = row.cluster_name;
        let handle = tokio::spawn(async move { inner.run_teardown(id, cluster).await });
        inflight.insert(id, handle);

        info!(service = %service, replica_id = id, "replica teardown started");
        Ok(())
    }

    /// Tear down every replica concurrently and wait for all of them.
    ///
    /// Returns `true` if any replica could not be reclaimed; those rows stay
    /// in the store with teardown `FAILED`.
    pub async fn terminate_all(&self) -> ReplicaResult<bool> {
        for row in self.replicas()? {
            self.terminate_replica(row.replica_id)?;
        }
        self.wait_idle().await;

        let remaining = self.replicas()?;
        if !remaining.is_empty() {
            let ids: Vec<_> = remaining.iter().map(|r| r.replica_id).collect();
            warn!(service = %self.inner.service_name, ?ids, "replicas left after teardown");
        }
        Ok(!remaining.is_empty())
    }

    /// Wait until no unit is running.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<_> = self
                .inner
                .lock_inflight()
                .drain()
                .map(|(_, handle)| handle)
                .collect();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(service = %self.inner.service_name, error = %e, "replica unit panicked");
                }
            }
        }
    }

    /// Resume work a previous controller left unfinished.
    ///
    /// Launches without a live unit cannot be resumed: they are marked
    /// `FAILED` and torn down. Pending or running teardowns are reissued.
    /// Returns the number of replicas touched.
    pub fn recover(&self) -> ReplicaResult<usize> {
        let service = &self.inner.service_name;
        let mut inflight = self.inner.lock_inflight();
        let mut touched = 0;

        for row in self.inner.store.list_replicas(service)? {
            let id = row.replica_id;
            if inflight.contains_key(&id) {
                continue;
            }

            match row.teardown_status {
                Some(ProcessStatus::Succeeded) => {
                    self.inner.store.remove_replica(service, id)?;
                    touched += 1;
                    continue;
                }
                Some(ProcessStatus::Failed) => continue,
                Some(ProcessStatus::Pending | ProcessStatus::Running) => {}
                None if row.is_launching() => {
                    warn!(service = %service, replica_id = id, "orphaned launch, tearing down");
                }
                None => continue,
            }

            self.inner.store.update_replica(service, id, |r| {
                if r.is_launching() {
                    r.launch_status = ProcessStatus::Failed;
                }
                r.teardown_status = Some(ProcessStatus::Running);
            })?;
            let inner = Arc::clone(&self.inner);
            let cluster = row.cluster_name;
            inflight.insert(
                id,
                tokio::spawn(async move { inner.run_teardown(id, cluster).await }),
            );
            touched += 1;
        }

        if touched > 0 {
            info!(service = %service, touched, "recovered unfinished replica operations");
        }
        Ok(touched)
    }

    /// Probe every launched replica whose version declares a readiness path,
    /// and terminate those that failed. Returns the ids being replaced.
    pub async fn probe_replicas(&self, threshold: u32) -> ReplicaResult<Vec<ReplicaId>> {
        let service = self.inner.service_name.clone();
        let mut targets: HashMap<VersionNumber, Option<Arc<ProbeTarget>>> = HashMap::new();
        let mut probes = JoinSet::new();

        for row in self.replicas()? {
            if row.launch_status != ProcessStatus::Succeeded || row.teardown_status.is_some() {
                continue;
            }
            let Some(endpoint) = row.endpoint.clone() else {
                continue;
            };
            if !targets.contains_key(&row.version) {
                let target = self.inner.store.get_version(&service, row.version)?.and_then(|v| {
                    let svc = v.task.service;
                    svc.readiness_path.map(|path| {
                        Arc::new(ProbeTarget {
                            path,
                            timeout: Duration::from_secs(svc.readiness_timeout_seconds),
                            initial_delay_secs: svc.initial_delay_seconds,
                        })
                    })
                });
                targets.insert(row.version, target);
            }
            let Some(Some(target)) = targets.get(&row.version).cloned() else {
                continue;
            };

            let id = row.replica_id;
            probes.spawn(async move {
                let result = http_probe(&endpoint, &target.path, target.timeout).await;
                (id, result, target)
            });
        }

        let mut replaced = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let (id, result, target) = match joined {
                Ok(out) => out,
                Err(e) => {
                    error!(service = %service, error = %e, "probe task failed");
                    continue;
                }
            };
            if self.apply_probe(id, result, threshold, target.initial_delay_secs)? {
                self.terminate_replica(id)?;
                replaced.push(id);
            }
        }

        if !replaced.is_empty() {
            info!(service = %service, ?replaced, "replacing unready replicas");
        }
        Ok(replaced)
    }

    fn apply_probe(
        &self,
        id: ReplicaId,
        result: ProbeResult,
        threshold: u32,
        initial_delay_secs: u64,
    ) -> ReplicaResult<bool> {
        let now = epoch_secs();
        let mut replace = false;
        self.inner
            .store
            .update_replica(&self.inner.service_name, id, |r| {
                // Teardown may have started while the probe was in flight.
                if r.teardown_status.is_none() {
                    replace = record_probe(r, result, threshold, initial_delay_secs, now);
                }
            })?;
        Ok(replace)
    }
}

impl Inner {
    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<ReplicaId, JoinHandle<()>>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_launch(self: Arc<Self>, request: LaunchRequest, ready_on_launch: bool) {
        let id = request.replica_id;
        if let Err(e) = self.store.update_replica(&self.service_name, id, |r| {
            r.launch_status = ProcessStatus::Running;
        }) {
            error!(service = %self.service_name, replica_id = id, error = %e, "failed to mark launch running");
        }

        let outcome = self.provisioner.launch(&request).await;

        let teardown = {
            let mut inflight = self.lock_inflight();
            let teardown = match self.finish_launch(id, outcome, ready_on_launch) {
                Ok(teardown) => teardown,
                Err(e) => {
                    // The cluster may exist; tear it down rather than leak it.
                    error!(service = %self.service_name, replica_id = id, error = %e, "failed to record launch outcome");
                    true
                }
            };
            if !teardown {
                inflight.remove(&id);
            }
            teardown
        };

        if teardown {
            self.run_teardown(id, request.cluster_name).await;
        }
    }

    /// Record a launch outcome. Returns whether the unit must now tear the
    /// cluster down, in which case teardown is already marked `RUNNING`.
    fn finish_launch(
        &self,
        id: ReplicaId,
        outcome: ReplicaResult<String>,
        ready_on_launch: bool,
    ) -> ReplicaResult<bool> {
        let service = &self.service_name;
        let now = epoch_secs();

        match outcome {
            Ok(endpoint) => {
                self.record_outcome(true);
                let row = self.store.update_replica(service, id, |r| {
                    r.launch_status = ProcessStatus::Succeeded;
                    r.endpoint = Some(endpoint.clone());
                    r.launched_at = Some(now);
                    if ready_on_launch {
                        r.health = HealthStatus::Healthy;
                        r.first_ready_at = Some(now);
                    }
                    if r.teardown_status == Some(ProcessStatus::Pending) {
                        r.teardown_status = Some(ProcessStatus::Running);
                    }
                })?;
                info!(service = %service, replica_id = id, %endpoint, "replica launched");
                match row {
                    Some(r) => Ok(r.teardown_status.is_some()),
                    None => {
                        warn!(service = %service, replica_id = id, "replica row vanished during launch");
                        Ok(true)
                    }
                }
            }
            Err(e) => {
                warn!(service = %service, replica_id = id, error = %e, "replica launch failed");
                self.record_outcome(false);
                self.store.update_replica(service, id, |r| {
                    r.launch_status = ProcessStatus::Failed;
                    r.teardown_status = Some(ProcessStatus::Running);
                })?;
                Ok(true)
            }
        }
    }

    fn record_outcome(&self, succeeded: bool) {
        if let Err(e) = self.store.record_launch_outcome(&self.service_name, succeeded) {
            debug!(service = %self.service_name, error = %e, "launch outcome not recorded");
        }
    }

    async fn run_teardown(self: Arc<Self>, id: ReplicaId, cluster: String) {
        let service = &self.service_name;
        let result = self.provisioner.terminate(&cluster).await;

        // The row is final before the unit leaves the map, so `recover`
        // never sees a `RUNNING` row without its unit. The map lock is not
        // held across these writes: once teardown is requested no other
        // caller writes this row.
        let recorded = match &result {
            Ok(()) => self
                .store
                .update_replica(service, id, |r| {
                    r.teardown_status = Some(ProcessStatus::Succeeded);
                })
                .and_then(|_| self.store.remove_replica(service, id).map(|_| ())),
            Err(e) => {
                warn!(service = %service, replica_id = id, %cluster, error = %e, "replica teardown failed");
                self.store
                    .update_replica(service, id, |r| {
                        r.teardown_status = Some(ProcessStatus::Failed);
                    })
                    .map(|_| ())
            }
        };
        self.lock_inflight().remove(&id);

        match recorded {
            Ok(()) if result.is_ok() => {
                info!(service = %service, replica_id = id, %cluster, "replica terminated");
            }
            Ok(()) => {}
            Err(e) => {
                error!(service = %service, replica_id = id, error = %e, "failed to record teardown outcome");
            }
        }
    }
}
