//! The autoscaling tick loop and the operations behind the controller API.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleet_autoscale::Autoscaler;
use fleet_core::constants::PROBE_FAILURE_THRESHOLD;
use fleet_core::{ServeConfig, ServiceTask};
use fleet_replica::{LocalStorageCleaner, ReplicaManager};
use fleet_rollout::{RolloutStrategy, plan};
use fleet_state::{
    ReplicaId, ReplicaInfo, ServiceStatus, StateError, StateStore, UpdateMode, VersionNumber,
    VersionRecord, epoch_secs,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::protocol::{ReplicaSummary, StatusReport, VersionSummary};
use crate::status::derive_status;

/// Controller for one service.
pub struct Controller {
    service_name: String,
    store: StateStore,
    replicas: ReplicaManager,
    storage: LocalStorageCleaner,
    config: ServeConfig,
    scaling: Mutex<Scaling>,
}

/// Autoscaler plus the version whose policy it currently applies.
struct Scaling {
    autoscaler: Autoscaler,
    version: VersionNumber,
}

impl Controller {
    /// Build a controller from the latest registered version.
    ///
    /// `replicas` should outlive controller restarts so that launches and
    /// teardowns still in flight are not mistaken for orphans.
    pub fn new(
        service_name: impl Into<String>,
        store: StateStore,
        replicas: ReplicaManager,
        config: ServeConfig,
    ) -> ControllerResult<Self> {
        let service_name = service_name.into();
        let latest = latest_version_record(&store, &service_name)?;
        let scaling = Scaling {
            autoscaler: Autoscaler::new(&latest.task.service.replica_policy),
            version: latest.version,
        };
        Ok(Self {
            storage: LocalStorageCleaner::new(config.clone()),
            service_name,
            store,
            replicas,
            config,
            scaling: Mutex::new(scaling),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn replica_manager(&self) -> &ReplicaManager {
        &self.replicas
    }

    /// Reconcile with the state store after a (re)start.
    ///
    /// Resumes unfinished replica operations and seeds the autoscaler with
    /// the replicas already running, so a restart does not scale down.
    pub fn start(&self) -> ControllerResult<()> {
        let recovered = self.replicas.recover()?;
        let version = self.lock_scaling().version;
        let running = self
            .replicas
            .replicas()?
            .iter()
            .filter(|r| r.is_alive() && r.version == version)
            .count() as u32;

        let mut scaling = self.lock_scaling();
        scaling.autoscaler.resume_at(running);
        info!(
            service = %self.service_name,
            version,
            recovered,
            target = scaling.autoscaler.target(),
            "controller started"
        );
        Ok(())
    }

    /// One pass of the control loop.
    pub async fn tick(&self) -> ControllerResult<()> {
        let name = &self.service_name;
        let status = self.store.service_status(name)?;
        if !status.is_live() {
            debug!(service = %name, %status, "service not live, skipping tick");
            return Ok(());
        }

        self.replicas.probe_replicas(PROBE_FAILURE_THRESHOLD).await?;

        let latest = latest_version_record(&self.store, name)?;
        let target = {
            let mut scaling = self.lock_scaling();
            if scaling.version != latest.version {
                scaling
                    .autoscaler
                    .update_policy(&latest.task.service.replica_policy);
                scaling.version = latest.version;
            }
            scaling.autoscaler.evaluate(now_secs());
            scaling.autoscaler.target()
        };

        let strategy = RolloutStrategy::from(latest.update_mode);
        let tick = plan(&strategy, latest.version, target, &self.replicas.replicas()?);

        for &id in &tick.terminate {
            if let Err(e) = self.replicas.terminate_replica(id) {
                warn!(service = %name, replica_id = id, error = %e, "failed to start teardown");
            }
        }

        let service = self
            .store
            .get_service(name)?
            .ok_or_else(|| ControllerError::ServiceNotFound(name.clone()))?;
        let max_failures = self.config.max_consecutive_launch_failures;
        let blocked = service.consecutive_launch_failures >= max_failures;

        if tick.launch > 0 {
            if blocked {
                error!(
                    service = %name,
                    failures = service.consecutive_launch_failures,
                    max_failures,
                    pending = tick.launch,
                    "launch failure limit reached, not launching"
                );
            } else {
                for _ in 0..tick.launch {
                    if let Err(e) = self.replicas.launch_replica(&latest) {
                        warn!(service = %name, error = %e, "failed to start launch");
                        break;
                    }
                }
            }
        }

        if service.active_versions != tick.serving_versions {
            self.store
                .set_active_versions(name, &tick.serving_versions)?;
            info!(service = %name, versions = ?tick.serving_versions, "serving versions changed");
        }

        let replicas = self.replicas.replicas()?;
        let next = derive_status(status, &tick.phase, target, &replicas, blocked);
        if next != status {
            match self.store.set_service_status(name, next) {
                Ok(_) => info!(service = %name, from = %status, to = %next, "service status changed"),
                // The supervisor started shutting the service down meanwhile.
                Err(StateError::InvalidTransition { from, .. }) => {
                    debug!(service = %name, %from, to = %next, "status change superseded");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// URLs the load balancer may route to.
    ///
    /// Replicas of versions outside the service's active set are excluded,
    /// which keeps a blue-green update's new replicas dark until the switch.
    pub fn ready_urls(&self) -> ControllerResult<Vec<String>> {
        let service = self
            .store
            .get_service(&self.service_name)?
            .ok_or_else(|| ControllerError::ServiceNotFound(self.service_name.clone()))?;
        let active = service.active_versions;

        Ok(self
            .replicas
            .replicas()?
            .into_iter()
            .filter(ReplicaInfo::is_routable)
            .filter(|r| active.is_empty() || active.contains(&r.version))
            .filter_map(|r| r.url())
            .collect())
    }

    /// Take request timestamps from the load balancer and answer with the
    /// current ready set.
    pub fn record_lb_sync(&self, timestamps: &[f64]) -> ControllerResult<Vec<String>> {
        if !timestamps.is_empty() {
            self.lock_scaling().autoscaler.record_requests(timestamps);
            debug!(service = %self.service_name, requests = timestamps.len(), "load balancer sync");
        }
        self.ready_urls()
    }

    pub fn status_report(&self) -> ControllerResult<StatusReport> {
        let name = &self.service_name;
        let service = self
            .store
            .get_service(name)?
            .ok_or_else(|| ControllerError::ServiceNotFound(name.clone()))?;
        let versions = self
            .store
            .list_versions(name)?
            .iter()
            .map(VersionSummary::from)
            .collect();
        let replicas = self
            .replicas
            .replicas()?
            .iter()
            .map(ReplicaSummary::from)
            .collect();

        let mut scaling = self.lock_scaling();
        Ok(StatusReport {
            service,
            versions,
            replicas,
            target_replicas: scaling.autoscaler.target(),
            qps: scaling.autoscaler.qps(now_secs()),
        })
    }

    /// Register a new version from task TOML and start rolling towards it.
    pub fn update_service(&self, task_toml: &str, mode: UpdateMode) -> ControllerResult<VersionNumber> {
        let name = &self.service_name;
        let task = ServiceTask::from_toml_str(task_toml)?;

        let status = self.store.service_status(name)?;
        if !status.is_live() {
            return Err(ControllerError::NotAccepting {
                service: name.clone(),
                status,
            });
        }

        let version = self
            .store
            .latest_version(name)?
            .ok_or_else(|| ControllerError::NoVersion(name.clone()))?
            + 1;

        // Claim the number before touching its files, so a concurrent
        // update that lost the race never overwrites them.
        let record = VersionRecord {
            service_name: name.clone(),
            version,
            task: task.clone(),
            task_path: self.config.task_path(name, version),
            update_mode: mode,
            created_at: epoch_secs(),
        };
        if !self.store.add_version(&record)? {
            return Err(ControllerError::VersionConflict {
                service: name.clone(),
                version,
            });
        }
        if let Err(e) = self.freeze_version(&record, task_toml) {
            error!(service = %name, version, error = %e, "failed to freeze version, withdrawing it");
            if let Err(e) = self.store.remove_version(name, version) {
                warn!(service = %name, version, error = %e, "failed to withdraw version");
            }
            return Err(e);
        }

        // A new version gets a fresh launch failure budget.
        self.store.record_launch_outcome(name, true)?;
        self.store.set_service_descriptors(name, &task)?;
        if let Err(e) = self.store.set_service_status(name, ServiceStatus::Updating) {
            debug!(service = %name, error = %e, "status not moved to UPDATING");
        }

        info!(service = %name, version, ?mode, "new version registered");
        Ok(version)
    }

    /// Write the task file and stage file mounts of a freshly claimed
    /// version. Whatever this call created is removed again on failure.
    fn freeze_version(&self, record: &VersionRecord, task_toml: &str) -> ControllerResult<()> {
        let name = &record.service_name;
        if let Some(dir) = record.task_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&record.task_path)?;

        let staged = file
            .write_all(task_toml.as_bytes())
            .and_then(|()| file.sync_all())
            .and_then(|()| self.storage.stage(name, record.version, &record.task).map(|_| ()));
        if let Err(e) = staged {
            let _ = std::fs::remove_file(&record.task_path);
            let _ = std::fs::remove_dir_all(self.config.storage_dir(name, record.version));
            return Err(e.into());
        }
        Ok(())
    }

    /// Manually tear down one replica. The next tick replaces it if the
    /// target still calls for it.
    pub fn terminate_replica(&self, id: ReplicaId) -> ControllerResult<()> {
        if self.store.get_replica(&self.service_name, id)?.is_none() {
            return Err(ControllerError::ReplicaNotFound(id));
        }
        self.replicas.terminate_replica(id)?;
        info!(service = %self.service_name, replica_id = id, "replica termination requested");
        Ok(())
    }

    /// Run the control loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            service = %self.service_name,
            interval_ms = interval.as_millis() as u64,
            "controller loop started"
        );

        loop {
            if let Err(e) = self.tick().await {
                error!(service = %self.service_name, error = %e, "controller tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!(service = %self.service_name, "controller loop shutting down");
                    break;
                }
            }
        }
    }

    fn lock_scaling(&self) -> MutexGuard<'_, Scaling> {
        self.scaling
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Serve the controller API on `listener` and run the control loop beside
/// it until `shutdown` fires.
pub async fn serve(
    controller: Arc<Controller>,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) -> ControllerResult<()> {
    controller.start()?;

    let addr = listener.local_addr()?;
    info!(service = %controller.service_name, %addr, "controller API listening");

    let interval = controller.config.autoscaler_interval();
    let loop_handle = tokio::spawn(Arc::clone(&controller).run(interval, shutdown.clone()));

    let router = crate::api::build_router(Arc::clone(&controller));
    let mut server_shutdown = shutdown;
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await;

    if let Err(e) = loop_handle.await {
        error!(service = %controller.service_name, error = %e, "controller loop panicked");
    }
    served?;

    info!(service = %controller.service_name, "controller stopped");
    Ok(())
}

fn latest_version_record(store: &StateStore, service: &str) -> ControllerResult<VersionRecord> {
    let latest = store
        .latest_version(service)?
        .ok_or_else(|| ControllerError::NoVersion(service.to_string()))?;
    store
        .get_version(service, latest)?
        .ok_or_else(|| ControllerError::NoVersion(service.to_string()))
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::constants::INITIAL_VERSION;
    use fleet_replica::mock::MockProvisioner;
    use fleet_state::{HealthStatus, ProcessStatus, ServiceRecord};

    const TASK: &str = "[service]\nreplica_port = 8080\n\n[service.replica_policy]\nmin_replicas = 2\n";

    struct Fixture {
        controller: Controller,
        store: StateStore,
        provisioner: Arc<MockProvisioner>,
        _dir: tempfile::TempDir,
    }

    fn fixture(task: &str, provisioner: MockProvisioner) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = ServeConfig {
            max_consecutive_launch_failures: 2,
            ..ServeConfig::with_state_dir(dir.path())
        };
        let store = StateStore::open_in_memory().unwrap();
        let parsed = ServiceTask::from_toml_str(task).unwrap();
        assert!(store.add_service(&ServiceRecord::new("svc", &parsed)).unwrap());
        store
            .add_version(&VersionRecord {
                service_name: "svc".to_string(),
                version: INITIAL_VERSION,
                task: parsed,
                task_path: config.task_path("svc", INITIAL_VERSION),
                update_mode: UpdateMode::Rolling,
                created_at: epoch_secs(),
            })
            .unwrap();

        let provisioner = Arc::new(provisioner);
        let replicas = ReplicaManager::new("svc", store.clone(), provisioner.clone());
        let controller = Controller::new("svc", store.clone(), replicas, config).unwrap();
        Fixture {
            controller,
            store,
            provisioner,
            _dir: dir,
        }
    }

    async fn settle(f: &Fixture) {
        f.controller.tick().await.unwrap();
        f.controller.replica_manager().wait_idle().await;
    }

    #[tokio::test]
    async fn tick_launches_up_to_min_replicas() {
        let f = fixture(TASK, MockProvisioner::new());
        settle(&f).await;

        let replicas = f.store.list_replicas("svc").unwrap();
        assert_eq!(replicas.len(), 2);
        assert!(replicas.iter().all(|r| r.launch_status == ProcessStatus::Succeeded));

        // Second tick sees the replicas ready and reports READY.
        settle(&f).await;
        assert_eq!(f.store.service_status("svc").unwrap(), ServiceStatus::Ready);
        assert_eq!(f.provisioner.launch_count(), 2);
        assert_eq!(
            f.store.get_service("svc").unwrap().unwrap().active_versions,
            vec![1]
        );
    }

    #[tokio::test]
    async fn endpoints_list_only_routable_replicas() {
        let f = fixture(TASK, MockProvisioner::new());
        settle(&f).await;

        let mut urls = f.controller.ready_urls().unwrap();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "http://svc-1.mock:8080".to_string(),
                "http://svc-2.mock:8080".to_string()
            ]
        );

        f.store
            .update_replica("svc", 1, |r| r.health = HealthStatus::Unhealthy)
            .unwrap();
        assert_eq!(f.controller.ready_urls().unwrap(), vec!["http://svc-2.mock:8080"]);
    }

    #[tokio::test]
    async fn launch_failures_are_retried_then_bounded() {
        let provisioner = MockProvisioner::new();
        provisioner.fail_all_launches(true);
        let f = fixture(TASK, provisioner);

        settle(&f).await;
        assert_eq!(f.provisioner.launch_count(), 2);
        // Failed launches are torn down and removed.
        assert!(f.store.list_replicas("svc").unwrap().is_empty());
        assert!(f.provisioner.live_clusters().is_empty());

        settle(&f).await;
        assert_eq!(f.provisioner.launch_count(), 2);
        assert_eq!(f.store.service_status("svc").unwrap(), ServiceStatus::Failed);

        // A new version resets the budget.
        f.provisioner.fail_all_launches(false);
        f.controller.update_service(TASK, UpdateMode::Rolling).unwrap();
        settle(&f).await;
        assert_eq!(f.provisioner.launch_count(), 4);
    }

    #[tokio::test]
    async fn rolling_update_replaces_old_version() {
        let f = fixture(TASK, MockProvisioner::new());
        settle(&f).await;
        settle(&f).await;

        let version = f.controller.update_service(TASK, UpdateMode::Rolling).unwrap();
        assert_eq!(version, 2);
        assert_eq!(f.store.service_status("svc").unwrap(), ServiceStatus::Updating);

        for _ in 0..6 {
            settle(&f).await;
        }

        let replicas = f.store.list_replicas("svc").unwrap();
        assert_eq!(replicas.len(), 2);
        assert!(replicas.iter().all(|r| r.version == 2));
        assert_eq!(f.store.service_status("svc").unwrap(), ServiceStatus::Ready);
        assert_eq!(
            f.store.get_service("svc").unwrap().unwrap().active_versions,
            vec![2]
        );
    }

    #[tokio::test]
    async fn rolling_update_never_drops_below_ready_count() {
        let f = fixture(TASK, MockProvisioner::new());
        settle(&f).await;
        f.controller.update_service(TASK, UpdateMode::Rolling).unwrap();

        for _ in 0..6 {
            f.controller.tick().await.unwrap();
            let ready = f
                .store
                .list_replicas("svc")
                .unwrap()
                .iter()
                .filter(|r| r.is_routable())
                .count();
            assert!(ready >= 2, "only {ready} routable replicas mid-rollout");
            f.controller.replica_manager().wait_idle().await;
        }
    }

    #[tokio::test]
    async fn blue_green_keeps_new_replicas_dark_until_switch() {
        let f = fixture(TASK, MockProvisioner::new());
        settle(&f).await;

        f.controller.update_service(TASK, UpdateMode::BlueGreen).unwrap();
        settle(&f).await;

        // Four replicas exist; only the old ones serve.
        assert_eq!(f.store.list_replicas("svc").unwrap().len(), 4);
        let urls = f.controller.ready_urls().unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls.iter().all(|u| u.contains("svc-1") || u.contains("svc-2")));

        settle(&f).await;
        let mut urls = f.controller.ready_urls().unwrap();
        urls.sort();
        assert_eq!(urls, vec!["http://svc-3.mock:8080", "http://svc-4.mock:8080"]);
    }

    #[tokio::test]
    async fn update_rejects_invalid_task() {
        let f = fixture(TASK, MockProvisioner::new());
        let err = f
            .controller
            .update_service("[service]\nreadiness_path = \"nope\"\n", UpdateMode::Rolling)
            .unwrap_err();
        assert!(matches!(err, ControllerError::Config(_)));
        assert_eq!(f.store.latest_version("svc").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn update_freezes_task_file() {
        let f = fixture(TASK, MockProvisioner::new());
        let version = f.controller.update_service(TASK, UpdateMode::Rolling).unwrap();
        let record = f.store.get_version("svc", version).unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(&record.task_path).unwrap(), TASK);
    }

    #[test]
    fn concurrent_updates_keep_each_version_file_intact() {
        let f = fixture(TASK, MockProvisioner::new());
        let tasks: Vec<String> = (3..9)
            .map(|n| format!("[service]\nreplica_port = 8080\n\n[service.replica_policy]\nmin_replicas = {n}\n"))
            .collect();

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = tasks
                .iter()
                .map(|task| {
                    let controller = &f.controller;
                    scope.spawn(move || controller.update_service(task, UpdateMode::Rolling))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let registered = results.iter().filter(|r| r.is_ok()).count();
        assert!(registered >= 1);
        for result in &results {
            if let Err(e) = result {
                assert!(matches!(e, ControllerError::VersionConflict { .. }), "{e}");
            }
        }

        let versions: Vec<_> = f
            .store
            .list_versions("svc")
            .unwrap()
            .into_iter()
            .filter(|v| v.version > INITIAL_VERSION)
            .collect();
        assert_eq!(versions.len(), registered);
        for record in versions {
            let frozen = ServiceTask::from_file(&record.task_path).unwrap();
            assert_eq!(frozen, record.task, "version {}", record.version);
        }
    }

    #[test]
    fn existing_task_file_is_never_overwritten() {
        let f = fixture(TASK, MockProvisioner::new());
        let path = f.controller.config.task_path("svc", 2);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "left behind").unwrap();

        let err = f.controller.update_service(TASK, UpdateMode::Rolling).unwrap_err();
        assert!(matches!(err, ControllerError::Io(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "left behind");
        assert_eq!(f.store.latest_version("svc").unwrap(), Some(INITIAL_VERSION));
    }

    #[tokio::test]
    async fn shutting_down_service_is_left_alone() {
        let f = fixture(TASK, MockProvisioner::new());
        f.store
            .set_service_status("svc", ServiceStatus::ShuttingDown)
            .unwrap();

        settle(&f).await;
        assert_eq!(f.provisioner.launch_count(), 0);

        let err = f.controller.update_service(TASK, UpdateMode::Rolling).unwrap_err();
        assert!(matches!(err, ControllerError::NotAccepting { .. }));
    }

    #[tokio::test]
    async fn restart_resumes_running_replicas() {
        let autoscaled = "[service]\nreplica_port = 8080\n\n[service.replica_policy]\n\
                          min_replicas = 1\nmax_replicas = 5\ntarget_qps_per_replica = 1.0\n\
                          downscale_delay_seconds = 600\n";
        let f = fixture(autoscaled, MockProvisioner::new());
        for id in 1..=3 {
            let mut info = ReplicaInfo::new("svc", f.store.allocate_replica_id("svc").unwrap(), 1);
            info.launch_status = ProcessStatus::Succeeded;
            info.endpoint = Some(format!("10.0.0.{id}:8080"));
            info.health = HealthStatus::Healthy;
            f.store.put_replica(&info).unwrap();
        }

        f.controller.start().unwrap();
        settle(&f).await;

        assert!(f.provisioner.terminated().is_empty());
        assert_eq!(f.store.list_replicas("svc").unwrap().len(), 3);
        assert_eq!(f.controller.status_report().unwrap().target_replicas, 3);
    }

    #[tokio::test]
    async fn manual_termination_is_replaced() {
        let f = fixture(TASK, MockProvisioner::new());
        settle(&f).await;

        f.controller.terminate_replica(1).unwrap();
        f.controller.replica_manager().wait_idle().await;
        assert!(f.store.get_replica("svc", 1).unwrap().is_none());

        settle(&f).await;
        assert_eq!(f.store.list_replicas("svc").unwrap().len(), 2);

        let err = f.controller.terminate_replica(1).unwrap_err();
        assert!(matches!(err, ControllerError::ReplicaNotFound(1)));
    }

    #[tokio::test]
    async fn sync_feeds_autoscaler() {
        let f = fixture(TASK, MockProvisioner::new());
        let now = now_secs();
        let stamps: Vec<f64> = (0..120).map(|i| now - i as f64 * 0.25).collect();
        f.controller.record_lb_sync(&stamps).unwrap();

        let report = f.controller.status_report().unwrap();
        assert!((report.qps - 2.0).abs() < 1e-9);
        assert_eq!(report.versions.len(), 1);
    }
}
