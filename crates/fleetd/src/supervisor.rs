//! The per-service supervisor.
//!
//! One supervisor owns one service from admission to removal. It decides
//! between first run and recovery, binds the service's ports, keeps the
//! controller and load balancer running, waits for a terminate signal,
//! and finally reclaims every replica and file the service created.
//!
//! Cleanup runs on every exit path once the service name is reserved. It
//! is the only place rows of a service are deleted.

use std::future::Future;
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fleet_controller::{Controller, ControllerClient};
use fleet_core::constants::INITIAL_VERSION;
use fleet_core::{LoadBalancingPolicyId, ServeConfig, ServiceTask, validate_service_name};
use fleet_lb::LoadBalancer;
use fleet_replica::{LocalStorageCleaner, Provisioner, ReplicaManager, StorageCleaner};
use fleet_state::{
    ServiceRecord, ServiceStatus, StateError, StateStore, UpdateMode, VersionRecord, epoch_secs,
};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::ports::{self, ServicePorts};
use crate::signal::{SignalChannel, UserSignal};

/// Pause before restarting a crashed component, multiplied by the
/// number of restarts so far.
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// A component that stayed up this long has its restart count reset.
const STABLE_RUN: Duration = Duration::from_secs(60);

/// How a supervised service ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Every replica, file, and row is gone.
    Removed,
    /// Something could not be reclaimed; rows were kept for inspection.
    FailedCleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComponentExit {
    Stopped,
    GaveUp,
}

pub struct Supervisor {
    service_name: String,
    config: ServeConfig,
    store: StateStore,
    provisioner: Arc<dyn Provisioner>,
    storage: Arc<dyn StorageCleaner>,
}

impl Supervisor {
    pub fn new(
        service_name: impl Into<String>,
        config: ServeConfig,
        store: StateStore,
        provisioner: Arc<dyn Provisioner>,
        storage: Arc<dyn StorageCleaner>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            config,
            store,
            provisioner,
            storage,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The channel operators use to signal this service.
    pub fn signals(&self) -> SignalChannel {
        SignalChannel::new(self.config.signal_path(&self.service_name))
    }

    /// Supervise the service until it is removed or cleanup fails.
    ///
    /// Without a row for the service this is a first run and `staged_task`
    /// is required. With a row, the service is recovered from the store
    /// and `staged_task` is discarded. Admission errors return before any
    /// state is created; anything later ends in cleanup.
    pub async fn run(&self, staged_task: Option<&Path>) -> SupervisorResult<ServiceOutcome> {
        let name = &self.service_name;
        if let Err(e) = validate_service_name(name) {
            if let Some(staged) = staged_task {
                discard_staged(staged);
            }
            return Err(e.into());
        }
        let replicas = ReplicaManager::new(
            name.clone(),
            self.store.clone(),
            Arc::clone(&self.provisioner),
        );

        match self.store.get_service(name)? {
            None => {
                let staged = staged_task.ok_or_else(|| SupervisorError::MissingTask(name.clone()))?;
                let version = self.admit(staged)?;
                info!(service = %name, version = version.version, "service admitted");
            }
            Some(record) => {
                if let Some(staged) = staged_task {
                    warn!(service = %name, "service exists, ignoring task file (use `fleetd update`)");
                    discard_staged(staged);
                }
                if !record.status.is_live() {
                    warn!(service = %name, status = %record.status, "resuming interrupted cleanup");
                    replicas.recover()?;
                    return self.cleanup(&replicas).await;
                }
                let latest = self
                    .store
                    .latest_version(name)?
                    .ok_or_else(|| SupervisorError::NoVersion(name.clone()))?;
                info!(service = %name, version = latest, status = %record.status, "recovering service");
            }
        }

        if let Err(e) = self.serve(&replicas).await {
            error!(service = %name, error = %e, "service stopped on error");
        }
        self.cleanup(&replicas).await
    }

    /// First-run admission.
    ///
    /// Validates the name, enforces the service ceiling, reserves the
    /// name, registers the initial version, and only then moves the staged
    /// task file into the service directory. On failure the staged file is
    /// removed and no row is left behind.
    pub fn admit(&self, staged: &Path) -> SupervisorResult<VersionRecord> {
        let name = &self.service_name;
        if let Err(e) = validate_service_name(name) {
            discard_staged(staged);
            return Err(e.into());
        }
        let task = match ServiceTask::from_file(staged) {
            Ok(task) => task,
            Err(e) => {
                discard_staged(staged);
                return Err(e.into());
            }
        };

        let count = self.store.count_services()?;
        if count >= self.config.max_services {
            warn!(service = %name, count, max = self.config.max_services, "service ceiling reached");
            discard_staged(staged);
            return Err(SupervisorError::CeilingReached {
                max: self.config.max_services,
            });
        }

        if !self.store.add_service(&ServiceRecord::new(name, &task))? {
            discard_staged(staged);
            return Err(SupervisorError::AlreadyExists(name.clone()));
        }

        // The name is ours from here on, so nothing else writes these files.
        let version = VersionRecord {
            service_name: name.clone(),
            version: INITIAL_VERSION,
            task,
            task_path: self.config.task_path(name, INITIAL_VERSION),
            update_mode: UpdateMode::Rolling,
            created_at: epoch_secs(),
        };
        if let Err(e) = self.register_initial_version(staged, &version) {
            error!(service = %name, error = %e, "admission failed after reserving name");
            discard_staged(staged);
            self.release_reservation();
            return Err(e);
        }
        Ok(version)
    }

    fn register_initial_version(&self, staged: &Path, version: &VersionRecord) -> SupervisorResult<()> {
        let name = &self.service_name;
        if !self.store.add_version(version)? {
            return Err(SupervisorError::StaleVersions(name.clone()));
        }
        std::fs::create_dir_all(self.config.service_dir(name))?;
        std::fs::copy(staged, &version.task_path)?;
        LocalStorageCleaner::new(self.config.clone()).stage(name, version.version, &version.task)?;
        discard_staged(staged);
        debug!(service = %name, task = %version.task_path.display(), "task file frozen");
        Ok(())
    }

    /// Undo a half-finished admission.
    fn release_reservation(&self) {
        let name = &self.service_name;
        if let Err(e) = self.store.remove_versions(name) {
            warn!(service = %name, error = %e, "failed to remove versions");
        }
        if let Err(e) = self.store.remove_service(name) {
            warn!(service = %name, error = %e, "failed to release service name");
        }
        remove_dir(&self.config.service_dir(name));
        remove_dir(&self.config.storage_dir(name, INITIAL_VERSION));
    }

    /// Bind ports, run both components, and wait for a terminate signal
    /// or a component that keeps crashing. Both components are stopped
    /// before this returns, the load balancer first.
    async fn serve(&self, replicas: &ReplicaManager) -> SupervisorResult<()> {
        let name = &self.service_name;
        let ports = {
            let (config, store, name) = (self.config.clone(), self.store.clone(), name.clone());
            tokio::task::spawn_blocking(move || ports::bind_service_ports(&config, &store, &name))
                .await
                .map_err(io::Error::other)??
        };
        let record = self
            .store
            .get_service(name)?
            .ok_or_else(|| StateError::NotFound(name.clone()))?;
        let latest = match self.store.latest_version(name)? {
            Some(version) => self.store.get_version(name, version)?,
            None => None,
        }
        .ok_or_else(|| SupervisorError::NoVersion(name.clone()))?;
        let tls = match &latest.task.service.tls {
            Some(credential) => Some(fleet_lb::load_tls_acceptor(credential)?),
            None => None,
        };

        let (failed_tx, mut failed_rx) = mpsc::channel(2);
        let (ctrl_tx, ctrl_rx) = watch::channel(false);
        let (lb_tx, lb_rx) = watch::channel(false);
        let controller_address = self.controller_address(ports.controller_port()?);
        let ServicePorts {
            controller,
            load_balancer,
        } = ports;

        let controller_task = self.spawn_controller(controller, replicas.clone(), ctrl_rx, failed_tx.clone())?;
        let lb_task = self.spawn_load_balancer(
            load_balancer,
            record.load_balancing_policy,
            tls,
            controller_address,
            lb_rx,
            failed_tx,
        )?;

        let waited = self.wait_for_termination(&mut failed_rx).await;

        // The load balancer goes first so it never syncs against a
        // controller that is already gone.
        let _ = lb_tx.send(true);
        if let Err(e) = lb_task.await {
            error!(service = %name, error = %e, "load balancer supervisor panicked");
        }
        let _ = ctrl_tx.send(true);
        if let Err(e) = controller_task.await {
            error!(service = %name, error = %e, "controller supervisor panicked");
        }
        info!(service = %name, "components stopped");
        waited
    }

    fn spawn_controller(
        &self,
        listener: TcpListener,
        replicas: ReplicaManager,
        shutdown: watch::Receiver<bool>,
        failed: mpsc::Sender<&'static str>,
    ) -> SupervisorResult<tokio::task::JoinHandle<()>> {
        let port = listener.local_addr()?.port();
        let mut first = Some(listener);
        let host = self.config.controller_host();
        let (name, store, config) = (self.service_name.clone(), self.store.clone(), self.config.clone());
        let start_shutdown = shutdown.clone();

        let start = move || {
            let listener = first.take();
            let (name, store, config, host) = (name.clone(), store.clone(), config.clone(), host.clone());
            let (replicas, shutdown) = (replicas.clone(), start_shutdown.clone());
            async move {
                let listener = match listener {
                    Some(listener) => listener,
                    None => ports::bind_port(&host, port)?,
                };
                let controller = Arc::new(Controller::new(name, store, replicas, config)?);
                fleet_controller::serve(controller, into_tokio(listener)?, shutdown).await?;
                Ok(())
            }
        };

        Ok(self.spawn_supervised("controller", shutdown, failed, start))
    }

    fn spawn_load_balancer(
        &self,
        listener: TcpListener,
        policy: LoadBalancingPolicyId,
        tls: Option<TlsAcceptor>,
        controller_address: String,
        shutdown: watch::Receiver<bool>,
        failed: mpsc::Sender<&'static str>,
    ) -> SupervisorResult<tokio::task::JoinHandle<()>> {
        let port = listener.local_addr()?.port();
        let mut first = Some(listener);
        let name = self.service_name.clone();
        let interval = self.config.lb_sync_interval();
        let max_body_bytes = self.config.lb_max_body_bytes;
        let start_shutdown = shutdown.clone();

        let start = move || {
            let listener = first.take();
            let client = ControllerClient::new(controller_address.clone());
            let lb = Arc::new(
                LoadBalancer::new(name.clone(), fleet_lb::policy_for(policy))
                    .with_controller(client.clone())
                    .with_max_body_bytes(max_body_bytes),
            );
            let (tls, shutdown) = (tls.clone(), start_shutdown.clone());
            async move {
                let listener = match listener {
                    Some(listener) => listener,
                    None => ports::bind_port(ports::LOAD_BALANCER_HOST, port)?,
                };
                fleet_lb::serve(lb, into_tokio(listener)?, tls, client, interval, shutdown).await?;
                Ok(())
            }
        };

        Ok(self.spawn_supervised("load balancer", shutdown, failed, start))
    }

    fn spawn_supervised<F, Fut>(
        &self,
        component: &'static str,
        shutdown: watch::Receiver<bool>,
        failed: mpsc::Sender<&'static str>,
        start: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = SupervisorResult<()>> + Send + 'static,
    {
        let service = self.service_name.clone();
        let limit = self.config.controller_restart_limit;
        tokio::spawn(async move {
            if supervise(component, &service, limit, shutdown, start).await == ComponentExit::GaveUp {
                let _ = failed.send(component).await;
            }
        })
    }

    /// Poll the signal channel until a terminate signal arrives.
    async fn wait_for_termination(
        &self,
        failures: &mut mpsc::Receiver<&'static str>,
    ) -> SupervisorResult<()> {
        let name = &self.service_name;
        let signals = self.signals();
        let interval = self.config.signal_poll_interval();
        info!(service = %name, signal = %signals.path().display(), "waiting for signals");

        loop {
            // Polling takes the signal file lock, which blocks.
            let polled = {
                let signals = signals.clone();
                tokio::task::spawn_blocking(move || signals.poll())
                    .await
                    .map_err(io::Error::other)?
            };
            match polled {
                Ok(Some(UserSignal::Terminate)) => {
                    info!(service = %name, "terminate signal received");
                    self.mark_shutting_down().await?;
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => warn!(service = %name, error = %e, "failed to read signal"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                Some(component) = failures.recv() => {
                    return Err(SupervisorError::ComponentFailed(component));
                }
            }
        }
    }

    /// Runs off the runtime: a shared store may wait for another process
    /// to release the database.
    async fn mark_shutting_down(&self) -> SupervisorResult<()> {
        let (store, name) = (self.store.clone(), self.service_name.clone());
        let marked = tokio::task::spawn_blocking(move || {
            store.set_service_status(&name, ServiceStatus::ShuttingDown)
        })
        .await
        .map_err(io::Error::other)?;
        match marked {
            Ok(_) => Ok(()),
            Err(StateError::InvalidTransition { from, .. }) => {
                debug!(service = %self.service_name, %from, "status kept during shutdown");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reclaim everything the service owns.
    ///
    /// Every replica is torn down concurrently and every version's storage
    /// is cleaned, even after a failure. Only when all of it succeeded are
    /// the service directory and the rows removed. Otherwise the service
    /// is left in `FAILED_CLEANUP` with the failed replica rows in place.
    pub async fn cleanup(&self, replicas: &ReplicaManager) -> SupervisorResult<ServiceOutcome> {
        let name = &self.service_name;
        self.mark_shutting_down().await?;
        info!(service = %name, "cleaning up service");

        let replicas_failed = match replicas.terminate_all().await {
            Ok(any_failed) => any_failed,
            Err(e) => {
                error!(service = %name, error = %e, "replica teardown failed");
                true
            }
        };

        let versions = self.store.list_versions(name)?;
        let storage_failed = versions
            .iter()
            .map(|version| self.storage.cleanup(version))
            .fold(false, |failed, ok| failed || !ok);

        if replicas_failed || storage_failed {
            error!(
                service = %name,
                replicas_failed,
                storage_failed,
                "cleanup incomplete, keeping service rows for inspection"
            );
            self.store.set_service_status(name, ServiceStatus::FailedCleanup)?;
            return Ok(ServiceOutcome::FailedCleanup);
        }

        let service_dir = self.config.service_dir(name);
        match std::fs::remove_dir_all(&service_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(service = %name, dir = %service_dir.display(), error = %e, "failed to remove service directory");
                self.store.set_service_status(name, ServiceStatus::FailedCleanup)?;
                return Ok(ServiceOutcome::FailedCleanup);
            }
        }
        self.signals().clear();

        match self.store.set_service_status(name, ServiceStatus::Removed) {
            Ok(_) => {}
            Err(StateError::InvalidTransition { from, .. }) => {
                debug!(service = %name, %from, "removing service without status change");
            }
            Err(e) => return Err(e.into()),
        }
        self.store.remove_versions(name)?;
        self.store.remove_service(name)?;
        info!(service = %name, "service removed");
        Ok(ServiceOutcome::Removed)
    }

    /// Address a local client uses to reach the controller.
    fn controller_address(&self, port: u16) -> String {
        match self.config.controller_host().as_str() {
            "0.0.0.0" => format!("127.0.0.1:{port}"),
            host => format!("{host}:{port}"),
        }
    }
}

/// Copy a task file into the staging area ahead of admission.
///
/// Admission consumes the staged copy, so the caller's file is never
/// moved or deleted.
pub fn stage_task(config: &ServeConfig, service: &str, task: &Path) -> SupervisorResult<PathBuf> {
    validate_service_name(service)?;
    let dir = config.staging_dir();
    std::fs::create_dir_all(&dir)?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let staged = dir.join(format!("{service}-{}-{nanos}.toml", std::process::id()));
    std::fs::copy(task, &staged)?;
    Ok(staged)
}

/// Keep one component running, restarting it after crashes.
///
/// Gives up after `limit` restarts in a row; a run longer than
/// [`STABLE_RUN`] starts the count over.
async fn supervise<F, Fut>(
    component: &'static str,
    service: &str,
    limit: u32,
    mut shutdown: watch::Receiver<bool>,
    mut start: F,
) -> ComponentExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SupervisorResult<()>> + Send + 'static,
{
    let mut restarts = 0u32;
    loop {
        let started = Instant::now();
        let result = tokio::spawn(start()).await;
        if *shutdown.borrow() {
            return ComponentExit::Stopped;
        }

        match result {
            Ok(Ok(())) => warn!(%service, component, "exited unexpectedly"),
            Ok(Err(e)) => error!(%service, component, error = %e, "crashed"),
            Err(e) => error!(%service, component, error = %e, "panicked"),
        }

        if started.elapsed() >= STABLE_RUN {
            restarts = 0;
        }
        if restarts >= limit {
            error!(%service, component, restarts, "restart limit reached, giving up");
            return ComponentExit::GaveUp;
        }
        restarts += 1;

        tokio::select! {
            _ = tokio::time::sleep(RESTART_BACKOFF * restarts) => {}
            _ = shutdown.changed() => return ComponentExit::Stopped,
        }
        warn!(%service, component, restarts, "restarting");
    }
}

fn into_tokio(listener: TcpListener) -> io::Result<tokio::net::TcpListener> {
    listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(listener)
}

fn discard_staged(staged: &Path) {
    match std::fs::remove_file(staged) {
        Ok(()) => debug!(path = %staged.display(), "staged task removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staged.display(), error = %e, "failed to remove staged task"),
    }
}

fn remove_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove directory"),
    }
}
