//! End-to-end supervisor scenarios against the mock provisioner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_controller::ControllerClient;
use fleet_core::{ConfigError, ServeConfig};
use fleet_core::constants::INITIAL_VERSION;
use fleet_replica::mock::{MockProvisioner, MockStorageCleaner};
use fleet_state::{
    ProcessStatus, ReplicaInfo, ServiceRecord, ServiceStatus, StateStore, UpdateMode,
    VersionRecord,
};
use fleetd::{ServiceOutcome, Supervisor, SupervisorError, UserSignal};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

struct Harness {
    dir: tempfile::TempDir,
    config: ServeConfig,
    store: StateStore,
    provisioner: Arc<MockProvisioner>,
    storage: Arc<MockStorageCleaner>,
}

impl Harness {
    fn new(provisioner: MockProvisioner) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServeConfig::with_state_dir(dir.path());
        config.controller_host = Some("127.0.0.1".to_string());
        config.controller_port_start = 42_000;
        config.load_balancer_port_start = 43_000;
        config.signal_poll_interval_ms = 20;
        config.autoscaler_interval_ms = 50;
        config.lb_sync_interval_ms = 50;
        Self {
            dir,
            config,
            store: StateStore::open_in_memory().unwrap(),
            provisioner: Arc::new(provisioner),
            storage: Arc::new(MockStorageCleaner::new()),
        }
    }

    fn supervisor(&self, name: &str) -> Supervisor {
        Supervisor::new(
            name,
            self.config.clone(),
            self.store.clone(),
            self.provisioner.clone(),
            self.storage.clone(),
        )
    }

    /// Write a task asking for `replicas` fixed replicas and stage it.
    fn stage(&self, name: &str, replicas: u32) -> PathBuf {
        let source = self.dir.path().join(format!("{name}.toml"));
        std::fs::write(&source, task_toml(replicas)).unwrap();
        fleetd::stage_task(&self.config, name, &source).unwrap()
    }

    fn launch(&self, name: &str, replicas: u32) -> JoinHandle<Result<ServiceOutcome, SupervisorError>> {
        let staged = self.stage(name, replicas);
        let supervisor = self.supervisor(name);
        tokio::spawn(async move { supervisor.run(Some(&staged)).await })
    }

    fn terminate(&self, name: &str) {
        self.supervisor(name)
            .signals()
            .send(UserSignal::Terminate)
            .unwrap();
    }

    async fn wait_for_status(&self, name: &str, status: ServiceStatus) {
        let store = self.store.clone();
        let name = name.to_string();
        eventually(move || store.service_status(&name).unwrap() == status).await;
    }
}

fn task_toml(replicas: u32) -> String {
    format!("[service]\nreplica_port = 7000\n\n[service.replica_policy]\nmin_replicas = {replicas}\n")
}

async fn eventually<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

/// A replica workload that answers every request with `hello`.
async fn spawn_backend() -> String {
    let app = axum::Router::new().fallback(|| async { "hello" });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn get(port: u16) -> String {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: svc\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn single_replica_is_served_through_load_balancer() {
    let backend = spawn_backend().await;
    let h = Harness::new(MockProvisioner::new().with_endpoint(backend.clone()));
    let run = h.launch("svc1", 1);

    h.wait_for_status("svc1", ServiceStatus::Ready).await;
    let replicas = h.store.list_replicas("svc1").unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].launch_status, ProcessStatus::Succeeded);

    let record = h.store.get_service("svc1").unwrap().unwrap();
    let controller = ControllerClient::new(format!("127.0.0.1:{}", record.controller_port.unwrap()));
    assert_eq!(controller.endpoints().await.unwrap(), vec![format!("http://{backend}")]);

    // The load balancer asks the controller on every request.
    let lb_port = record.load_balancer_port.unwrap();
    let mut response = String::new();
    for _ in 0..100 {
        response = get(lb_port).await;
        if response.starts_with("HTTP/1.1 200") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("hello"));

    h.terminate("svc1");
    assert_eq!(run.await.unwrap().unwrap(), ServiceOutcome::Removed);
}

#[tokio::test]
async fn terminate_signal_removes_everything() {
    let h = Harness::new(MockProvisioner::new());
    let run = h.launch("svc1", 2);
    h.wait_for_status("svc1", ServiceStatus::Ready).await;
    assert!(h.config.task_path("svc1", INITIAL_VERSION).exists());

    h.terminate("svc1");
    assert_eq!(run.await.unwrap().unwrap(), ServiceOutcome::Removed);

    let mut terminated = h.provisioner.terminated();
    terminated.sort();
    assert_eq!(terminated, vec!["svc1-1", "svc1-2"]);
    assert!(h.store.list_replicas("svc1").unwrap().is_empty());
    assert!(h.store.get_service("svc1").unwrap().is_none());
    assert!(h.store.list_versions("svc1").unwrap().is_empty());
    assert!(!h.config.service_dir("svc1").exists());
    assert_eq!(h.storage.cleaned(), vec![("svc1".to_string(), INITIAL_VERSION)]);
}

#[tokio::test]
async fn failed_teardown_leaves_only_that_replica() {
    let h = Harness::new(MockProvisioner::new());
    h.provisioner.fail_teardown_of("svc1-2");
    let run = h.launch("svc1", 3);
    h.wait_for_status("svc1", ServiceStatus::Ready).await;

    h.terminate("svc1");
    assert_eq!(run.await.unwrap().unwrap(), ServiceOutcome::FailedCleanup);

    let left = h.store.list_replicas("svc1").unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].replica_id, 2);
    assert_eq!(left[0].teardown_status, Some(ProcessStatus::Failed));
    assert_eq!(
        h.store.service_status("svc1").unwrap(),
        ServiceStatus::FailedCleanup
    );
    assert!(h.config.service_dir("svc1").exists());
}

#[tokio::test]
async fn failed_storage_cleanup_is_reported() {
    let h = Harness::new(MockProvisioner::new());
    h.storage.set_failing(true);
    let run = h.launch("svc1", 1);
    h.wait_for_status("svc1", ServiceStatus::Ready).await;

    h.terminate("svc1");
    assert_eq!(run.await.unwrap().unwrap(), ServiceOutcome::FailedCleanup);
    assert!(h.store.list_replicas("svc1").unwrap().is_empty());
    assert_eq!(
        h.store.service_status("svc1").unwrap(),
        ServiceStatus::FailedCleanup
    );
}

#[tokio::test]
async fn ceiling_rejects_new_service() {
    let mut h = Harness::new(MockProvisioner::new());
    h.config.max_services = 1;
    let task = fleet_core::ServiceTask::from_toml_str(&task_toml(1)).unwrap();
    h.store.add_service(&ServiceRecord::new("other", &task)).unwrap();

    let staged = h.stage("svc1", 1);
    let err = h.supervisor("svc1").run(Some(&staged)).await.unwrap_err();

    assert!(matches!(err, SupervisorError::CeilingReached { max: 1 }));
    assert!(h.store.get_service("svc1").unwrap().is_none());
    assert!(!staged.exists());
    assert_eq!(h.provisioner.launch_count(), 0);
}

#[tokio::test]
async fn first_run_needs_a_task() {
    let h = Harness::new(MockProvisioner::new());
    let err = h.supervisor("svc1").run(None).await.unwrap_err();
    assert!(matches!(err, SupervisorError::MissingTask(_)));
}

#[tokio::test]
async fn invalid_service_names_are_rejected() {
    let h = Harness::new(MockProvisioner::new());
    // A neighbour whose directory must survive every rejected name.
    let other_dir = h.config.service_dir("other");
    std::fs::create_dir_all(&other_dir).unwrap();

    for name in ["", "..", "a:b", "a/b", "../other", "x;touch pwned", "Svc", "-svc"] {
        let staged = h.stage("staged", 1);
        let err = h.supervisor(name).run(Some(&staged)).await.unwrap_err();
        assert!(
            matches!(
                err,
                SupervisorError::Config(ConfigError::InvalidServiceName { .. })
            ),
            "{name:?}: {err}"
        );
        assert!(!staged.exists(), "{name:?}");
    }

    assert_eq!(h.store.count_services().unwrap(), 0);
    assert_eq!(h.provisioner.launch_count(), 0);
    assert!(other_dir.exists());
}

#[tokio::test]
async fn colon_in_name_cannot_capture_other_service_rows() {
    let h = Harness::new(MockProvisioner::new());
    let task = fleet_core::ServiceTask::from_toml_str(&task_toml(1)).unwrap();
    h.store.add_service(&ServiceRecord::new("a", &task)).unwrap();
    let mut replica = ReplicaInfo::new("a", 1, INITIAL_VERSION);
    replica.launch_status = ProcessStatus::Succeeded;
    h.store.put_replica(&replica).unwrap();

    let staged = h.stage("staged", 1);
    assert!(h.supervisor("a:1").run(Some(&staged)).await.is_err());
    let err = h.supervisor("a:1").admit(&h.stage("staged", 1)).unwrap_err();
    assert!(matches!(err, SupervisorError::Config(_)));
    assert_eq!(h.store.list_replicas("a").unwrap().len(), 1);
    assert!(h.provisioner.terminated().is_empty());
}

#[test]
fn concurrent_admissions_of_one_name_admit_one() {
    let h = Harness::new(MockProvisioner::new());
    let store = StateStore::open(&h.config.db_path()).unwrap();
    let staged: Vec<_> = (0..6).map(|_| h.stage("svc1", 1)).collect();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = staged
            .iter()
            .map(|path| {
                let supervisor = Supervisor::new(
                    "svc1",
                    h.config.clone(),
                    store.clone(),
                    h.provisioner.clone(),
                    h.storage.clone(),
                );
                scope.spawn(move || supervisor.admit(path))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, SupervisorError::AlreadyExists(_)))
    );
    assert!(staged.iter().all(|path| !path.exists()));
    assert!(h.config.task_path("svc1", INITIAL_VERSION).exists());
}

#[tokio::test]
async fn recovery_rebinds_persisted_ports() {
    let h = Harness::new(MockProvisioner::new());
    let task = fleet_core::ServiceTask::from_toml_str(&task_toml(1)).unwrap();
    let (controller_port, lb_port) = (free_port(), free_port());

    // What a supervisor that died leaves behind.
    let mut record = ServiceRecord::new("svc1", &task);
    record.controller_port = Some(controller_port);
    record.load_balancer_port = Some(lb_port);
    record.status = ServiceStatus::Ready;
    h.store.add_service(&record).unwrap();
    let task_path = h.config.task_path("svc1", INITIAL_VERSION);
    std::fs::create_dir_all(task_path.parent().unwrap()).unwrap();
    std::fs::write(&task_path, task_toml(1)).unwrap();
    h.store
        .add_version(&VersionRecord {
            service_name: "svc1".to_string(),
            version: INITIAL_VERSION,
            task,
            task_path,
            update_mode: UpdateMode::Rolling,
            created_at: 0,
        })
        .unwrap();

    let supervisor = h.supervisor("svc1");
    let run = tokio::spawn(async move { supervisor.run(None).await });

    let store = h.store.clone();
    eventually(move || store.list_replicas("svc1").unwrap().iter().any(|r| r.is_routable())).await;
    let client = ControllerClient::new(format!("127.0.0.1:{controller_port}"));
    assert_eq!(client.endpoints().await.unwrap().len(), 1);
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", lb_port)).await.is_ok());

    let record = h.store.get_service("svc1").unwrap().unwrap();
    assert_eq!(record.controller_port, Some(controller_port));
    assert_eq!(record.load_balancer_port, Some(lb_port));

    h.terminate("svc1");
    assert_eq!(run.await.unwrap().unwrap(), ServiceOutcome::Removed);
}

#[tokio::test]
async fn interrupted_cleanup_is_resumed() {
    let h = Harness::new(MockProvisioner::new());
    let task = fleet_core::ServiceTask::from_toml_str(&task_toml(1)).unwrap();
    let mut record = ServiceRecord::new("svc1", &task);
    record.status = ServiceStatus::ShuttingDown;
    h.store.add_service(&record).unwrap();

    let mut replica = ReplicaInfo::new("svc1", 1, INITIAL_VERSION);
    replica.launch_status = ProcessStatus::Succeeded;
    replica.teardown_status = Some(ProcessStatus::Running);
    replica.endpoint = Some("svc1-1.mock:7000".to_string());
    h.store.put_replica(&replica).unwrap();

    let outcome = h.supervisor("svc1").run(None).await.unwrap();

    assert_eq!(outcome, ServiceOutcome::Removed);
    assert_eq!(h.provisioner.terminated(), vec!["svc1-1"]);
    assert!(h.store.get_service("svc1").unwrap().is_none());
}

#[tokio::test]
async fn replicas_are_torn_down_concurrently() {
    let h = Harness::new(MockProvisioner::new().with_terminate_delay(Duration::from_millis(500)));
    let run = h.launch("svc1", 4);
    h.wait_for_status("svc1", ServiceStatus::Ready).await;

    let started = Instant::now();
    h.terminate("svc1");
    assert_eq!(run.await.unwrap().unwrap(), ServiceOutcome::Removed);

    // One at a time would take at least 2s.
    assert!(started.elapsed() < Duration::from_millis(1500), "{:?}", started.elapsed());
    assert_eq!(h.provisioner.terminated().len(), 4);
}
