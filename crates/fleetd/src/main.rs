use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fleet_controller::{ControllerClient, StatusReport};
use fleet_core::{ServeConfig, validate_service_name};
use fleet_replica::{CommandProvisioner, LocalStorageCleaner};
use fleet_state::{ServiceStatus, StateStore, UpdateMode};
use fleetd::{ServiceOutcome, SignalChannel, Supervisor, UserSignal};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet service supervisor")]
struct Cli {
    /// Daemon configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `state_dir` from the configuration file.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise one service until it is taken down.
    Run {
        #[arg(long)]
        service: String,

        /// Task file. Required the first time a service is run.
        #[arg(long)]
        task: Option<PathBuf>,
    },
    /// Ask a running service to shut down and clean up.
    Down {
        #[arg(long)]
        service: String,
    },
    /// Show the controller's view of a service.
    Status {
        #[arg(long)]
        service: String,

        /// Print the raw JSON report.
        #[arg(long)]
        json: bool,
    },
    /// Register a new version of a service's task.
    Update {
        #[arg(long)]
        service: String,

        #[arg(long)]
        task: PathBuf,

        #[arg(long, value_enum, default_value = "rolling")]
        mode: ModeArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Rolling,
    BlueGreen,
}

impl Command {
    fn service(&self) -> &str {
        match self {
            Command::Run { service, .. }
            | Command::Down { service }
            | Command::Status { service, .. }
            | Command::Update { service, .. } => service,
        }
    }
}

impl From<ModeArg> for UpdateMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Rolling => UpdateMode::Rolling,
            ModeArg::BlueGreen => UpdateMode::BlueGreen,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServeConfig::from_file(path)?,
        None => ServeConfig::default(),
    };
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    // The name becomes part of row keys, paths, and provisioner commands.
    validate_service_name(cli.command.service())?;

    match cli.command {
        Command::Run { service, task } => {
            fleetd::logging::init(Some(config.load_balancer_log_path(&service)))?;
            run(config, service, task).await
        }
        Command::Down { service } => {
            fleetd::logging::init(None)?;
            down(&config, &service)
        }
        Command::Status { service, json } => {
            fleetd::logging::init(None)?;
            status(&config, &service, json).await
        }
        Command::Update {
            service,
            task,
            mode,
        } => {
            fleetd::logging::init(None)?;
            let content = std::fs::read_to_string(&task)
                .with_context(|| format!("reading {}", task.display()))?;
            let version = controller_client(&config, &service)?
                .update_service(content, mode.into())
                .await?;
            println!("{service} updated to version {version}.");
            Ok(())
        }
    }
}

async fn run(config: ServeConfig, service: String, task: Option<PathBuf>) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating {}", config.state_dir.display()))?;
    let store = StateStore::open(&config.db_path())?;
    info!(path = %config.db_path().display(), "state store opened");

    let staged = match &task {
        Some(path) => Some(fleetd::stage_task(&config, &service, path)?),
        None => None,
    };

    let supervisor = Supervisor::new(
        service.clone(),
        config.clone(),
        store,
        Arc::new(CommandProvisioner::new(config.clone())),
        Arc::new(LocalStorageCleaner::new(config)),
    );

    // Ctrl-C goes through the same channel as `fleetd down`.
    let signals = supervisor.signals();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, requesting termination");
            match tokio::task::spawn_blocking(move || signals.send(UserSignal::Terminate)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "failed to raise terminate signal"),
                Err(e) => error!(error = %e, "signal task panicked"),
            }
        }
    });

    match supervisor.run(staged.as_deref()).await? {
        ServiceOutcome::Removed => {
            info!(%service, "service removed");
            Ok(())
        }
        ServiceOutcome::FailedCleanup => {
            bail!("cleanup of {service} failed; `fleetd status --service {service}` lists what is left")
        }
    }
}

/// Mark the service as shutting down and signal its supervisor.
fn down(config: &ServeConfig, service: &str) -> anyhow::Result<()> {
    let store = StateStore::open(&config.db_path())?;
    let status = store
        .get_service(service)?
        .with_context(|| format!("service {service} not found"))?
        .status;
    if status.is_terminal() {
        bail!("service {service} is {status}; run `fleetd run --service {service}` to retry cleanup");
    }
    if status.is_live() {
        store.set_service_status(service, ServiceStatus::ShuttingDown)?;
    }
    SignalChannel::new(config.signal_path(service)).send(UserSignal::Terminate)?;
    println!("Termination requested for {service}.");
    Ok(())
}

/// Print the controller's report, or the stored rows when no controller
/// is running (for instance after a failed cleanup).
async fn status(config: &ServeConfig, service: &str, json: bool) -> anyhow::Result<()> {
    let report = match controller_client(config, service)?.status().await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "controller unreachable, showing stored state");
            let store = StateStore::open(&config.db_path())?;
            let record = store
                .get_service(service)?
                .with_context(|| format!("service {service} not found"))?;
            StatusReport {
                service: record,
                versions: store.list_versions(service)?.iter().map(Into::into).collect(),
                replicas: store.list_replicas(service)?.iter().map(Into::into).collect(),
                target_replicas: 0,
                qps: 0.0,
            }
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "{}  {}  replicas: {} (target {})  qps: {:.2}",
        report.service.name,
        report.service.status,
        report.replicas.len(),
        report.target_replicas,
        report.qps
    );
    for replica in &report.replicas {
        println!(
            "  #{:<4} v{:<3} {:<16} {}",
            replica.replica_id,
            replica.version,
            format!("{:?}", replica.status),
            replica.endpoint.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Client for the controller of `service`, found through its service row.
fn controller_client(config: &ServeConfig, service: &str) -> anyhow::Result<ControllerClient> {
    let store = StateStore::open(&config.db_path())?;
    let record = store
        .get_service(service)?
        .with_context(|| format!("service {service} not found"))?;
    let port = record
        .controller_port
        .with_context(|| format!("service {service} has no controller port yet"))?;
    let host = match config.controller_host().as_str() {
        "0.0.0.0" => "127.0.0.1".to_string(),
        host => host.to_string(),
    };
    Ok(ControllerClient::new(format!("{host}:{port}")))
}
