//! Tracing setup for the `fleetd` binary.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleet=debug";

/// Install the global subscriber.
///
/// Console output honours `RUST_LOG`. When `load_balancer_log` is given,
/// load balancer events are also appended to that file.
pub fn init(load_balancer_log: Option<PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let console = tracing_subscriber::fmt::layer().with_filter(filter);

    let lb_file = load_balancer_log.map(|path| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(LoadBalancerLog::new(path))
            .with_filter(Targets::new().with_target("fleet_lb", Level::DEBUG))
    });

    tracing_subscriber::registry()
        .with(console)
        .with(lb_file)
        .try_init()?;
    Ok(())
}

/// Appends to the service's `load_balancer.log`.
///
/// The file lives in the service directory, which only exists once the
/// service is admitted. Until then events are dropped; the file is opened
/// on the first write after the directory appears.
#[derive(Debug, Clone)]
pub struct LoadBalancerLog {
    inner: Arc<Mutex<LogFile>>,
}

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    file: Option<File>,
}

impl LoadBalancerLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogFile { path, file: None })),
        }
    }
}

impl Write for LoadBalancerLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut log = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if log.file.is_none() {
            if !log.path.parent().is_some_and(|dir| dir.is_dir()) {
                return Ok(buf.len());
            }
            let file = OpenOptions::new().create(true).append(true).open(&log.path)?;
            log.file = Some(file);
        }
        match log.file.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut log = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match log.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LoadBalancerLog {
    type Writer = LoadBalancerLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
