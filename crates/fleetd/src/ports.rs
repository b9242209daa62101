//! Controller and load balancer port selection.
//!
//! Ports are chosen under the host-wide `port_selection.lock`. Each
//! listener is bound while the lock is held and its port is written to
//! the service row before the lock is released, so concurrent supervisors
//! never pick the same port and a restarted supervisor gets its old ports
//! back.

use std::collections::HashSet;
use std::io;
use std::net::TcpListener;

use fleet_core::ServeConfig;
use fleet_state::StateStore;
use tracing::{debug, info};

use crate::error::{SupervisorError, SupervisorResult};
use crate::lock::FileLock;

/// The load balancer serves external clients on every interface.
pub const LOAD_BALANCER_HOST: &str = "0.0.0.0";

/// Listeners bound for one service, not yet handed to tokio.
#[derive(Debug)]
pub struct ServicePorts {
    pub controller: TcpListener,
    pub load_balancer: TcpListener,
}

impl ServicePorts {
    pub fn controller_port(&self) -> io::Result<u16> {
        Ok(self.controller.local_addr()?.port())
    }

    pub fn load_balancer_port(&self) -> io::Result<u16> {
        Ok(self.load_balancer.local_addr()?.port())
    }
}

/// Bind the controller and load balancer listeners of `service`.
///
/// Ports already recorded on the service row are reused; missing ones
/// are allocated and recorded. Blocks on the port lock.
pub fn bind_service_ports(
    config: &ServeConfig,
    store: &StateStore,
    service: &str,
) -> SupervisorResult<ServicePorts> {
    let _lock = FileLock::acquire(&config.port_lock_path())?;

    let record = store
        .get_service(service)?
        .ok_or_else(|| fleet_state::StateError::NotFound(service.to_string()))?;
    let reserved = reserved_ports(store, service)?;
    let controller_host = config.controller_host();

    let controller = match record.controller_port {
        Some(port) => {
            debug!(%service, port, "reusing controller port");
            bind_port(&controller_host, port)?
        }
        None => {
            let listener = bind_free_port(
                &controller_host,
                config.controller_port_start,
                &reserved,
            )?;
            store.set_service_controller_port(service, listener.local_addr()?.port())?;
            listener
        }
    };

    let load_balancer = match record.load_balancer_port {
        Some(port) => {
            debug!(%service, port, "reusing load balancer port");
            bind_port(LOAD_BALANCER_HOST, port)?
        }
        None => {
            let listener = bind_free_port(
                LOAD_BALANCER_HOST,
                config.load_balancer_port_start,
                &reserved,
            )?;
            store.set_service_load_balancer_port(service, listener.local_addr()?.port())?;
            listener
        }
    };

    let ports = ServicePorts {
        controller,
        load_balancer,
    };
    info!(
        %service,
        controller_port = ports.controller_port()?,
        load_balancer_port = ports.load_balancer_port()?,
        "ports bound"
    );
    Ok(ports)
}

/// Bind exactly `host:port`.
pub fn bind_port(host: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((host, port))
}

/// Bind the first free port at or above `start`, skipping `reserved`.
pub fn bind_free_port(
    host: &str,
    start: u16,
    reserved: &HashSet<u16>,
) -> SupervisorResult<TcpListener> {
    for port in start..=u16::MAX {
        if reserved.contains(&port) {
            continue;
        }
        match bind_port(host, port) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(SupervisorError::NoFreePort {
        host: host.to_string(),
        start,
    })
}

/// Ports recorded by other services. They may be idle while their
/// supervisor restarts, but still belong to those services.
fn reserved_ports(store: &StateStore, service: &str) -> SupervisorResult<HashSet<u16>> {
    Ok(store
        .list_services()?
        .into_iter()
        .filter(|svc| svc.name != service)
        .flat_map(|svc| [svc.controller_port, svc.load_balancer_port])
        .flatten()
        .collect())
}
