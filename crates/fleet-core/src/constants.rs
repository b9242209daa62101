//! Well-known constants shared by the supervisor, controller, and load balancer.

/// Version number assigned to the task a service is first launched with.
pub const INITIAL_VERSION: u64 = 1;

/// First port probed when choosing a controller port.
pub const CONTROLLER_PORT_START: u16 = 20001;

/// First port probed when choosing a load balancer port.
pub const LOAD_BALANCER_PORT_START: u16 = 30001;

/// Default ceiling on the number of services one host may run.
pub const DEFAULT_MAX_SERVICES: usize = 16;

/// Window over which request timestamps count towards QPS.
pub const QPS_WINDOW_SECS: u64 = 60;

/// Largest request body the load balancer buffers before answering 413.
pub const DEFAULT_LB_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Attempts the load balancer makes before giving up on a request.
pub const LB_MAX_ATTEMPTS: usize = 3;

/// Consecutive failed probes after which a ready replica is replaced.
pub const PROBE_FAILURE_THRESHOLD: u32 = 3;

/// Environment variable that marks a Kubernetes pod.
pub const KUBERNETES_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
