use std::{path::PathBuf, sync::LazyLock, time::Duration};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a sandbox lives without a keep-alive.
pub const DEFAULT_SANDBOX_TTL: Duration = Duration::from_secs(15);

/// The smallest extension a keep-alive request may ask for.
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Maximum lifetime for sandboxes whose tier is unknown, e.g. ones re-added by reconciliation.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the sandbox cache is resynced with the task driver.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(180);

/// How old a running task must be before reconciliation adopts it into the cache.
pub const DEFAULT_ADOPTION_GRACE: Duration = Duration::from_secs(60);

/// How often expired cache entries are swept.
pub const DEFAULT_EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How often expired build information is dropped.
pub const DEFAULT_BUILD_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long a stopping VMM is given before its process group is killed.
pub const DEFAULT_VMM_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the Firecracker API socket to appear.
pub const DEFAULT_SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long build information is kept after the build finished.
pub const DEFAULT_BUILD_INFO_TTL: Duration = Duration::from_secs(5 * 60);

/// Number of random slot probes before falling back to a scan.
pub const SLOT_PROBE_ATTEMPTS: usize = 10;

/// Number of slot indices per node.
pub const SLOT_COUNT: u32 = 65536;

/// Default port for the HTTP server.
pub const DEFAULT_SERVER_PORT: u16 = 3000;

/// Default address of the Consul agent.
pub const DEFAULT_CONSUL_ADDR: &str = "http://127.0.0.1:8500";

/// Name of the firecracker binary looked up on `PATH`.
pub const DEFAULT_FIRECRACKER_BINARY: &str = "firecracker";

/// Template envs root.
pub static DEFAULT_ENVS_DISK: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/mnt/disks/fc-envs/v1"));

/// Directory holding Firecracker API sockets.
pub static DEFAULT_RUNTIME_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/run/sandhive"));

/// Directory holding the task database.
pub static DEFAULT_STATE_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/var/lib/sandhive"));

/// The hosts file sandbox names are published to.
pub static DEFAULT_HOSTS_FILE: LazyLock<PathBuf> = LazyLock::new(|| PathBuf::from("/etc/hosts"));
