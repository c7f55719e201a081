//! Configuration for the engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use gantry_api::Capacity;

use crate::resources::SystemResources;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to serve the agent API on.
    pub listen_addr: SocketAddr,

    /// Data directory for images, container workdirs, and local state.
    pub data_dir: PathBuf,

    /// Master base URL; heartbeats are disabled when unset.
    pub master_url: Option<String>,

    /// Endpoint reported in heartbeats; defaults to `listen_addr`.
    pub advertise_endpoint: Option<String>,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Interval between supervisor liveness sweeps, in seconds.
    pub exit_check_interval_secs: u64,

    /// Allocatable capacity; defaults to the measured host resources.
    pub capacity: Capacity,

    /// Reservation for containers that carry no resource requirement.
    pub default_reservation: Capacity,

    /// Command used to boot a container's initd.
    pub initd_bin: String,

    /// Timeout for calls into a container's initd.
    pub initd_call_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("GANTRY_ENGINE_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:7676".to_string())
            .parse()?;

        let data_dir = std::env::var("GANTRY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/gantry"));

        let master_url = std::env::var("GANTRY_MASTER_URL").ok().filter(|s| !s.is_empty());

        let advertise_endpoint = std::env::var("GANTRY_ADVERTISE_ENDPOINT").ok();

        let heartbeat_interval_secs = env_parse("GANTRY_HEARTBEAT_INTERVAL", 10);
        let exit_check_interval_secs = env_parse("GANTRY_EXIT_CHECK_INTERVAL", 2);

        let measured = SystemResources::measure();
        let capacity = Capacity {
            cpu_millis: env_parse("GANTRY_CPU_MILLIS", measured.cpu_millis),
            memory_bytes: env_parse("GANTRY_MEMORY_BYTES", measured.total_memory_bytes),
        };

        let default_reservation = Capacity {
            cpu_millis: env_parse("GANTRY_DEFAULT_CPU_MILLIS", 500),
            memory_bytes: env_parse("GANTRY_DEFAULT_MEMORY_BYTES", 256 * 1024 * 1024),
        };

        let initd_bin = std::env::var("GANTRY_INITD_BIN").unwrap_or_else(|_| "initd".to_string());

        let initd_call_timeout =
            Duration::from_secs(env_parse("GANTRY_INITD_CALL_TIMEOUT", 10u64));

        let log_level = std::env::var("GANTRY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            data_dir,
            master_url,
            advertise_endpoint,
            heartbeat_interval_secs,
            exit_check_interval_secs,
            capacity,
            default_reservation,
            initd_bin,
            initd_call_timeout,
            log_level,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
