//! Configuration for the master.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use gantry_api::Capacity;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to serve the scheduler API on.
    pub listen_addr: SocketAddr,

    /// Timeout for `RunContainer` dispatches to agents.
    pub call_timeout: Duration,

    /// Timeout for live agent-status probes.
    pub probe_timeout: Duration,

    /// Registry entries older than this are stale.
    pub agent_ttl: Duration,

    /// Capacity assumed for pods without an explicit requirement.
    pub default_reservation: Capacity,

    /// Optional JSON file mapping pod names to containers.
    pub pod_specs_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("GANTRY_MASTER_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9527".to_string())
            .parse()?;

        let call_timeout = Duration::from_secs(env_parse("GANTRY_CALL_TIMEOUT", 10u64));
        let probe_timeout = Duration::from_secs(env_parse("GANTRY_PROBE_TIMEOUT", 2u64));
        let agent_ttl = Duration::from_secs(env_parse("GANTRY_AGENT_TTL", 30u64));

        let default_reservation = Capacity {
            cpu_millis: env_parse("GANTRY_DEFAULT_CPU_MILLIS", 500),
            memory_bytes: env_parse("GANTRY_DEFAULT_MEMORY_BYTES", 256 * 1024 * 1024),
        };

        let pod_specs_file = std::env::var("GANTRY_POD_SPECS").ok().map(PathBuf::from);

        let log_level = std::env::var("GANTRY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            call_timeout,
            probe_timeout,
            agent_ttl,
            default_reservation,
            pod_specs_file,
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
