//! Configuration for the init supervisor.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to serve the supervisor API on. Port 0 picks an ephemeral
    /// port; combine with `endpoint_file` so the booting agent can find it.
    pub listen_addr: SocketAddr,

    /// File to write the bound `host:port` into once listening.
    pub endpoint_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("GANTRY_INITD_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9000".to_string())
            .parse()?;

        let endpoint_file = std::env::var("GANTRY_INITD_ENDPOINT_FILE")
            .ok()
            .map(PathBuf::from);

        let log_level = std::env::var("GANTRY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            endpoint_file,
            log_level,
        })
    }
}
