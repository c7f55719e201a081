//! Container runtime interface and implementations.
//!
//! The runtime owns the isolation boundary of a container: its workdir, the
//! unpacked rootfs for image containers, and the per-container initd that
//! supervises processes inside it. A mock implementation is provided for
//! tests and development.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::InitdClient;

/// Errors from preparing or tearing down an execution context.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to set up container workspace: {0}")]
    Workspace(String),

    #[error("failed to unpack image archive: {0}")]
    Unpack(String),

    #[error("initd did not come up: {0}")]
    Boot(String),
}

/// Handle to a prepared execution context.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub name: String,
    pub workdir: PathBuf,
    /// Address of the container's initd; absent for reserved containers.
    pub initd_endpoint: Option<String>,
}

/// Liveness of a container's supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeHealth {
    Alive,
    Exited { code: Option<i32> },
    Killed { signal: i32 },
}

/// Container runtime interface.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Prepare the isolation context for a container: workdir, unpacked
    /// rootfs when an archive is given, and a booted initd unless the
    /// container is only being reserved.
    async fn prepare(
        &self,
        name: &str,
        archive: Option<&Path>,
        boot_initd: bool,
    ) -> Result<ContainerHandle, RuntimeError>;

    /// Tear the context down: stop the initd and reclaim the workdir.
    async fn teardown(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Check whether the container's supervisor is still alive.
    async fn check(&self, handle: &ContainerHandle) -> RuntimeHealth;
}

/// Configuration for the local runtime.
#[derive(Debug, Clone)]
pub struct LocalRuntimeConfig {
    /// Directory container workdirs are created under.
    pub root: PathBuf,
    /// Command used to boot a container's initd.
    pub initd_bin: String,
    /// Interval between boot readiness polls.
    pub boot_poll_interval: Duration,
    /// Maximum readiness polls before the boot is declared failed.
    pub boot_max_polls: u32,
}

impl Default for LocalRuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/gantry/containers"),
            initd_bin: "initd".to_string(),
            boot_poll_interval: Duration::from_millis(200),
            boot_max_polls: 50,
        }
    }
}

/// Runtime that boots a real initd per container on this host.
pub struct LocalRuntime {
    config: LocalRuntimeConfig,
    initd: InitdClient,
    children: Mutex<std::collections::HashMap<String, tokio::process::Child>>,
}

impl LocalRuntime {
    pub fn new(config: LocalRuntimeConfig) -> anyhow::Result<Self> {
        let initd = InitdClient::new(Duration::from_secs(5))?;
        Ok(Self {
            config,
            initd,
            children: Mutex::new(std::collections::HashMap::new()),
        })
    }

    async fn boot_initd(&self, name: &str, workdir: &Path) -> Result<String, RuntimeError> {
        let endpoint_file = workdir.join("initd.endpoint");

        let child = tokio::process::Command::new(&self.config.initd_bin)
            .env("GANTRY_INITD_LISTEN_ADDR", "127.0.0.1:0")
            .env("GANTRY_INITD_ENDPOINT_FILE", &endpoint_file)
            .current_dir(workdir)
            .spawn()
            .map_err(|e| {
                RuntimeError::Boot(format!("spawn of {:?} failed: {e}", self.config.initd_bin))
            })?;

        self.children.lock().await.insert(name.to_string(), child);

        // The initd writes its bound address once it is listening; poll for
        // the file, then for a healthy status surface.
        for _ in 0..self.config.boot_max_polls {
            tokio::time::sleep(self.config.boot_poll_interval).await;

            let Ok(endpoint) = std::fs::read_to_string(&endpoint_file) else {
                continue;
            };
            let endpoint = endpoint.trim().to_string();
            if endpoint.is_empty() {
                continue;
            }
            if self.initd.healthy(&endpoint).await {
                info!(container = name, endpoint = %endpoint, "initd is up");
                return Ok(endpoint);
            }
        }

        // Boot budget spent: reclaim the child before reporting failure.
        if let Some(mut child) = self.children.lock().await.remove(name) {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Err(RuntimeError::Boot(format!(
            "initd for container {name} not ready after {} polls",
            self.config.boot_max_polls
        )))
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn prepare(
        &self,
        name: &str,
        archive: Option<&Path>,
        boot_initd: bool,
    ) -> Result<ContainerHandle, RuntimeError> {
        let workdir = self.config.root.join(name);
        let rootfs = workdir.join("rootfs");
        std::fs::create_dir_all(&rootfs)
            .map_err(|e| RuntimeError::Workspace(format!("{}: {e}", rootfs.display())))?;

        if let Some(archive) = archive {
            let archive = archive.to_path_buf();
            let rootfs_clone = rootfs.clone();
            tokio::task::spawn_blocking(move || unpack_archive(&archive, &rootfs_clone))
                .await
                .map_err(|e| RuntimeError::Unpack(e.to_string()))??;

            // Surface the image's manifest beside the rootfs, where the
            // engine looks for it.
            let packed_manifest = rootfs.join(crate::manifest::MANIFEST_FILE);
            if packed_manifest.exists() {
                std::fs::copy(
                    &packed_manifest,
                    workdir.join(crate::manifest::MANIFEST_FILE),
                )
                .map_err(|e| RuntimeError::Unpack(format!("manifest copy failed: {e}")))?;
            }
        }

        let initd_endpoint = if boot_initd {
            Some(self.boot_initd(name, &workdir).await?)
        } else {
            None
        };

        Ok(ContainerHandle {
            name: name.to_string(),
            workdir,
            initd_endpoint,
        })
    }

    async fn teardown(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        if let Some(mut child) = self.children.lock().await.remove(&handle.name) {
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!(container = %handle.name, "initd stopped");
        }

        if let Err(e) = std::fs::remove_dir_all(&handle.workdir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(container = %handle.name, error = %e, "failed to remove workdir");
            }
        }
        Ok(())
    }

    async fn check(&self, handle: &ContainerHandle) -> RuntimeHealth {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&handle.name) else {
            return RuntimeHealth::Exited { code: None };
        };
        match child.try_wait() {
            Ok(None) => RuntimeHealth::Alive,
            Ok(Some(status)) => {
                use std::os::unix::process::ExitStatusExt;
                children.remove(&handle.name);
                if let Some(signal) = status.signal() {
                    RuntimeHealth::Killed { signal }
                } else {
                    RuntimeHealth::Exited {
                        code: status.code(),
                    }
                }
            }
            Err(e) => {
                warn!(container = %handle.name, error = %e, "initd status check failed");
                RuntimeHealth::Alive
            }
        }
    }
}

/// Unpack a gzipped tar archive into `dest`.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), RuntimeError> {
    let file = std::fs::File::open(archive)
        .map_err(|e| RuntimeError::Unpack(format!("{}: {e}", archive.display())))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest)
        .map_err(|e| RuntimeError::Unpack(format!("{}: {e}", archive.display())))
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    root: PathBuf,
    boot_counter: AtomicU64,
    fail_prepares: bool,
    alive: AtomicBool,
    initd_endpoint: Option<String>,
}

impl MockRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            boot_counter: AtomicU64::new(0),
            fail_prepares: false,
            alive: AtomicBool::new(true),
            initd_endpoint: None,
        }
    }

    /// A mock runtime whose prepares all fail.
    pub fn failing(root: impl Into<PathBuf>) -> Self {
        Self {
            fail_prepares: true,
            ..Self::new(root)
        }
    }

    /// A mock runtime whose prepared containers report the given initd.
    pub fn with_initd_endpoint(root: impl Into<PathBuf>, endpoint: impl Into<String>) -> Self {
        Self {
            initd_endpoint: Some(endpoint.into()),
            ..Self::new(root)
        }
    }

    /// Make subsequent health checks report the supervisor as gone.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn prepare(
        &self,
        name: &str,
        archive: Option<&Path>,
        boot_initd: bool,
    ) -> Result<ContainerHandle, RuntimeError> {
        if self.fail_prepares {
            return Err(RuntimeError::Workspace(
                "mock runtime configured to fail".to_string(),
            ));
        }

        let boot = self.boot_counter.fetch_add(1, Ordering::SeqCst);
        let workdir = self.root.join(name);
        std::fs::create_dir_all(&workdir)
            .map_err(|e| RuntimeError::Workspace(e.to_string()))?;

        debug!(container = name, boot, archive = ?archive, "[MOCK] context prepared");

        Ok(ContainerHandle {
            name: name.to_string(),
            workdir,
            initd_endpoint: if boot_initd {
                self.initd_endpoint.clone()
            } else {
                None
            },
        })
    }

    async fn teardown(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        debug!(container = %handle.name, "[MOCK] context torn down");
        let _ = std::fs::remove_dir_all(&handle.workdir);
        Ok(())
    }

    async fn check(&self, _handle: &ContainerHandle) -> RuntimeHealth {
        if self.alive.load(Ordering::SeqCst) {
            RuntimeHealth::Alive
        } else {
            RuntimeHealth::Exited { code: Some(0) }
        }
    }
}
