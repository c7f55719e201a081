//! Container table and lifecycle state machine.
//!
//! The manager owns the authoritative state of every container on this
//! host. Lifecycle operations on the same name are serialized through a
//! per-name lock; operations on different names, and all inspection reads,
//! proceed in parallel. A reservation is taken from the ledger before any
//! side-effecting work and returned when the container reaches a terminal
//! state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use gantry_api::{
    AgentStatus, Capacity, Container, ContainerState, ContainerStatus, ContainerType, ForkRequest,
    ForkStatus, RunContainerRequest, RunContainerResponse, RunError, RunFailure,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::InitdClient;
use crate::fetch::ImageFetcher;
use crate::manifest;
use crate::resources::ResourceLedger;
use crate::runtime::{ContainerHandle, Runtime, RuntimeHealth};
use crate::store::{ContainerRecord, StateStore, StateStoreError};

#[derive(Debug, Clone)]
struct ContainerEntry {
    container: Container,
    state: ContainerState,
    /// Capacity held in the ledger while the container is live.
    reservation: Capacity,
    handle: Option<ContainerHandle>,
    error: Option<RunError>,
    exit_code: Option<i32>,
}

impl ContainerEntry {
    fn new(container: Container, reservation: Capacity) -> Self {
        Self {
            container,
            state: ContainerState::Pending,
            reservation,
            handle: None,
            error: None,
            exit_code: None,
        }
    }

    fn to_status(&self, name: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: self.state,
            container: self.container.clone(),
            exit_code: self.exit_code,
            error: self.error.clone(),
        }
    }
}

type EntryRef = Arc<RwLock<ContainerEntry>>;

/// Fixed knobs of the container manager.
#[derive(Debug, Clone)]
pub struct ContainerManagerConfig {
    /// Allocatable capacity of this agent.
    pub capacity: Capacity,
    /// Reservation applied to containers that carry no `resources`.
    pub default_reservation: Capacity,
    /// Directory fetched image archives land in.
    pub images_dir: PathBuf,
}

pub struct ContainerManager {
    containers: RwLock<HashMap<String, EntryRef>>,
    /// Per-name serialization of lifecycle operations (run/stop); the
    /// table and entry locks above are only ever held briefly.
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    ledger: Mutex<ResourceLedger>,
    runtime: Arc<dyn Runtime>,
    fetcher: ImageFetcher,
    initd: InitdClient,
    store: Option<Mutex<StateStore>>,
    config: ContainerManagerConfig,
}

impl ContainerManager {
    pub fn new(
        config: ContainerManagerConfig,
        runtime: Arc<dyn Runtime>,
        fetcher: ImageFetcher,
        initd: InitdClient,
        store: Option<StateStore>,
    ) -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
            ledger: Mutex::new(ResourceLedger::new(config.capacity)),
            runtime,
            fetcher,
            initd,
            store: store.map(Mutex::new),
            config,
        }
    }

    /// Run (or reserve) a container. Blocks until the container reaches a
    /// reportable state; all domain failures are carried in the response.
    pub async fn run_container(&self, request: RunContainerRequest) -> RunContainerResponse {
        if let Err(message) = validate(&request) {
            return RunContainerResponse::failed(RunFailure::InvalidRequest, message);
        }

        let name = request.name.clone();
        let lock = self.run_lock(&name).await;
        let _serial = lock.lock().await;

        let want = request
            .container
            .resources
            .unwrap_or(self.config.default_reservation);

        // Claim the name. Reserving here keeps the capacity check ahead of
        // any side-effecting work.
        let entry: EntryRef = {
            let existing = self.containers.read().await.get(&name).cloned();
            match existing {
                Some(entry) => {
                    {
                        let current = entry.read().await;
                        if !current.state.is_terminal() {
                            if current.container == request.container {
                                debug!(container = %name, state = current.state.as_str(),
                                    "identical run request for live container");
                                return RunContainerResponse::ok(current.state);
                            }
                            return RunContainerResponse::failed(
                                RunFailure::NameConflict,
                                format!(
                                    "container {name} already exists with a different definition"
                                ),
                            );
                        }
                    }
                    // Terminal containers may run again as a fresh lifecycle.
                    if !self.ledger.lock().await.try_reserve(&want) {
                        return self.refuse_capacity(&want).await;
                    }
                    *entry.write().await = ContainerEntry::new(request.container.clone(), want);
                    entry
                }
                None => {
                    if !self.ledger.lock().await.try_reserve(&want) {
                        return self.refuse_capacity(&want).await;
                    }
                    let entry = Arc::new(RwLock::new(ContainerEntry::new(
                        request.container.clone(),
                        want,
                    )));
                    self.containers
                        .write()
                        .await
                        .insert(name.clone(), Arc::clone(&entry));
                    entry
                }
            }
        };

        self.drive(&name, &entry).await;

        let final_entry = entry.read().await;
        RunContainerResponse {
            status: final_entry.state,
            error: final_entry.error.clone(),
        }
    }

    async fn refuse_capacity(&self, want: &Capacity) -> RunContainerResponse {
        let free = self.ledger.lock().await.free();
        RunContainerResponse::failed(
            RunFailure::InsufficientResources,
            format!(
                "requested {}m cpu / {} bytes exceeds free capacity {}m cpu / {} bytes",
                want.cpu_millis, want.memory_bytes, free.cpu_millis, free.memory_bytes
            ),
        )
    }

    /// Walk one container through fetch, context preparation, and launch.
    async fn drive(&self, name: &str, entry: &EntryRef) {
        let container = entry.read().await.container.clone();

        let archive = if container.container_type == ContainerType::Image {
            self.transition(name, entry, ContainerState::Fetching).await;
            // uri presence was validated at the boundary
            let uri = container.uri.clone().unwrap_or_default();
            let dest = self.config.images_dir.join(format!("{name}.tar.gz"));
            match self.fetcher.fetch(&uri, &dest).await {
                Ok(bytes) => {
                    info!(container = name, uri = %uri, bytes, "image fetched");
                    Some(dest)
                }
                Err(e) => {
                    self.fail(name, entry, RunFailure::FetchFailed, e.to_string())
                        .await;
                    return;
                }
            }
        } else {
            None
        };

        let boot_initd = !container.reserved;
        let handle = match self
            .runtime
            .prepare(name, archive.as_deref(), boot_initd)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(name, entry, RunFailure::NamespaceError, e.to_string())
                    .await;
                return;
            }
        };
        {
            let mut guard = entry.write().await;
            guard.handle = Some(handle);
            guard.state = ContainerState::Prepared;
        }
        self.persist(name, entry).await;

        if container.reserved {
            self.transition(name, entry, ContainerState::Reserved).await;
            info!(container = name, "container reserved");
            return;
        }

        if let Err((reason, message)) = self.launch_initial_process(name, entry).await {
            self.fail(name, entry, reason, message).await;
            return;
        }

        self.transition(name, entry, ContainerState::Running).await;
        info!(container = name, "container running");
    }

    /// Fork the image's entry process, when its manifest names one.
    async fn launch_initial_process(
        &self,
        name: &str,
        entry: &EntryRef,
    ) -> Result<(), (RunFailure, String)> {
        let (workdir, endpoint) = {
            let guard = entry.read().await;
            let Some(handle) = &guard.handle else {
                return Ok(());
            };
            let Some(endpoint) = handle.initd_endpoint.clone() else {
                return Ok(());
            };
            (handle.workdir.clone(), endpoint)
        };

        let manifest = match manifest::load(&workdir) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return Ok(()),
            Err(e) => return Err((RunFailure::LaunchFailed, e.to_string())),
        };

        let mut process = manifest.process;
        if process.name.is_empty() {
            process.name = name.to_string();
        }

        match self.initd.fork(&endpoint, &ForkRequest { process }).await {
            Ok(response) if response.status == ForkStatus::Launched => {
                info!(container = name, pid = ?response.pid, "entry process launched");
                Ok(())
            }
            Ok(response) => Err((
                RunFailure::LaunchFailed,
                response
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "entry process failed to launch".to_string()),
            )),
            Err(e) => Err((RunFailure::LaunchFailed, e.to_string())),
        }
    }

    /// Stop a container: tear down its context, mark it KILLED, return its
    /// reservation. Terminal containers are left untouched.
    pub async fn stop(&self, name: &str) -> Option<ContainerStatus> {
        let entry = self.containers.read().await.get(name).cloned()?;

        let lock = self.run_lock(name).await;
        let _serial = lock.lock().await;

        if !entry.read().await.state.is_terminal() {
            info!(container = name, "stopping container");
            let handle = entry.write().await.handle.take();
            if let Some(handle) = handle {
                if let Err(e) = self.runtime.teardown(&handle).await {
                    warn!(container = name, error = %e, "teardown failed");
                }
            }
            self.release(&entry).await;
            self.transition(name, &entry, ContainerState::Killed).await;
        }

        let status = entry.read().await.to_status(name);
        Some(status)
    }

    /// Observe live containers and roll the ones whose supervisor died.
    pub async fn check_exits(&self) {
        let snapshot: Vec<(String, EntryRef)> = {
            let table = self.containers.read().await;
            table
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect()
        };

        for (name, entry) in snapshot {
            let lock = self.run_lock(&name).await;
            // A lifecycle operation is already touching this container;
            // pick it up on the next pass.
            let Ok(_serial) = lock.try_lock() else {
                continue;
            };

            let handle = {
                let guard = entry.read().await;
                if guard.state != ContainerState::Running {
                    continue;
                }
                match &guard.handle {
                    Some(handle) => handle.clone(),
                    None => continue,
                }
            };

            let health = self.runtime.check(&handle).await;
            let (state, exit_code) = match health {
                RuntimeHealth::Alive => continue,
                RuntimeHealth::Exited { code } => (ContainerState::Exited, code),
                RuntimeHealth::Killed { signal } => (ContainerState::Killed, Some(128 + signal)),
            };

            info!(container = %name, state = state.as_str(), exit_code = ?exit_code,
                "container supervisor is gone");

            entry.write().await.handle = None;
            if let Err(e) = self.runtime.teardown(&handle).await {
                warn!(container = %name, error = %e, "teardown of exited container failed");
            }
            self.release(&entry).await;
            {
                let mut guard = entry.write().await;
                guard.state = state;
                guard.exit_code = exit_code;
            }
            self.persist(&name, &entry).await;
        }
    }

    /// Rebuild the table from the state store after a restart. Reserved
    /// containers re-reserve and survive; other non-terminal containers
    /// cannot be re-attached and reload as failed.
    pub async fn rebuild_from_store(&self) -> Result<usize, StateStoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.lock().await.load_all()?;
        let count = records.len();

        for record in records {
            let name = record.name.clone();
            let entry = if record.state == ContainerState::Reserved {
                let want = record
                    .container
                    .resources
                    .unwrap_or(self.config.default_reservation);
                if self.ledger.lock().await.try_reserve(&want) {
                    let mut entry = ContainerEntry::new(record.container, want);
                    entry.state = ContainerState::Reserved;
                    entry
                } else {
                    let mut entry = ContainerEntry::new(record.container, Capacity::ZERO);
                    entry.state = ContainerState::Failed;
                    entry.error = Some(RunError {
                        reason: RunFailure::InsufficientResources,
                        message: "reservation could not be restored after restart".to_string(),
                    });
                    entry
                }
            } else if record.state.is_terminal() {
                let mut entry = ContainerEntry::new(record.container, Capacity::ZERO);
                entry.state = record.state;
                entry.error = record.error;
                entry.exit_code = record.exit_code;
                entry
            } else {
                let mut entry = ContainerEntry::new(record.container, Capacity::ZERO);
                entry.state = ContainerState::Failed;
                entry.error = Some(RunError {
                    reason: RunFailure::LaunchFailed,
                    message: "agent restarted before the container reached a terminal state"
                        .to_string(),
                });
                entry
            };

            info!(container = %name, state = entry.state.as_str(), "container restored");
            let entry = Arc::new(RwLock::new(entry));
            self.persist(&name, &entry).await;
            self.containers.write().await.insert(name, entry);
        }

        Ok(count)
    }

    pub async fn status(&self, name: &str) -> Option<ContainerStatus> {
        let entry = self.containers.read().await.get(name).cloned()?;
        let guard = entry.read().await;
        Some(guard.to_status(name))
    }

    pub async fn list(&self) -> Vec<ContainerStatus> {
        let snapshot: Vec<(String, EntryRef)> = {
            let table = self.containers.read().await;
            table
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect()
        };

        let mut statuses = Vec::with_capacity(snapshot.len());
        for (name, entry) in snapshot {
            statuses.push(entry.read().await.to_status(&name));
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Capacity and container count this agent reports about itself.
    pub async fn agent_status(&self) -> AgentStatus {
        let (capacity, used) = {
            let ledger = self.ledger.lock().await;
            (ledger.total(), ledger.used())
        };
        let live = self
            .list()
            .await
            .iter()
            .filter(|status| !status.state.is_terminal())
            .count() as u64;

        AgentStatus {
            capacity,
            used,
            containers: live,
        }
    }

    async fn transition(&self, name: &str, entry: &EntryRef, state: ContainerState) {
        entry.write().await.state = state;
        self.persist(name, entry).await;
    }

    async fn fail(&self, name: &str, entry: &EntryRef, reason: RunFailure, message: String) {
        warn!(container = name, reason = ?reason, message = %message, "container failed");
        let handle = entry.write().await.handle.take();
        if let Some(handle) = handle {
            if let Err(e) = self.runtime.teardown(&handle).await {
                warn!(container = name, error = %e, "teardown after failure failed");
            }
        }
        self.release(entry).await;
        {
            let mut guard = entry.write().await;
            guard.state = ContainerState::Failed;
            guard.error = Some(RunError { reason, message });
        }
        self.persist(name, entry).await;
    }

    /// Return an entry's reservation to the ledger, exactly once.
    async fn release(&self, entry: &EntryRef) {
        let held = {
            let mut guard = entry.write().await;
            std::mem::replace(&mut guard.reservation, Capacity::ZERO)
        };
        if held != Capacity::ZERO {
            self.ledger.lock().await.release(&held);
        }
    }

    async fn persist(&self, name: &str, entry: &EntryRef) {
        let Some(store) = &self.store else {
            return;
        };
        let record = {
            let guard = entry.read().await;
            ContainerRecord {
                name: name.to_string(),
                container: guard.container.clone(),
                state: guard.state,
                error: guard.error.clone(),
                exit_code: guard.exit_code,
            }
        };
        if let Err(e) = store.lock().await.upsert(&record) {
            warn!(container = name, error = %e, "failed to persist container state");
        }
    }

    async fn run_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn validate(request: &RunContainerRequest) -> Result<(), String> {
    if request.name.is_empty() {
        return Err("container name must not be empty".to_string());
    }
    // The name becomes a path component under the data directory.
    if request.name.contains(['/', '\\']) || request.name == "." || request.name == ".." {
        return Err(format!(
            "container name {:?} is not a valid path component",
            request.name
        ));
    }
    if request.container.container_type == ContainerType::Image
        && request
            .container
            .uri
            .as_deref()
            .map_or(true, |uri| uri.is_empty())
    {
        return Err("image containers require a non-empty uri".to_string());
    }
    Ok(())
}
