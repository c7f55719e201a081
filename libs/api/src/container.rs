//! Container definitions and the engine's `RunContainer` surface.

use serde::{Deserialize, Serialize};

/// How a container's payload is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    /// A bare executable; no artifact is fetched.
    Process,
    /// A packaged image fetched from the container's `uri` and unpacked
    /// into the execution context.
    Image,
}

/// A resource quantity, used both for container requirements and for
/// agent-level accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl Capacity {
    pub const ZERO: Capacity = Capacity {
        cpu_millis: 0,
        memory_bytes: 0,
    };

    /// Whether this quantity fits entirely within `other`.
    pub fn fits_within(&self, other: &Capacity) -> bool {
        self.cpu_millis <= other.cpu_millis && self.memory_bytes <= other.memory_bytes
    }

    pub fn saturating_add(&self, other: &Capacity) -> Capacity {
        Capacity {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    pub fn saturating_sub(&self, other: &Capacity) -> Capacity {
        Capacity {
            cpu_millis: (self.cpu_millis - other.cpu_millis).max(0),
            memory_bytes: (self.memory_bytes - other.memory_bytes).max(0),
        }
    }
}

/// A unit of isolated execution on one agent.
///
/// `uri` is required and non-empty when `type` is `image`, and ignored for
/// `process`. `reserved` containers hold resources without starting any
/// process. A missing `resources` falls back to the agent's configured
/// default reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default)]
    pub reserved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Capacity>,
}

impl Container {
    /// A plain process container.
    pub fn process() -> Self {
        Self {
            container_type: ContainerType::Process,
            uri: None,
            reserved: false,
            resources: None,
        }
    }

    /// An image container fetched from `uri`.
    pub fn image(uri: impl Into<String>) -> Self {
        Self {
            container_type: ContainerType::Image,
            uri: Some(uri.into()),
            reserved: false,
            resources: None,
        }
    }
}

/// Lifecycle state of a container on its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Pending,
    Fetching,
    Prepared,
    Running,
    Reserved,
    Exited,
    Killed,
    Failed,
}

impl ContainerState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Reserved => "reserved",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fetching" => Some(Self::Fetching),
            "prepared" => Some(Self::Prepared),
            "running" => Some(Self::Running),
            "reserved" => Some(Self::Reserved),
            "exited" => Some(Self::Exited),
            "killed" => Some(Self::Killed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Why a `RunContainer` call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailure {
    InsufficientResources,
    FetchFailed,
    NamespaceError,
    LaunchFailed,
    NameConflict,
    InvalidRequest,
}

/// Failure detail carried inside a `RunContainerResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub reason: RunFailure,
    pub message: String,
}

/// Request to run (or reserve) a container on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContainerRequest {
    /// Unique workload identifier on the agent; must be non-empty.
    pub name: String,
    pub container: Container,
}

/// Terminal answer to a `RunContainer` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContainerResponse {
    pub status: ContainerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunContainerResponse {
    pub fn ok(status: ContainerState) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn failed(reason: RunFailure, message: impl Into<String>) -> Self {
        Self {
            status: ContainerState::Failed,
            error: Some(RunError {
                reason,
                message: message.into(),
            }),
        }
    }
}

/// Observed state of one container, as reported by its agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: ContainerState,
    pub container: Container,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

/// What an agent reports about itself: total capacity, current usage, and
/// how many live containers it hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub capacity: Capacity,
    pub used: Capacity,
    pub containers: u64,
}

impl AgentStatus {
    pub fn free(&self) -> Capacity {
        self.capacity.saturating_sub(&self.used)
    }
}

/// Periodic agent self-report to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    /// Address the agent serves its API on, as `host:port`.
    pub endpoint: String,
    pub status: AgentStatus,
}
