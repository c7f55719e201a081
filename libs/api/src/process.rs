//! Process identity and the initd's `Fork` surface.

use serde::{Deserialize, Serialize};

/// The identity a forked process runs as.
///
/// When `name` is non-empty it is resolved against the container's user
/// database and takes precedence; otherwise `uid`/`gid` are used directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

impl User {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: 0,
            gid: 0,
        }
    }

    pub fn numeric(uid: u32, gid: u32) -> Self {
        Self {
            name: String::new(),
            uid,
            gid,
        }
    }
}

/// A process to launch inside a container.
///
/// `args[0]` is the command, executed directly; the supervisor interprets no
/// shell syntax. `cwd`, when set, must name an existing directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub user: User,
    pub args: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Request to launch a process under the container's supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkRequest {
    pub process: ProcessSpec,
}

/// Outcome of a `Fork` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkStatus {
    /// The operating system created the child; a pid is present.
    Launched,
    /// No child was created; an error is present and no pid is returned.
    Failed,
}

/// Why a `Fork` call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkFailure {
    IdentityError,
    ExecError,
    NoSuchDirectory,
    InvalidRequest,
}

/// Failure detail carried inside a `ForkResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkError {
    pub reason: ForkFailure,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: ForkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ForkError>,
}

impl ForkResponse {
    pub fn launched(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            status: ForkStatus::Launched,
            error: None,
        }
    }

    pub fn failed(reason: ForkFailure, message: impl Into<String>) -> Self {
        Self {
            pid: None,
            status: ForkStatus::Failed,
            error: Some(ForkError {
                reason,
                message: message.into(),
            }),
        }
    }
}

/// Observed state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Exited,
    Killed,
}

/// One row of the supervisor's process table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub pid: u32,
    pub name: String,
    pub state: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

/// Request to signal a supervised process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillProcessRequest {
    pub signal: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_request_shape() {
        let json = r#"{
            "process": {
                "user": {"name": "root", "uid": 0, "gid": 0},
                "args": ["cd /notexistdir"],
                "name": "test_error_cmd"
            }
        }"#;
        let request: ForkRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.process.user.name, "root");
        assert_eq!(request.process.args, vec!["cd /notexistdir"]);
        assert!(request.process.cwd.is_none());
    }

    #[test]
    fn test_failed_fork_has_no_pid() {
        let response = ForkResponse::failed(ForkFailure::NoSuchDirectory, "missing /x");
        assert!(response.pid.is_none());
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("pid"));
        assert!(json.contains("no_such_directory"));
    }

    #[test]
    fn test_launched_fork_roundtrip() {
        let response = ForkResponse::launched(4242);
        let json = serde_json::to_string(&response).unwrap();
        let back: ForkResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pid, Some(4242));
        assert_eq!(back.status, ForkStatus::Launched);
        assert!(back.error.is_none());
    }
}
