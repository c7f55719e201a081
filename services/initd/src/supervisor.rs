//! Process launching and exit tracking.
//!
//! The supervisor owns the process table for its one container. Each fork:
//! - resolves the requested identity (by name, else numeric uid/gid)
//! - validates the working directory before any child exists
//! - execs `args[0]` directly (no shell interpretation)
//! - tracks the child's exit asynchronously

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use gantry_api::{ProcessSpec, ProcessState, ProcessStatus};
use nix::sys::signal::{self, Signal};
use nix::unistd::{Gid, Pid, Uid, User as SystemUser};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::InitdError;

#[derive(Debug, Clone)]
struct ProcessEntry {
    name: String,
    state: ProcessState,
    exit_code: Option<i32>,
    signal: Option<i32>,
}

/// The supervisor's process table, keyed by pid.
pub struct Supervisor {
    processes: Arc<RwLock<HashMap<u32, ProcessEntry>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Launch a process and start tracking it. Returns the pid once the
    /// operating system has created the child; any failure before that
    /// point produces no pid and no table entry.
    pub async fn fork(&self, spec: ProcessSpec) -> Result<u32, InitdError> {
        if spec.args.is_empty() {
            return Err(InitdError::InvalidRequest(
                "process args must not be empty".to_string(),
            ));
        }

        let (uid, gid) = resolve_identity(&spec.user)?;

        if let Some(cwd) = &spec.cwd {
            if !Path::new(cwd).is_dir() {
                return Err(InitdError::NoSuchDirectory(format!(
                    "working directory {cwd} does not exist"
                )));
            }
        }

        let mut cmd = Command::new(&spec.args[0]);
        cmd.args(&spec.args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        // Drop to the target identity when it differs from our own.
        let switching = uid != Uid::effective().as_raw() || gid != Gid::effective().as_raw();
        if switching {
            unsafe {
                cmd.pre_exec(move || {
                    // Clear supplementary groups, then GID before UID.
                    if libc::setgroups(0, std::ptr::null()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                InitdError::Exec(format!("no such command {:?}", spec.args[0]))
            }
            std::io::ErrorKind::PermissionDenied if switching => InitdError::Identity(format!(
                "switching to uid {uid} gid {gid} was not permitted"
            )),
            std::io::ErrorKind::PermissionDenied => {
                InitdError::Exec(format!("command {:?} is not executable", spec.args[0]))
            }
            _ => InitdError::Exec(format!("failed to spawn {:?}: {e}", spec.args[0])),
        })?;

        let pid = child.id().ok_or_else(|| {
            InitdError::Exec(format!(
                "process {:?} exited before it could be tracked",
                spec.args[0]
            ))
        })?;

        let entry = ProcessEntry {
            name: if spec.name.is_empty() {
                spec.args[0].clone()
            } else {
                spec.name.clone()
            },
            state: ProcessState::Running,
            exit_code: None,
            signal: None,
        };
        let name = entry.name.clone();
        self.processes.write().await.insert(pid, entry);

        info!(pid, name = %name, args = ?spec.args, uid, gid, "process launched");

        // Record the exit without blocking the caller.
        let table = Arc::clone(&self.processes);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    let mut table = table.write().await;
                    if let Some(entry) = table.get_mut(&pid) {
                        if let Some(sig) = status.signal() {
                            entry.state = ProcessState::Killed;
                            entry.signal = Some(sig);
                        } else {
                            entry.state = ProcessState::Exited;
                            entry.exit_code = status.code();
                        }
                    }
                    info!(pid, name = %name, code = ?status.code(), "process exited");
                }
                Err(e) => {
                    warn!(pid, name = %name, error = %e, "wait for process failed");
                }
            }
        });

        Ok(pid)
    }

    /// Send a signal to a tracked process.
    pub async fn kill(&self, pid: u32, signum: i32) -> Result<(), InitdError> {
        if !self.processes.read().await.contains_key(&pid) {
            return Err(InitdError::InvalidRequest(format!(
                "no tracked process with pid {pid}"
            )));
        }
        let sig = Signal::try_from(signum)
            .map_err(|_| InitdError::InvalidRequest(format!("invalid signal {signum}")))?;
        signal::kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| InitdError::Exec(format!("failed to signal pid {pid}: {e}")))?;
        info!(pid, signal = signum, "signal sent");
        Ok(())
    }

    pub async fn status(&self, pid: u32) -> Option<ProcessStatus> {
        self.processes
            .read()
            .await
            .get(&pid)
            .map(|entry| entry.to_status(pid))
    }

    pub async fn list(&self) -> Vec<ProcessStatus> {
        let table = self.processes.read().await;
        let mut statuses: Vec<ProcessStatus> = table
            .iter()
            .map(|(pid, entry)| entry.to_status(*pid))
            .collect();
        statuses.sort_by_key(|s| s.pid);
        statuses
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEntry {
    fn to_status(&self, pid: u32) -> ProcessStatus {
        ProcessStatus {
            pid,
            name: self.name.clone(),
            state: self.state,
            exit_code: self.exit_code,
            signal: self.signal,
        }
    }
}

/// Resolve the identity a process should run as. A non-empty user name is
/// looked up in the local user database and wins over the numeric fields.
fn resolve_identity(user: &gantry_api::User) -> Result<(u32, u32), InitdError> {
    if user.name.is_empty() {
        return Ok((user.uid, user.gid));
    }
    match SystemUser::from_name(&user.name) {
        Ok(Some(entry)) => Ok((entry.uid.as_raw(), entry.gid.as_raw())),
        Ok(None) => Err(InitdError::Identity(format!(
            "user {:?} does not exist",
            user.name
        ))),
        Err(e) => Err(InitdError::Identity(format!(
            "lookup of user {:?} failed: {e}",
            user.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_api::{ForkFailure, User};
    use std::time::Duration;

    fn current_user() -> User {
        User::numeric(Uid::effective().as_raw(), Gid::effective().as_raw())
    }

    fn spec(args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            user: current_user(),
            args: args.iter().map(|s| s.to_string()).collect(),
            name: "test".to_string(),
            cwd: None,
        }
    }

    async fn wait_for_state(
        supervisor: &Supervisor,
        pid: u32,
        state: ProcessState,
    ) -> ProcessStatus {
        for _ in 0..100 {
            if let Some(status) = supervisor.status(pid).await {
                if status.state == state {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("pid {pid} never reached {state:?}");
    }

    #[tokio::test]
    async fn test_fork_tracks_exit() {
        let supervisor = Supervisor::new();
        let pid = supervisor.fork(spec(&["true"])).await.unwrap();
        let status = wait_for_state(&supervisor, pid, ProcessState::Exited).await;
        assert_eq!(status.exit_code, Some(0));
        assert!(status.signal.is_none());
    }

    #[tokio::test]
    async fn test_fork_records_nonzero_exit() {
        let supervisor = Supervisor::new();
        let pid = supervisor.fork(spec(&["false"])).await.unwrap();
        let status = wait_for_state(&supervisor, pid, ProcessState::Exited).await;
        assert_eq!(status.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_shell_composite_is_not_interpreted() {
        let supervisor = Supervisor::new();
        let err = supervisor
            .fork(spec(&["cd /notexistdir"]))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ForkFailure::ExecError);
        assert!(err.message().contains("cd /notexistdir"));
    }

    #[tokio::test]
    async fn test_missing_cwd_rejected_before_spawn() {
        let supervisor = Supervisor::new();
        let mut spec = spec(&["true"]);
        spec.cwd = Some("/notexistdir".to_string());
        let err = supervisor.fork(spec).await.unwrap_err();
        assert_eq!(err.reason(), ForkFailure::NoSuchDirectory);
        assert!(err.message().contains("/notexistdir"));
        assert!(supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_args_rejected() {
        let supervisor = Supervisor::new();
        let err = supervisor.fork(spec(&[])).await.unwrap_err();
        assert_eq!(err.reason(), ForkFailure::InvalidRequest);
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let supervisor = Supervisor::new();
        let mut spec = spec(&["true"]);
        spec.user = User::named("gantry-no-such-user");
        let err = supervisor.fork(spec).await.unwrap_err();
        assert_eq!(err.reason(), ForkFailure::IdentityError);
    }

    #[tokio::test]
    async fn test_kill_records_signal() {
        let supervisor = Supervisor::new();
        let pid = supervisor.fork(spec(&["sleep", "30"])).await.unwrap();
        supervisor.kill(pid, libc::SIGTERM).await.unwrap();
        let status = wait_for_state(&supervisor, pid, ProcessState::Killed).await;
        assert_eq!(status.signal, Some(libc::SIGTERM));
        assert!(status.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_kill_unknown_pid_is_reported() {
        let supervisor = Supervisor::new();
        let err = supervisor.kill(4_000_000, libc::SIGTERM).await.unwrap_err();
        assert_eq!(err.reason(), ForkFailure::InvalidRequest);
    }

    #[tokio::test]
    async fn test_concurrent_forks_get_distinct_pids() {
        let supervisor = Arc::new(Supervisor::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let supervisor = Arc::clone(&supervisor);
            handles.push(tokio::spawn(async move {
                supervisor.fork(spec(&["true"])).await.unwrap()
            }));
        }
        let mut pids = Vec::new();
        for handle in handles {
            pids.push(handle.await.unwrap());
        }
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), 4);
    }
}
