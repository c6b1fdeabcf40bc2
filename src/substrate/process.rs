//! Local preview server processes.
//!
//! Processes are spawned with:
//! - `kill_on_drop(true)` so a dropped handle never leaks a server.
//! - `env_clear()` plus a small allowlist so control-plane tokens never
//!   reach the preview process.
//! - `--port=<port> --workspace=<dir>` appended to the configured arguments.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::PreviewConfig;
use crate::models::cloud_task::StopOutcome;
use crate::{AppError, Result};

/// Environment variables inherited by the preview process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "NODE_ENV",
    "NODE_OPTIONS",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Time a process gets to exit after the polite signal before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Children spawned by this process, keyed by pid.
pub type ActiveChildren = Arc<Mutex<HashMap<u32, Child>>>;

/// What to launch for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Workspace served by the process.
    pub workspace_id: String,
    /// Session incarnation, exported to the process environment.
    pub session_id: String,
    /// Port the process must listen on.
    pub port: u16,
    /// Workspace directory passed via `--workspace=`.
    pub workspace_dir: PathBuf,
}

/// Starts and stops local preview processes.
pub trait ProcessLauncher: Send + Sync {
    /// Spawn a preview process and return its pid.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StartFailed` if the process cannot be spawned.
    fn launch(&self, request: LaunchRequest)
        -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>>;

    /// Stop the process with the given pid. An absent process is success.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StopFailed` if the process could not be signalled.
    fn terminate(&self, pid: u32) -> Pin<Box<dyn Future<Output = Result<StopOutcome>> + Send + '_>>;
}

/// [`ProcessLauncher`] that runs the configured preview command.
#[derive(Clone)]
pub struct CommandLauncher {
    config: PreviewConfig,
    children: ActiveChildren,
}

impl CommandLauncher {
    /// Create a launcher sharing `children` with the liveness probe.
    #[must_use]
    pub fn new(config: PreviewConfig, children: ActiveChildren) -> Self {
        Self { config, children }
    }

    /// Handle to the tracked child table.
    #[must_use]
    pub fn children(&self) -> ActiveChildren {
        Arc::clone(&self.children)
    }

    fn build_command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .arg(format!("--port={}", request.port))
            .arg(format!("--workspace={}", request.workspace_dir.display()));

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env("PREVIEW_WORKSPACE_ID", &request.workspace_id)
            .env("PREVIEW_SESSION_ID", &request.session_id)
            .env("PORT", request.port.to_string());

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(
        &self,
        request: LaunchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>> {
        Box::pin(async move {
            let mut cmd = self.build_command(&request);
            let child = cmd
                .spawn()
                .map_err(|err| AppError::StartFailed(format!("failed to spawn preview: {err}")))?;
            let pid = child
                .id()
                .ok_or_else(|| AppError::StartFailed("preview exited immediately".into()))?;

            self.children.lock().await.insert(pid, child);
            info!(
                workspace_id = request.workspace_id,
                session_id = request.session_id,
                port = request.port,
                pid,
                "preview process spawned"
            );
            Ok(pid)
        })
    }

    fn terminate(
        &self,
        pid: u32,
    ) -> Pin<Box<dyn Future<Output = Result<StopOutcome>> + Send + '_>> {
        Box::pin(async move {
            let tracked = self.children.lock().await.remove(&pid);
            match tracked {
                Some(child) => terminate_child(pid, child).await,
                None => terminate_untracked(pid).await,
            }
        })
    }
}

/// Stop a child we spawned: polite signal, bounded wait, then kill.
async fn terminate_child(pid: u32, mut child: Child) -> Result<StopOutcome> {
    match child.try_wait() {
        Ok(Some(_)) => return Ok(StopOutcome::AlreadyAbsent),
        Ok(None) => {}
        Err(err) => warn!(pid, %err, "failed to poll preview process"),
    }

    #[cfg(unix)]
    {
        if signal_term(pid).is_ok()
            && tokio::time::timeout(TERMINATE_GRACE, child.wait())
                .await
                .is_ok()
        {
            info!(pid, "preview process exited after SIGTERM");
            return Ok(StopOutcome::Stopped);
        }
    }

    child
        .kill()
        .await
        .map_err(|err| AppError::StopFailed(format!("failed to kill pid {pid}: {err}")))?;
    info!(pid, "preview process killed");
    Ok(StopOutcome::Stopped)
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Result<nix::unistd::Pid> {
    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 1)
        .ok_or_else(|| AppError::StopFailed(format!("refusing to signal pid {pid}")))?;
    Ok(nix::unistd::Pid::from_raw(raw))
}

#[cfg(unix)]
fn signal_term(pid: u32) -> Result<()> {
    nix::sys::signal::kill(to_pid(pid)?, nix::sys::signal::Signal::SIGTERM)
        .map_err(|err| AppError::StopFailed(format!("SIGTERM to pid {pid} failed: {err}")))
}

/// Stop a process we did not spawn (e.g. one that survived a restart).
#[cfg(unix)]
async fn terminate_untracked(pid: u32) -> Result<StopOutcome> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let target = to_pid(pid)?;
    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(StopOutcome::AlreadyAbsent),
        Err(err) => {
            return Err(AppError::StopFailed(format!(
                "SIGTERM to pid {pid} failed: {err}"
            )))
        }
    }

    let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
    while tokio::time::Instant::now() < deadline {
        if kill(target, None) == Err(Errno::ESRCH) {
            return Ok(StopOutcome::Stopped);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    match kill(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(StopOutcome::Stopped),
        Err(err) => Err(AppError::StopFailed(format!(
            "SIGKILL to pid {pid} failed: {err}"
        ))),
    }
}

/// Stop a process we did not spawn (e.g. one that survived a restart).
#[cfg(windows)]
async fn terminate_untracked(pid: u32) -> Result<StopOutcome> {
    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .await
        .map_err(|err| AppError::StopFailed(format!("taskkill failed: {err}")))?;

    if output.status.success() {
        Ok(StopOutcome::Stopped)
    } else if output.status.code() == Some(128) {
        Ok(StopOutcome::AlreadyAbsent)
    } else {
        Err(AppError::StopFailed(format!(
            "taskkill for pid {pid} exited with {}",
            output.status
        )))
    }
}
