//! Scoped acquisition and release of a session's resources.
//!
//! A start acquires, in order: a local port, an optional cloud task, the
//! preview process. Each acquisition is written to a [`StartAttempt`] the
//! caller owns, so a failed or timed-out start can be rolled back with
//! [`ResourceLauncher::release`] even after the start future was dropped.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::liveness::LivenessChecker;
use crate::models::cloud_task::{StopOutcome, TaskSpec};
use crate::models::session::Session;
use crate::models::workspace::workspace_dir;
use crate::substrate::cloud::CloudControl;
use crate::substrate::ports::PortAllocator;
use crate::substrate::process::{LaunchRequest, ProcessLauncher};
use crate::{AppError, Result};

/// Resources acquired so far by one start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acquired {
    /// Reserved local port.
    pub port: Option<u16>,
    /// Started cloud task.
    pub cloud_task_ref: Option<String>,
    /// Spawned preview process.
    pub pid: Option<u32>,
}

/// Shared record of a start in progress.
#[derive(Debug, Default)]
pub struct StartAttempt {
    acquired: Mutex<Acquired>,
}

impl StartAttempt {
    /// Empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of what has been acquired so far.
    #[must_use]
    pub fn snapshot(&self) -> Acquired {
        self.acquired
            .lock()
            .map(|a| a.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn update(&self, f: impl FnOnce(&mut Acquired)) {
        match self.acquired.lock() {
            Ok(mut a) => f(&mut a),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Resources of a session that reached readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedResources {
    /// Port the preview process listens on.
    pub port: u16,
    /// Preview process id.
    pub pid: u32,
    /// Cloud task, when a cloud backend is configured.
    pub cloud_task_ref: Option<String>,
}

/// Timing and layout knobs for the launcher.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Directory holding one subdirectory per workspace.
    pub workspaces_root: PathBuf,
    /// How long a fresh process may take to become healthy.
    pub ready_timeout: Duration,
    /// Delay between readiness probes.
    pub ready_poll_interval: Duration,
    /// Bound on each individual stop call.
    pub stop_timeout: Duration,
}

impl LaunchSettings {
    /// Settings derived from configuration, polling readiness once a second.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            workspaces_root: config.preview.workspaces_root.clone(),
            ready_timeout: config.preview.ready_timeout(),
            ready_poll_interval: Duration::from_secs(1),
            stop_timeout: config.pool.stop_timeout(),
        }
    }
}

/// Starts and stops the resources backing a session.
pub struct ResourceLauncher {
    processes: Arc<dyn ProcessLauncher>,
    cloud: Option<Arc<dyn CloudControl>>,
    ports: Arc<PortAllocator>,
    liveness: LivenessChecker,
    settings: LaunchSettings,
}

impl ResourceLauncher {
    /// Create a launcher; `cloud = None` runs local processes only.
    #[must_use]
    pub fn new(
        processes: Arc<dyn ProcessLauncher>,
        cloud: Option<Arc<dyn CloudControl>>,
        ports: Arc<PortAllocator>,
        liveness: LivenessChecker,
        settings: LaunchSettings,
    ) -> Self {
        Self {
            processes,
            cloud,
            ports,
            liveness,
            settings,
        }
    }

    /// Port allocator shared with the pool statistics.
    #[must_use]
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Bring up every resource for `session` and wait for readiness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for a workspace id that cannot name a
    /// directory, or `AppError::StartFailed` if any step fails. Acquired
    /// resources are left in `attempt` for the caller to
    /// [`release`](Self::release).
    pub async fn start(
        &self,
        session: &Session,
        attempt: &StartAttempt,
    ) -> Result<StartedResources> {
        let ws = session.workspace_id.as_str();
        let sid = session.session_id.as_str();

        let workspace_dir = workspace_dir(&self.settings.workspaces_root, ws)?;
        let port = self.ports.allocate(ws)?;
        attempt.update(|a| a.port = Some(port));

        let cloud_task_ref = match &self.cloud {
            Some(cloud) => {
                let task_ref = cloud
                    .start_task(TaskSpec::for_session(ws, sid, port))
                    .await
                    .map_err(into_start_failed)?;
                attempt.update(|a| a.cloud_task_ref = Some(task_ref.clone()));
                Some(task_ref)
            }
            None => None,
        };

        let pid = self
            .processes
            .launch(LaunchRequest {
                workspace_id: ws.to_owned(),
                session_id: sid.to_owned(),
                port,
                workspace_dir,
            })
            .await
            .map_err(into_start_failed)?;
        attempt.update(|a| a.pid = Some(pid));

        self.wait_ready(pid, port).await?;
        info!(workspace_id = ws, session_id = sid, port, pid, "preview session ready");

        Ok(StartedResources {
            port,
            pid,
            cloud_task_ref,
        })
    }

    async fn wait_ready(&self, pid: u32, port: u16) -> Result<()> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            if !self.liveness.process_alive(pid).await {
                return Err(AppError::StartFailed(format!(
                    "preview process {pid} exited before becoming ready"
                )));
            }
            if self.liveness.endpoint_responding(port).await {
                return Ok(());
            }
            if Instant::now() + self.settings.ready_poll_interval > deadline {
                return Err(AppError::StartFailed(format!(
                    "preview on port {port} not ready within {:?}",
                    self.settings.ready_timeout
                )));
            }
            tokio::time::sleep(self.settings.ready_poll_interval).await;
        }
    }

    /// Stop whatever `attempt` acquired. Failures are logged.
    pub async fn release(&self, attempt: &StartAttempt) {
        let acquired = attempt.snapshot();
        if let Some(pid) = acquired.pid {
            if let Err(err) = self.stop_process(pid).await {
                warn!(pid, %err, "failed to stop process of failed start");
            }
        }
        if let Some(task_ref) = acquired.cloud_task_ref.as_deref() {
            if let Err(err) = self.stop_cloud_task(task_ref, "start failed").await {
                warn!(task_ref, %err, "failed to stop cloud task of failed start");
            }
        }
        if let Some(port) = acquired.port {
            self.ports.release(port);
        }
    }

    /// Stop the process and cloud task recorded on `session`.
    ///
    /// Both stops are attempted even if the first fails. Resources that are
    /// already gone count as success.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StopFailed` if either stop failed or timed out.
    pub async fn stop(&self, session: &Session, reason: &str) -> Result<StopOutcome> {
        let process = match session.process_handle {
            Some(pid) => self.stop_process(pid).await,
            None => Ok(StopOutcome::AlreadyAbsent),
        };
        let cloud = match session.cloud_task_ref.as_deref() {
            Some(task_ref) => self.stop_cloud_task(task_ref, reason).await,
            None => Ok(StopOutcome::AlreadyAbsent),
        };

        match (process, cloud) {
            (Ok(p), Ok(c)) => {
                if let Some(port) = session.endpoint_port {
                    self.ports.release(port);
                }
                Ok(p.merge(c))
            }
            (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
            (Err(p), Err(c)) => Err(AppError::StopFailed(format!("{p}; {c}"))),
        }
    }

    async fn stop_process(&self, pid: u32) -> Result<StopOutcome> {
        timeout(self.settings.stop_timeout, self.processes.terminate(pid))
            .await
            .map_err(|_| AppError::StopFailed(format!("stopping pid {pid} timed out")))?
    }

    async fn stop_cloud_task(&self, task_ref: &str, reason: &str) -> Result<StopOutcome> {
        let Some(cloud) = &self.cloud else {
            warn!(task_ref, "cloud backend not configured, cannot stop task");
            return Ok(StopOutcome::AlreadyAbsent);
        };
        timeout(self.settings.stop_timeout, cloud.stop_task(task_ref, reason))
            .await
            .map_err(|_| AppError::StopFailed(format!("stopping task {task_ref} timed out")))?
    }
}

fn into_start_failed(err: AppError) -> AppError {
    match err {
        AppError::StartFailed(_) => err,
        other => AppError::StartFailed(other.to_string()),
    }
}
