//! Admission controller: get-or-start preview sessions under a capacity ceiling.
//!
//! Every mutation of a workspace's session runs under that workspace's lock,
//! so concurrent `get_or_start` calls for one workspace attempt at most one
//! start and the later callers observe the running session. Capacity is
//! enforced by the registry's atomic admission statement, not by a lock.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{info, info_span, warn, Instrument};

use crate::config::PoolConfig;
use crate::liveness::{HealthReport, LivenessChecker};
use crate::models::session::{HandleOrigin, Session, SessionHandle, SessionStatus};
use crate::models::workspace::validate_workspace_id;
use crate::persistence::session_repo::Admission;
use crate::{AppError, Result};

use super::launcher::StartAttempt;
use super::lifecycle::Lifecycle;
use super::sweeper::EvictionSweeper;
use super::workspace_locks::WorkspaceLocks;

/// Pool utilisation snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    /// Sessions occupying a slot.
    pub active: u64,
    /// Capacity ceiling.
    pub capacity: u32,
    /// `active / capacity` as a percentage, one decimal.
    pub utilization_percent: f64,
    /// Slots left before admission is refused.
    pub available_slots: u64,
    /// First port of the preview range.
    pub port_range_start: u16,
    /// Last port of the preview range.
    pub port_range_end: u16,
}

/// Hands out live sessions, starting them on demand.
pub struct PoolManager {
    lifecycle: Lifecycle,
    liveness: LivenessChecker,
    locks: Arc<WorkspaceLocks>,
    sweeper: Arc<EvictionSweeper>,
    config: PoolConfig,
}

impl PoolManager {
    /// Create a pool; the sweeper it uses for capacity relief is built here.
    #[must_use]
    pub fn new(
        lifecycle: Lifecycle,
        liveness: LivenessChecker,
        locks: Arc<WorkspaceLocks>,
        config: PoolConfig,
    ) -> Self {
        let sweeper = Arc::new(EvictionSweeper::new(
            lifecycle.clone(),
            liveness.clone(),
            Arc::clone(&locks),
            config.clone(),
        ));
        Self {
            lifecycle,
            liveness,
            locks,
            sweeper,
            config,
        }
    }

    /// The sweeper shared with the background scheduler.
    #[must_use]
    pub fn sweeper(&self) -> Arc<EvictionSweeper> {
        Arc::clone(&self.sweeper)
    }

    /// The lock table shared with the sweeper and reclaimer.
    #[must_use]
    pub fn locks(&self) -> Arc<WorkspaceLocks> {
        Arc::clone(&self.locks)
    }

    /// Return a healthy session for `workspace_id`, starting one if needed.
    ///
    /// # Errors
    ///
    /// - `AppError::CapacityExceeded` if the pool is full after one sweep.
    /// - `AppError::StartFailed` if resources could not be brought up; any
    ///   partial resources have been released.
    /// - `AppError::InvalidInput` if the workspace id is rejected.
    /// - `AppError::Db` if the registry fails.
    pub async fn get_or_start(&self, workspace_id: &str) -> Result<SessionHandle> {
        validate_workspace_id(workspace_id)?;
        let span = info_span!("get_or_start", workspace_id);
        async move {
            let _guard = self.locks.lock(workspace_id).await;

            if let Some(existing) = self.lifecycle.repo.get(workspace_id).await? {
                if let Some(handle) = self.reuse_or_retire(existing).await? {
                    return Ok(handle);
                }
            }

            let session = self.admit(workspace_id).await?;
            self.start(session).await
        }
        .instrument(span)
        .await
    }

    /// Reuse a healthy session, or stop whatever is left of an unusable one.
    async fn reuse_or_retire(&self, existing: Session) -> Result<Option<SessionHandle>> {
        let ws = existing.workspace_id.as_str();
        match existing.status {
            SessionStatus::Stopped => Ok(None),
            SessionStatus::Running | SessionStatus::Idle => {
                if self.liveness.is_healthy(&existing).await {
                    if let Some(handle) = self.refresh(&existing).await? {
                        return Ok(Some(handle));
                    }
                }
                warn!(
                    workspace_id = ws,
                    session_id = existing.session_id,
                    "session unhealthy, restarting"
                );
                self.retire(&existing, "unhealthy").await?;
                Ok(None)
            }
            SessionStatus::Starting | SessionStatus::Stopping => {
                self.retire(&existing, "interrupted").await?;
                Ok(None)
            }
        }
    }

    async fn retire(&self, session: &Session, reason: &str) -> Result<()> {
        self.lifecycle
            .stop_session(session, reason)
            .await
            .map(|_| ())
            .map_err(|err| {
                AppError::StartFailed(format!("previous session could not be stopped: {err}"))
            })
    }

    /// Mark a healthy session used and build its handle.
    async fn refresh(&self, session: &Session) -> Result<Option<SessionHandle>> {
        let ws = session.workspace_id.as_str();
        let sid = session.session_id.as_str();
        if session.status == SessionStatus::Idle
            && !self
                .lifecycle
                .repo
                .transition(ws, sid, &[SessionStatus::Idle], SessionStatus::Running)
                .await?
        {
            return Ok(None);
        }

        let now = Utc::now();
        self.lifecycle.tracker.record(ws, now).await;
        self.lifecycle.repo.record_activity(ws, sid, now).await?;
        Ok(SessionHandle::from_session(session, HandleOrigin::Reused))
    }

    async fn admit(&self, workspace_id: &str) -> Result<Session> {
        let capacity = self.config.capacity;
        let first = self.lifecycle.repo.admit(workspace_id, capacity).await?;
        let outcome = if first == Admission::AtCapacity {
            let freed = self.sweeper.sweep().await;
            info!(workspace_id, freed, "pool at capacity, swept once");
            self.lifecycle.repo.admit(workspace_id, capacity).await?
        } else {
            first
        };

        match outcome {
            Admission::Admitted(session) => Ok(session),
            Admission::AtCapacity => {
                let active = self.lifecycle.repo.count_live().await.unwrap_or(u64::from(capacity));
                warn!(workspace_id, active, capacity, "admission refused");
                Err(AppError::CapacityExceeded(format!(
                    "{active} of {capacity} preview sessions in use"
                )))
            }
            Admission::Occupied(session) => Err(AppError::StartFailed(format!(
                "workspace session is {}",
                session.status
            ))),
        }
    }

    async fn start(&self, session: Session) -> Result<SessionHandle> {
        let ws = session.workspace_id.as_str();
        let sid = session.session_id.as_str();
        let attempt = StartAttempt::new();

        let started = match timeout(
            self.config.start_timeout(),
            self.lifecycle.launcher.start(&session, &attempt),
        )
        .await
        {
            Ok(Ok(started)) => started,
            Ok(Err(err)) => return Err(self.fail_start(&session, &attempt, err.to_string()).await),
            Err(_) => {
                let msg = format!("start timed out after {:?}", self.config.start_timeout());
                return Err(self.fail_start(&session, &attempt, msg).await);
            }
        };

        let now = Utc::now();
        let recorded = self
            .lifecycle
            .repo
            .mark_running(
                ws,
                sid,
                started.port,
                Some(started.pid),
                started.cloud_task_ref.as_deref(),
                now,
            )
            .await;
        match recorded {
            Ok(true) => {}
            Ok(false) => {
                return Err(self
                    .fail_start(&session, &attempt, "session changed during start".into())
                    .await)
            }
            Err(err) => return Err(self.fail_start(&session, &attempt, err.to_string()).await),
        }
        self.lifecycle.tracker.record(ws, now).await;

        let running = Session {
            status: SessionStatus::Running,
            endpoint_port: Some(started.port),
            process_handle: Some(started.pid),
            cloud_task_ref: started.cloud_task_ref,
            last_activity_at: Some(now),
            updated_at: now,
            ..session
        };
        info!(
            workspace_id = running.workspace_id,
            session_id = running.session_id,
            "session started"
        );
        SessionHandle::from_session(&running, HandleOrigin::Started)
            .ok_or_else(|| AppError::StartFailed("started session has no endpoint".into()))
    }

    /// Release partial resources, record `stopped`, and build the error.
    async fn fail_start(&self, session: &Session, attempt: &StartAttempt, msg: String) -> AppError {
        let ws = session.workspace_id.as_str();
        warn!(
            workspace_id = ws,
            session_id = session.session_id,
            error = msg,
            "start failed, releasing"
        );
        self.lifecycle.launcher.release(attempt).await;
        if let Err(err) = self
            .lifecycle
            .repo
            .mark_stopped(ws, &session.session_id, &[SessionStatus::Starting], None)
            .await
        {
            warn!(workspace_id = ws, %err, "failed to record stopped after failed start");
        }
        AppError::StartFailed(msg)
    }

    /// Refresh activity for a live session. Returns `false` if there is none.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` if the workspace id is rejected, or
    /// `AppError::Db` if the registry fails.
    pub async fn touch(&self, workspace_id: &str) -> Result<bool> {
        validate_workspace_id(workspace_id)?;
        let _guard = self.locks.lock(workspace_id).await;
        match self.lifecycle.repo.get(workspace_id).await? {
            Some(session)
                if matches!(session.status, SessionStatus::Running | SessionStatus::Idle) =>
            {
                Ok(self.refresh(&session).await?.is_some())
            }
            _ => Ok(false),
        }
    }

    /// Stop the workspace's session. Returns `false` if nothing was running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` if the workspace id is rejected,
    /// `AppError::StopFailed` if resources could not be stopped, or
    /// `AppError::Db` if the registry fails.
    pub async fn stop(&self, workspace_id: &str) -> Result<bool> {
        validate_workspace_id(workspace_id)?;
        let _guard = self.locks.lock(workspace_id).await;
        match self.lifecycle.repo.get(workspace_id).await? {
            Some(session) if session.status.is_non_stopped() => {
                self.lifecycle.stop_session(&session, "requested").await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Registry row for the workspace, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry fails.
    pub async fn status(&self, workspace_id: &str) -> Result<Option<Session>> {
        self.lifecycle.repo.get(workspace_id).await
    }

    /// Run both liveness checks on the workspace's session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry fails.
    pub async fn health_report(&self, workspace_id: &str) -> Result<Option<HealthReport>> {
        match self.lifecycle.repo.get_live(workspace_id).await? {
            Some(session) => Ok(Some(self.liveness.report(&session).await)),
            None => Ok(None),
        }
    }

    /// Current utilisation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry fails.
    pub async fn stats(&self) -> Result<PoolStats> {
        let active = self.lifecycle.repo.count_live().await?;
        let capacity = self.config.capacity;
        let (port_range_start, port_range_end) = self.lifecycle.launcher.ports().range();
        #[allow(clippy::cast_precision_loss)]
        let utilization_percent =
            ((active as f64 / f64::from(capacity)) * 1000.0).round() / 10.0;
        Ok(PoolStats {
            active,
            capacity,
            utilization_percent,
            available_slots: u64::from(capacity).saturating_sub(active),
            port_range_start,
            port_range_end,
        })
    }

    /// Settle rows left behind by a previous run.
    ///
    /// `starting` and `stopping` rows are stopped. `running`/`idle` rows
    /// whose resources no longer pass the liveness check are stopped too.
    /// Returns the number of sessions settled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be listed.
    pub async fn recover(&self) -> Result<usize> {
        let sessions = self.lifecycle.repo.list_with_status(&[
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Idle,
            SessionStatus::Stopping,
        ])
        .await?;

        let mut settled = 0;
        for session in sessions {
            let ws = session.workspace_id.as_str();
            let _guard = self.locks.lock(ws).await;
            let healthy_live =
                matches!(session.status, SessionStatus::Running | SessionStatus::Idle)
                    && self.liveness.is_healthy(&session).await;
            if healthy_live {
                continue;
            }
            match self.lifecycle.stop_session(&session, "recovery").await {
                Ok(_) => settled += 1,
                Err(err) => warn!(workspace_id = ws, %err, "failed to settle session on startup"),
            }
        }
        info!(settled, "startup recovery completed");
        Ok(settled)
    }

    /// Stop every non-stopped session. Returns the number stopped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be listed.
    pub async fn shutdown(&self) -> Result<usize> {
        let sessions = self.lifecycle.repo.list_with_status(&[
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Idle,
            SessionStatus::Stopping,
        ])
        .await?;

        let mut stopped = 0;
        for session in sessions {
            let _guard = self.locks.lock(&session.workspace_id).await;
            match self.lifecycle.stop_session(&session, "shutdown").await {
                Ok(_) => stopped += 1,
                Err(err) => {
                    warn!(
                        workspace_id = session.workspace_id,
                        %err,
                        "failed to stop session on shutdown"
                    );
                }
            }
        }
        info!(stopped, "pool shut down");
        Ok(stopped)
    }
}
