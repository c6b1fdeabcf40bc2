//! Stopping a session: status compare-and-set around the resource stop.

use std::sync::Arc;

use tracing::{info, warn};

use crate::activity::ActivityTracker;
use crate::models::cloud_task::StopOutcome;
use crate::models::session::{Session, SessionStatus};
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

use super::launcher::ResourceLauncher;

/// Registry, tracker and launcher shared by every orchestrator component.
#[derive(Clone)]
pub struct Lifecycle {
    /// Session registry.
    pub repo: SessionRepo,
    /// Activity tracker.
    pub tracker: ActivityTracker,
    /// Resource launcher.
    pub launcher: Arc<ResourceLauncher>,
}

impl Lifecycle {
    /// Bundle the shared components.
    #[must_use]
    pub fn new(
        repo: SessionRepo,
        tracker: ActivityTracker,
        launcher: Arc<ResourceLauncher>,
    ) -> Self {
        Self {
            repo,
            tracker,
            launcher,
        }
    }

    /// Stop `session` and move it to `stopped`.
    ///
    /// The row goes to `stopping` first; on a failed stop it is reverted to
    /// its prior status so the next sweep retries. The caller must hold the
    /// workspace lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the row changed underneath,
    /// or `AppError::StopFailed` if the resources could not be stopped.
    pub async fn stop_session(&self, session: &Session, reason: &str) -> Result<StopOutcome> {
        let ws = session.workspace_id.as_str();
        let sid = session.session_id.as_str();
        let prior = session.status;

        if prior == SessionStatus::Stopped {
            return Ok(StopOutcome::AlreadyAbsent);
        }
        if prior == SessionStatus::Starting {
            // Under the workspace lock a `starting` row is left over from an
            // interrupted start.
            return self.abandon_start(session, reason).await;
        }
        if prior != SessionStatus::Stopping
            && !self
                .repo
                .transition(ws, sid, &[prior], SessionStatus::Stopping)
                .await?
        {
            return Err(AppError::InvalidTransition(format!(
                "session {sid} of {ws} is no longer {prior}"
            )));
        }

        match self.launcher.stop(session, reason).await {
            Ok(outcome) => {
                let last_activity = match self.tracker.last_activity(ws).await {
                    Ok(at) => at,
                    Err(err) => {
                        warn!(workspace_id = ws, %err, "activity unreadable at stop");
                        None
                    }
                };
                self.repo
                    .mark_stopped(ws, sid, &[SessionStatus::Stopping], last_activity)
                    .await?;
                self.tracker.clear(ws).await;
                info!(workspace_id = ws, session_id = sid, ?outcome, reason, "session stopped");
                Ok(outcome)
            }
            Err(err) => {
                warn!(workspace_id = ws, session_id = sid, %err, "session stop failed");
                if prior != SessionStatus::Stopping {
                    if let Err(revert) = self
                        .repo
                        .transition(ws, sid, &[SessionStatus::Stopping], prior)
                        .await
                    {
                        warn!(workspace_id = ws, %revert, "failed to revert stopping status");
                    }
                }
                Err(err)
            }
        }
    }

    async fn abandon_start(&self, session: &Session, reason: &str) -> Result<StopOutcome> {
        let ws = session.workspace_id.as_str();
        let outcome = match self.launcher.stop(session, reason).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(workspace_id = ws, %err, "failed to stop resources of interrupted start");
                StopOutcome::AlreadyAbsent
            }
        };
        self.repo
            .mark_stopped(ws, &session.session_id, &[SessionStatus::Starting], None)
            .await?;
        self.tracker.clear(ws).await;
        info!(workspace_id = ws, session_id = session.session_id, "interrupted start abandoned");
        Ok(outcome)
    }
}
