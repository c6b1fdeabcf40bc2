//! Eviction sweeper: stops sessions idle past the threshold and sessions
//! whose resources fail the liveness check.
//!
//! Dead sessions are stopped, never restarted here; the next `get_or_start`
//! for the workspace brings up a fresh one. Each candidate is handled in
//! isolation. A workspace whose lock is held is skipped this pass, a failed
//! stop leaves the session for the next pass, and neither aborts the sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::PoolConfig;
use crate::liveness::LivenessChecker;
use crate::models::session::{Session, SessionStatus};

use super::lifecycle::Lifecycle;
use super::workspace_locks::WorkspaceLocks;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Candidates examined.
    pub examined: usize,
    /// Sessions stopped, idle or dead.
    pub stopped: usize,
    /// Of `stopped`, sessions that failed the liveness check.
    pub unhealthy: usize,
    /// Sessions moved from `running` to `idle`.
    pub marked_idle: usize,
    /// Candidates skipped because their workspace was busy or changed.
    pub skipped: usize,
    /// Stops that failed.
    pub failed: usize,
}

/// Stops sessions whose last activity is older than the idle threshold.
pub struct EvictionSweeper {
    lifecycle: Lifecycle,
    liveness: LivenessChecker,
    locks: Arc<WorkspaceLocks>,
    config: PoolConfig,
}

impl EvictionSweeper {
    /// Create a sweeper.
    #[must_use]
    pub fn new(
        lifecycle: Lifecycle,
        liveness: LivenessChecker,
        locks: Arc<WorkspaceLocks>,
        config: PoolConfig,
    ) -> Self {
        Self {
            lifecycle,
            liveness,
            locks,
            config,
        }
    }

    /// Run one pass; returns the number of sessions stopped.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await.stopped
    }

    /// Run one pass as of `now` and report every outcome.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        async move {
            let mut report = SweepReport::default();
            let candidates = match self
                .lifecycle
                .repo
                .list_sweep_candidates(self.config.max_candidates_per_pass)
                .await
            {
                Ok(c) => c,
                Err(err) => {
                    warn!(%err, "failed to list sweep candidates");
                    return report;
                }
            };

            for candidate in candidates {
                report.examined += 1;
                self.consider(&candidate, now, &mut report).await;
            }

            if report.stopped > 0 || report.failed > 0 {
                info!(
                    examined = report.examined,
                    stopped = report.stopped,
                    unhealthy = report.unhealthy,
                    idle = report.marked_idle,
                    skipped = report.skipped,
                    failed = report.failed,
                    "sweep completed"
                );
            } else {
                debug!(examined = report.examined, idle = report.marked_idle, "sweep completed");
            }
            report
        }
        .instrument(info_span!("sweep"))
        .await
    }

    async fn consider(&self, candidate: &Session, now: DateTime<Utc>, report: &mut SweepReport) {
        let ws = candidate.workspace_id.as_str();

        let Some(_guard) = self.locks.try_lock(ws) else {
            debug!(workspace_id = ws, "workspace busy, skipping");
            report.skipped += 1;
            return;
        };

        // Re-read under the lock; the listed row may be stale.
        let session = match self.lifecycle.repo.get(ws).await {
            Ok(Some(s))
                if s.session_id == candidate.session_id
                    && matches!(s.status, SessionStatus::Running | SessionStatus::Idle) =>
            {
                s
            }
            Ok(_) => {
                report.skipped += 1;
                return;
            }
            Err(err) => {
                warn!(workspace_id = ws, %err, "failed to re-read sweep candidate");
                report.skipped += 1;
                return;
            }
        };

        let last_activity = match self.lifecycle.tracker.last_activity(ws).await {
            Ok(at) => at.unwrap_or(session.started_at),
            Err(err) => {
                warn!(workspace_id = ws, %err, "activity unreadable, skipping");
                report.skipped += 1;
                return;
            }
        };
        let inactive = now.signed_duration_since(last_activity);

        if inactive >= self.config.idle_threshold() {
            if self.evict(&session, "idle timeout", report).await {
                info!(
                    workspace_id = ws,
                    session_id = session.session_id,
                    inactive_seconds = inactive.num_seconds(),
                    "idle session evicted"
                );
            }
        } else if !self.liveness.is_healthy(&session).await {
            if self.evict(&session, "unhealthy", report).await {
                warn!(
                    workspace_id = ws,
                    session_id = session.session_id,
                    "dead session stopped, slot released"
                );
                report.unhealthy += 1;
            }
        } else if inactive >= self.config.idle_after() && session.status == SessionStatus::Running {
            match self
                .lifecycle
                .repo
                .transition(ws, &session.session_id, &[SessionStatus::Running], SessionStatus::Idle)
                .await
            {
                Ok(true) => report.marked_idle += 1,
                Ok(false) => {}
                Err(err) => warn!(workspace_id = ws, %err, "failed to mark session idle"),
            }
        }
    }

    /// Stop one candidate, counting the outcome. Returns whether it stopped.
    async fn evict(&self, session: &Session, reason: &str, report: &mut SweepReport) -> bool {
        match self.lifecycle.stop_session(session, reason).await {
            Ok(_) => {
                report.stopped += 1;
                true
            }
            Err(err) => {
                warn!(
                    workspace_id = session.workspace_id,
                    reason,
                    %err,
                    "eviction failed, will retry next sweep"
                );
                report.failed += 1;
                false
            }
        }
    }
}
