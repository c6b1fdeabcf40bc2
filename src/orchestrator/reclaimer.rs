//! Orphan reclaimer: stops running cloud tasks no session owns.
//!
//! A task is an orphan when it is running, carries a `WorkspaceId` tag, and
//! the registry has no non-stopped session for that workspace. Untagged
//! tasks are never touched.
//!
//! Attribution is list, describe, check: racy by construction. Ownership is
//! re-checked under the workspace lock immediately before each stop, which
//! narrows the window to a start that begins after the re-check. That
//! residual race is accepted; the worst case is a freshly started session
//! losing its task and being restarted on next use.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::cloud_task::{CloudTask, ReclaimScope, RuntimeStatus, StopOutcome};
use crate::persistence::session_repo::SessionRepo;
use crate::substrate::cloud::CloudControl;
use crate::Result;

use super::workspace_locks::WorkspaceLocks;

/// Task references per describe call.
pub const DESCRIBE_BATCH: usize = 100;

/// Finds and stops orphaned cloud tasks.
pub struct OrphanReclaimer {
    cloud: Option<Arc<dyn CloudControl>>,
    repo: SessionRepo,
    locks: Arc<WorkspaceLocks>,
    max_candidates: usize,
    stop_timeout: Duration,
}

impl OrphanReclaimer {
    /// Create a reclaimer; with `cloud = None` every pass reclaims nothing.
    #[must_use]
    pub fn new(
        cloud: Option<Arc<dyn CloudControl>>,
        repo: SessionRepo,
        locks: Arc<WorkspaceLocks>,
        max_candidates: usize,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            cloud,
            repo,
            locks,
            max_candidates,
            stop_timeout,
        }
    }

    /// List orphans in `scope` without stopping anything.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Substrate` if listing or describing fails, or
    /// `AppError::Db` if the registry cannot be read.
    pub async fn find_orphans(&self, scope: &ReclaimScope) -> Result<Vec<CloudTask>> {
        let Some(cloud) = &self.cloud else {
            return Ok(Vec::new());
        };

        let refs = cloud.list_running_tasks(scope.clone()).await?;
        let mut orphans = Vec::new();
        for batch in refs.chunks(DESCRIBE_BATCH) {
            let described = cloud.describe_tasks(batch.to_vec()).await?;
            for task in described {
                if task.runtime_status != RuntimeStatus::Running {
                    continue;
                }
                let Some(ws) = task.workspace_id() else {
                    debug!(task_ref = task.task_ref, "untagged task, never reclaimed");
                    continue;
                };
                if !scope.includes(ws) {
                    continue;
                }
                if !self.repo.has_non_stopped_session(ws).await? {
                    orphans.push(task);
                }
            }
        }
        Ok(orphans)
    }

    /// Stop orphans in `scope`; returns the number of tasks stopped.
    ///
    /// Listing failures degrade to zero. Individual stop failures are logged
    /// and skipped.
    pub async fn reclaim(&self, scope: &ReclaimScope) -> usize {
        let Some(cloud) = &self.cloud else {
            return 0;
        };

        async move {
            let orphans = match self.find_orphans(scope).await {
                Ok(o) => o,
                Err(err) => {
                    warn!(%err, "orphan discovery failed, nothing reclaimed");
                    return 0;
                }
            };
            if orphans.len() > self.max_candidates {
                info!(
                    found = orphans.len(),
                    cap = self.max_candidates,
                    "orphan count exceeds per-pass cap"
                );
            }

            let mut stopped = 0;
            for task in orphans.into_iter().take(self.max_candidates) {
                if self.reclaim_one(cloud.as_ref(), &task).await {
                    stopped += 1;
                }
            }
            if stopped > 0 {
                info!(stopped, "orphaned cloud tasks reclaimed");
            }
            stopped
        }
        .instrument(info_span!("reclaim", ?scope))
        .await
    }

    async fn reclaim_one(&self, cloud: &dyn CloudControl, task: &CloudTask) -> bool {
        let Some(ws) = task.workspace_id() else {
            return false;
        };
        let task_ref = task.task_ref.as_str();

        let Some(_guard) = self.locks.try_lock(ws) else {
            debug!(workspace_id = ws, task_ref, "workspace busy, task may be claimed");
            return false;
        };
        match self.repo.has_non_stopped_session(ws).await {
            Ok(false) => {}
            Ok(true) => {
                debug!(workspace_id = ws, task_ref, "task claimed since listing");
                return false;
            }
            Err(err) => {
                warn!(workspace_id = ws, %err, "ownership re-check failed");
                return false;
            }
        }

        match timeout(self.stop_timeout, cloud.stop_task(task_ref, "orphaned")).await {
            Ok(Ok(StopOutcome::Stopped)) => {
                info!(workspace_id = ws, task_ref, "orphaned task stopped");
                true
            }
            Ok(Ok(StopOutcome::AlreadyAbsent)) => {
                debug!(workspace_id = ws, task_ref, "orphaned task already gone");
                false
            }
            Ok(Err(err)) => {
                warn!(workspace_id = ws, task_ref, %err, "failed to stop orphaned task");
                false
            }
            Err(_) => {
                warn!(workspace_id = ws, task_ref, "stopping orphaned task timed out");
                false
            }
        }
    }
}
