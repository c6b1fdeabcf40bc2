//! Workspace teardown: session, orphaned tasks, cached paths.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::cache::CacheInvalidator;
use crate::models::cloud_task::ReclaimScope;
use crate::models::workspace::{validate_workspace_id, WorkspaceState};

use super::pool::PoolManager;
use super::reclaimer::OrphanReclaimer;

/// What a cleanup achieved. Step failures are collected, never raised.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    /// Workspace cleaned.
    pub workspace_id: String,
    /// A live session was stopped.
    pub session_stopped: bool,
    /// Orphaned cloud tasks stopped.
    pub tasks_reclaimed: usize,
    /// Cache paths submitted for invalidation.
    pub cache_paths_invalidated: usize,
    /// Messages of failed steps.
    pub errors: Vec<String>,
}

/// Tears down everything a workspace owns, one isolated step at a time.
pub struct WorkspaceCleanup {
    pool: Arc<PoolManager>,
    reclaimer: Arc<OrphanReclaimer>,
    cache: CacheInvalidator,
}

impl WorkspaceCleanup {
    /// Create a cleanup service.
    #[must_use]
    pub fn new(
        pool: Arc<PoolManager>,
        reclaimer: Arc<OrphanReclaimer>,
        cache: CacheInvalidator,
    ) -> Self {
        Self {
            pool,
            reclaimer,
            cache,
        }
    }

    /// Stop the session, reclaim the workspace's tasks, purge its cache paths.
    pub async fn cleanup(&self, workspace: &WorkspaceState) -> CleanupReport {
        let ws = workspace.id.as_str();
        async move {
            let mut report = CleanupReport {
                workspace_id: ws.to_owned(),
                ..CleanupReport::default()
            };
            if let Err(err) = validate_workspace_id(ws) {
                warn!(%err, "workspace cleanup rejected");
                report.errors.push(format!("workspace: {err}"));
                return report;
            }

            match self.pool.stop(ws).await {
                Ok(stopped) => report.session_stopped = stopped,
                Err(err) => {
                    warn!(workspace_id = ws, %err, "session stop failed during cleanup");
                    report.errors.push(format!("session: {err}"));
                }
            }

            report.tasks_reclaimed = self
                .reclaimer
                .reclaim(&ReclaimScope::Workspace(ws.to_owned()))
                .await;

            report.cache_paths_invalidated = self.cache.invalidate_workspace(workspace).await;

            info!(
                workspace_id = ws,
                session_stopped = report.session_stopped,
                tasks = report.tasks_reclaimed,
                paths = report.cache_paths_invalidated,
                "workspace cleanup completed"
            );
            report
        }
        .instrument(info_span!("workspace_cleanup", workspace_id = ws))
        .await
    }
}
