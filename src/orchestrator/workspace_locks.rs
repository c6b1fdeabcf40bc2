//! Per-workspace mutual exclusion.
//!
//! One async mutex per workspace id, created on first use. Unrelated
//! workspaces never contend; there is no pool-wide lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard held for the duration of a workspace mutation.
pub type WorkspaceGuard = OwnedMutexGuard<()>;

/// Sharded table of per-workspace locks.
#[derive(Debug, Default)]
pub struct WorkspaceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl WorkspaceLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, workspace_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(workspace_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `workspace_id`.
    pub async fn lock(&self, workspace_id: &str) -> WorkspaceGuard {
        self.slot(workspace_id).lock_owned().await
    }

    /// Exclusive access if nobody holds or awaits the workspace right now.
    #[must_use]
    pub fn try_lock(&self, workspace_id: &str) -> Option<WorkspaceGuard> {
        self.slot(workspace_id).try_lock_owned().ok()
    }

    /// Whether the workspace lock is currently held.
    #[must_use]
    pub fn is_locked(&self, workspace_id: &str) -> bool {
        self.locks
            .get(workspace_id)
            .is_some_and(|m| m.try_lock().is_err())
    }

    /// Drop entries nobody holds or waits on. Returns the number removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        // A holder or waiter always owns a clone of the Arc.
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        before.saturating_sub(self.locks.len())
    }

    /// Number of tracked workspaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no workspace is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
