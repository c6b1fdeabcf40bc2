//! Workspace state consumed by the cache path planner.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Longest accepted workspace identifier.
pub const MAX_WORKSPACE_ID_LEN: usize = 128;

/// Reject identifiers that could escape the workspaces root or corrupt tags
/// and cache paths.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` for empty or over-long ids, path
/// separators, `..`, and control characters.
pub fn validate_workspace_id(workspace_id: &str) -> Result<()> {
    let reason = if workspace_id.is_empty() {
        Some("must not be empty")
    } else if workspace_id.len() > MAX_WORKSPACE_ID_LEN {
        Some("is too long")
    } else if workspace_id.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if workspace_id.contains("..") {
        Some("must not contain '..'")
    } else if workspace_id.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(AppError::InvalidInput(format!("workspace id {reason}"))),
        None => Ok(()),
    }
}

/// Directory of `workspace_id` under `root`, validated first.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` if the id is rejected by
/// [`validate_workspace_id`].
pub fn workspace_dir(root: &Path, workspace_id: &str) -> Result<PathBuf> {
    validate_workspace_id(workspace_id)?;
    Ok(root.join(workspace_id))
}

/// The parts of a workspace that determine which cache paths it owns.
///
/// Workspaces themselves live in an external system; callers pass the
/// relevant snapshot in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceState {
    /// Workspace identifier.
    pub id: String,
    /// Owning company identifier, part of build and workspace paths.
    pub company_id: String,
    /// Published URL of the workspace's game, if published.
    pub published_url: Option<String>,
    /// Identifiers of live sessions associated with the workspace.
    #[serde(default)]
    pub session_ids: Vec<String>,
}

/// A batch of cache paths plus its idempotency token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidationRequest {
    /// Path patterns to purge.
    pub paths: Vec<String>,
    /// Unique per request so unrelated batches are never deduplicated.
    pub caller_reference: String,
}

/// Status of a cache invalidation as reported by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidationStatus {
    /// Invalidation identifier.
    pub id: String,
    /// Provider status, e.g. `InProgress` or `Completed`.
    pub status: String,
    /// When the invalidation was created.
    pub create_time: Option<DateTime<Utc>>,
    /// Number of paths in the batch, when reported.
    #[serde(default)]
    pub paths_count: Option<u32>,
}
