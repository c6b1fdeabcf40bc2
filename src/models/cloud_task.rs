//! Remote cloud task model and substrate result types.

use serde::{Deserialize, Serialize};

/// Tag key that attributes a cloud task to a workspace.
pub const WORKSPACE_TAG: &str = "WorkspaceId";

/// Tag key that records the session incarnation that started a task.
pub const SESSION_TAG: &str = "SessionId";

/// Runtime status reported by the cloud substrate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    /// Task is running (or about to).
    Running,
    /// Task has stopped.
    Stopped,
    /// Substrate reported a status this crate does not model.
    Unknown,
}

impl RuntimeStatus {
    /// Map a provider status string (case-insensitive).
    #[must_use]
    pub fn from_provider(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "running" | "pending" | "provisioning" | "activating" => Self::Running,
            "stopped" | "stopping" | "deprovisioning" | "deactivating" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

/// Key/value tag attached to a cloud task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// A remote compute unit, optionally bound to a session via its tags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudTask {
    /// Opaque task reference.
    pub task_ref: String,
    /// Tags, including [`WORKSPACE_TAG`] for attributed tasks.
    #[serde(default)]
    pub tags: Vec<TaskTag>,
    /// Observed runtime status.
    pub runtime_status: RuntimeStatus,
}

impl CloudTask {
    /// The workspace this task is attributed to, if the tag is present and non-empty.
    #[must_use]
    pub fn workspace_id(&self) -> Option<&str> {
        self.tag(WORKSPACE_TAG)
    }

    /// Look up a tag value by key.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Parameters for starting a cloud task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    /// Workspace the task serves.
    pub workspace_id: String,
    /// Session incarnation the task belongs to.
    pub session_id: String,
    /// Local preview port the task pairs with.
    pub port: u16,
    /// Tags to attach (always includes the workspace tag).
    pub tags: Vec<TaskTag>,
}

impl TaskSpec {
    /// Build a spec with the standard workspace and session tags.
    #[must_use]
    pub fn for_session(workspace_id: &str, session_id: &str, port: u16) -> Self {
        Self {
            workspace_id: workspace_id.to_owned(),
            session_id: session_id.to_owned(),
            port,
            tags: vec![
                TaskTag {
                    key: WORKSPACE_TAG.to_owned(),
                    value: workspace_id.to_owned(),
                },
                TaskTag {
                    key: SESSION_TAG.to_owned(),
                    value: session_id.to_owned(),
                },
            ],
        }
    }
}

/// Successful outcome of an idempotent stop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The resource was running and has been stopped.
    Stopped,
    /// The resource was already gone.
    AlreadyAbsent,
}

impl StopOutcome {
    /// Combine the outcomes of stopping two resources of the same session.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        if self == Self::Stopped || other == Self::Stopped {
            Self::Stopped
        } else {
            Self::AlreadyAbsent
        }
    }
}

/// Which running cloud resources a reclaim pass considers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "workspace_id")]
pub enum ReclaimScope {
    /// Every running task in the cluster.
    All,
    /// Only tasks tagged for one workspace.
    Workspace(String),
}

impl ReclaimScope {
    /// Whether a task attributed to `workspace_id` falls inside this scope.
    #[must_use]
    pub fn includes(&self, workspace_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Workspace(id) => id == workspace_id,
        }
    }
}
