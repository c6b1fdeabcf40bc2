//! Preview session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status for a preview session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Admitted; resources are being brought up.
    Starting,
    /// Resources are up and the session was used recently.
    Running,
    /// Resources are up but the session has not been used for a while.
    Idle,
    /// Resources are being torn down.
    Stopping,
    /// Resources released; the row is kept for reuse and retention.
    Stopped,
}

impl SessionStatus {
    /// Statuses that occupy a slot in the pool.
    pub const LIVE: [Self; 3] = [Self::Starting, Self::Running, Self::Idle];

    /// Stable database representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "idle" => Some(Self::Idle),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Whether the status counts against the capacity ceiling.
    #[must_use]
    pub fn is_live(self) -> bool {
        Self::LIVE.contains(&self)
    }

    /// Whether the session still owns (or may own) infrastructure.
    #[must_use]
    pub fn is_non_stopped(self) -> bool {
        self != Self::Stopped
    }

    /// Whether `self -> next` is a permitted lifecycle transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running | Self::Stopped)
                | (Self::Running, Self::Idle | Self::Stopping | Self::Stopped)
                | (Self::Idle, Self::Running | Self::Stopping | Self::Stopped)
                | (Self::Stopping, Self::Stopped | Self::Running | Self::Idle)
                | (Self::Stopped, Self::Starting)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One workspace's ephemeral compute resource, as recorded in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Stable external key; one row per workspace.
    pub workspace_id: String,
    /// Identifier of the current incarnation, regenerated on every admitted start.
    pub session_id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Local port the preview server listens on.
    pub endpoint_port: Option<u16>,
    /// Operating-system process id of the local preview server.
    pub process_handle: Option<u32>,
    /// Reference to the remote cloud task, when one was started.
    pub cloud_task_ref: Option<String>,
    /// When the current incarnation was admitted.
    pub started_at: DateTime<Utc>,
    /// Last use, mirrored from the activity tracker when the session stops.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Last registry mutation.
    pub updated_at: DateTime<Utc>,
    /// When the current incarnation reached `stopped`.
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Construct a freshly admitted session in `starting` status.
    #[must_use]
    pub fn new(workspace_id: String) -> Self {
        let now = Utc::now();
        Self {
            workspace_id,
            session_id: Uuid::new_v4().to_string(),
            status: SessionStatus::Starting,
            endpoint_port: None,
            process_handle: None,
            cloud_task_ref: None,
            started_at: now,
            last_activity_at: None,
            updated_at: now,
            stopped_at: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        self.status.can_transition_to(next)
    }

    /// Base URL of the session's local endpoint, if a port is assigned.
    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint_port
            .map(|port| format!("http://127.0.0.1:{port}"))
    }

    /// Browser-facing preview URL for the workspace.
    #[must_use]
    pub fn preview_url(&self) -> Option<String> {
        self.endpoint_port
            .map(|port| format!("http://localhost:{port}/preview/{}", self.workspace_id))
    }
}

/// Whether a `get_or_start` call reused an existing session or started a new one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandleOrigin {
    /// A healthy session already existed.
    Reused,
    /// New resources were started for this call.
    Started,
}

/// Caller-facing view of a live session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionHandle {
    /// Workspace the session belongs to.
    pub workspace_id: String,
    /// Current incarnation identifier.
    pub session_id: String,
    /// Local port of the preview server.
    pub port: u16,
    /// Base URL of the preview server.
    pub endpoint: String,
    /// Browser-facing preview URL.
    pub preview_url: String,
    /// Remote task reference, if any.
    pub cloud_task_ref: Option<String>,
    /// Reuse or fresh start.
    pub origin: HandleOrigin,
}

impl SessionHandle {
    /// Build a handle from a running session.
    ///
    /// Returns `None` when the session has no endpoint port recorded.
    #[must_use]
    pub fn from_session(session: &Session, origin: HandleOrigin) -> Option<Self> {
        let port = session.endpoint_port?;
        Some(Self {
            workspace_id: session.workspace_id.clone(),
            session_id: session.session_id.clone(),
            port,
            endpoint: session.endpoint()?,
            preview_url: session.preview_url()?,
            cloud_task_ref: session.cloud_task_ref.clone(),
            origin,
        })
    }
}
