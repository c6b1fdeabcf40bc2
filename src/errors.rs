//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Only [`AppError::CapacityExceeded`] and [`AppError::StartFailed`] are
/// surfaced to callers of
/// [`PoolManager::get_or_start`](crate::orchestrator::pool::PoolManager::get_or_start).
/// Background loops (sweep, reclaim, cache purge) log every other variant
/// and carry on with the next candidate.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Admission denied because the pool is full even after an eviction pass.
    CapacityExceeded(String),
    /// Resources could not be brought to `running`; partial resources were released.
    StartFailed(String),
    /// A resource stop failed; the session is left for the next sweep.
    StopFailed(String),
    /// The cloud control plane could not list or describe resources.
    Substrate(String),
    /// Cache-purge control plane failure.
    Cache(String),
    /// A compare-and-set status transition found an unexpected current status.
    InvalidTransition(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller-supplied input was rejected before any work was done.
    InvalidInput(String),
    /// File-system or process I/O failure.
    Io(String),
}

impl AppError {
    /// Whether the caller may simply retry the operation later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded(_) | Self::StartFailed(_))
    }

    /// Message suitable for presenting to an end user.
    ///
    /// A denied admission reads as a temporary condition rather than a
    /// generic failure.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::CapacityExceeded(_) => "temporarily at capacity, retry shortly".to_owned(),
            Self::StartFailed(_) => {
                "preview session could not be started, retry shortly".to_owned()
            }
            other => other.to_string(),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::CapacityExceeded(msg) => write!(f, "capacity exceeded: {msg}"),
            Self::StartFailed(msg) => write!(f, "start failed: {msg}"),
            Self::StopFailed(msg) => write!(f, "stop failed: {msg}"),
            Self::Substrate(msg) => write!(f, "substrate unavailable: {msg}"),
            Self::Cache(msg) => write!(f, "cache: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
