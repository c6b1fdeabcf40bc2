//! Session liveness: local process AND network health endpoint.
//!
//! A session is healthy only when both checks pass. Every failure mode
//! (timeout, refused connection, missing process, missing handle) reads as
//! unhealthy; nothing here returns an error.

pub mod process;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::PreviewConfig;
use crate::models::session::{Session, SessionStatus};
use crate::{AppError, Result};

pub use process::{platform_probe, ProcessProbe, TrackedProcessProbe};

/// Answers whether a session endpoint responds to its health check.
pub trait HealthProbe: Send + Sync {
    /// `true` when `GET <health_path>` on `port` succeeds in time.
    fn probe(&self, port: u16) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// [`HealthProbe`] over loopback HTTP.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    /// Build a probe with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(path: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build health client: {err}")))?;
        Ok(Self {
            client,
            path: path.into(),
        })
    }

    /// Build a probe from the preview configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn from_config(config: &PreviewConfig) -> Result<Self> {
        Self::new(config.health_path.clone(), config.health_timeout())
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe(&self, port: u16) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let url = format!("http://127.0.0.1:{port}{}", self.path);
            match self.client.get(&url).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(err) => {
                    debug!(port, %err, "health probe failed");
                    false
                }
            }
        })
    }
}

/// Per-check detail for operators.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    /// Workspace checked.
    pub workspace_id: String,
    /// Incarnation checked.
    pub session_id: String,
    /// Registry status at check time.
    pub status: SessionStatus,
    /// Process check result; `None` when no process handle is recorded.
    pub process_alive: Option<bool>,
    /// Endpoint check result; `None` when no port is recorded.
    pub endpoint_responding: Option<bool>,
    /// Both checks passed.
    pub healthy: bool,
    /// When the checks ran.
    pub checked_at: DateTime<Utc>,
}

/// Combines a process probe and a health probe.
#[derive(Clone)]
pub struct LivenessChecker {
    process: Arc<dyn ProcessProbe>,
    health: Arc<dyn HealthProbe>,
}

impl LivenessChecker {
    /// Create a checker from the two probes.
    #[must_use]
    pub fn new(process: Arc<dyn ProcessProbe>, health: Arc<dyn HealthProbe>) -> Self {
        Self { process, health }
    }

    /// `true` only if the process is alive and the endpoint responds.
    ///
    /// The process check runs first; a dead process skips the network probe.
    pub async fn is_healthy(&self, session: &Session) -> bool {
        let (Some(pid), Some(port)) = (session.process_handle, session.endpoint_port) else {
            return false;
        };
        self.check(pid, port).await
    }

    /// Process-then-network check for a raw pid and port.
    pub async fn check(&self, pid: u32, port: u16) -> bool {
        if !self.process.is_alive(pid).await {
            debug!(pid, port, "process not alive");
            return false;
        }
        self.health.probe(port).await
    }

    /// Process check alone.
    pub async fn process_alive(&self, pid: u32) -> bool {
        self.process.is_alive(pid).await
    }

    /// Network check alone.
    pub async fn endpoint_responding(&self, port: u16) -> bool {
        self.health.probe(port).await
    }

    /// Run both checks unconditionally and report each result.
    pub async fn report(&self, session: &Session) -> HealthReport {
        let process_alive = match session.process_handle {
            Some(pid) => Some(self.process.is_alive(pid).await),
            None => None,
        };
        let endpoint_responding = match session.endpoint_port {
            Some(port) => Some(self.health.probe(port).await),
            None => None,
        };
        HealthReport {
            workspace_id: session.workspace_id.clone(),
            session_id: session.session_id.clone(),
            status: session.status,
            healthy: process_alive == Some(true) && endpoint_responding == Some(true),
            process_alive,
            endpoint_responding,
            checked_at: Utc::now(),
        }
    }
}
