//! Best-effort cache invalidation.
//!
//! Nothing in this module returns an error to its caller: a failed purge is
//! logged and reported as `None` or zero so the workflow that triggered it
//! carries on.

pub mod planner;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::models::workspace::{InvalidationRequest, InvalidationStatus, WorkspaceState};
use crate::{AppError, Result};

/// Prefix of every idempotency token.
pub const CALLER_REFERENCE_PREFIX: &str = "workspace-cleanup";

/// Default page size for recent invalidations.
pub const DEFAULT_RECENT_LIMIT: u32 = 10;

/// Cache-purge control plane.
pub trait CachePurge: Send + Sync {
    /// Submit one batched invalidation and return its identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cache` if the request fails.
    fn create_invalidation(
        &self,
        request: InvalidationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;

    /// Look up one invalidation; `None` if unknown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cache` if the request fails.
    fn get_invalidation_status(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<InvalidationStatus>>> + Send + '_>>;

    /// Most recent invalidations, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cache` if the request fails.
    fn list_recent_invalidations(
        &self,
        max_items: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InvalidationStatus>>> + Send + '_>>;
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    paths: PathBatch<'a>,
    caller_reference: &'a str,
}

#[derive(Debug, Serialize)]
struct PathBatch<'a> {
    quantity: usize,
    items: &'a [String],
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<InvalidationStatus>,
}

/// [`CachePurge`] over `<endpoint>/distributions/<id>/invalidations`.
#[derive(Debug, Clone)]
pub struct HttpCachePurge {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpCachePurge {
    /// Build a client for the configured distribution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build cache client: {err}")))?;
        Ok(Self {
            client,
            base: format!(
                "{}/distributions/{}/invalidations",
                config.endpoint.trim_end_matches('/'),
                config.distribution_id
            ),
            token: config.token.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn cache_err(what: &str, err: impl std::fmt::Display) -> AppError {
    AppError::Cache(format!("{what}: {err}"))
}

impl CachePurge for HttpCachePurge {
    fn create_invalidation(
        &self,
        request: InvalidationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move {
            let body = CreateBody {
                paths: PathBatch {
                    quantity: request.paths.len(),
                    items: &request.paths,
                },
                caller_reference: &request.caller_reference,
            };
            let response = self
                .authorize(self.client.post(&self.base).json(&body))
                .send()
                .await
                .map_err(|err| cache_err("create invalidation failed", err))?;
            if !response.status().is_success() {
                return Err(AppError::Cache(format!(
                    "create invalidation returned {}",
                    response.status()
                )));
            }
            let created: CreateResponse = response
                .json()
                .await
                .map_err(|err| cache_err("invalid create response", err))?;
            Ok(created.id)
        })
    }

    fn get_invalidation_status(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<InvalidationStatus>>> + Send + '_>> {
        let id = id.to_owned();
        Box::pin(async move {
            let url = format!("{}/{id}", self.base);
            let response = self
                .authorize(self.client.get(&url))
                .send()
                .await
                .map_err(|err| cache_err("get invalidation failed", err))?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(AppError::Cache(format!(
                    "get invalidation returned {}",
                    response.status()
                )));
            }
            let status: InvalidationStatus = response
                .json()
                .await
                .map_err(|err| cache_err("invalid status response", err))?;
            Ok(Some(status))
        })
    }

    fn list_recent_invalidations(
        &self,
        max_items: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InvalidationStatus>>> + Send + '_>> {
        Box::pin(async move {
            let response = self
                .authorize(
                    self.client
                        .get(&self.base)
                        .query(&[("max_items", max_items)]),
                )
                .send()
                .await
                .map_err(|err| cache_err("list invalidations failed", err))?;
            if !response.status().is_success() {
                return Err(AppError::Cache(format!(
                    "list invalidations returned {}",
                    response.status()
                )));
            }
            let list: ListResponse = response
                .json()
                .await
                .map_err(|err| cache_err("invalid list response", err))?;
            Ok(list.items)
        })
    }
}

/// Plans and submits invalidations, swallowing every failure.
#[derive(Clone)]
pub struct CacheInvalidator {
    backend: Option<Arc<dyn CachePurge>>,
}

impl CacheInvalidator {
    /// Invalidator over `backend`; `None` disables every operation.
    #[must_use]
    pub fn new(backend: Option<Arc<dyn CachePurge>>) -> Self {
        Self { backend }
    }

    /// Invalidator with no backend.
    #[must_use]
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    /// Whether a purge backend is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Fresh idempotency token.
    #[must_use]
    pub fn caller_reference() -> String {
        format!("{CALLER_REFERENCE_PREFIX}-{}", Uuid::new_v4())
    }

    /// Submit `paths` as one batch; `None` when disabled, empty, or failed.
    pub async fn create_invalidation(&self, paths: Vec<String>) -> Option<String> {
        let Some(backend) = &self.backend else {
            info!("cache purge not configured, skipping invalidation");
            return None;
        };
        if paths.is_empty() {
            return None;
        }

        let request = InvalidationRequest {
            paths,
            caller_reference: Self::caller_reference(),
        };
        let count = request.paths.len();
        let reference = request.caller_reference.clone();
        match backend.create_invalidation(request).await {
            Ok(id) => {
                info!(invalidation_id = id, paths_count = count, "cache invalidation created");
                Some(id)
            }
            Err(err) => {
                error!(caller_reference = reference, %err, "cache invalidation failed");
                None
            }
        }
    }

    /// Purge every path the workspace owns; returns the number of paths submitted.
    pub async fn invalidate_workspace(&self, workspace: &WorkspaceState) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let paths = planner::paths_for(workspace);
        let count = paths.len();
        match self.create_invalidation(paths).await {
            Some(_) => {
                info!(workspace_id = workspace.id, paths_count = count, "workspace cache purged");
                count
            }
            None => 0,
        }
    }

    /// Purge the paths of the given sessions; returns the number of paths submitted.
    pub async fn invalidate_sessions(&self, session_ids: &[String]) -> usize {
        if !self.is_enabled() || session_ids.is_empty() {
            return 0;
        }
        let paths = planner::session_paths(session_ids);
        let count = paths.len();
        self.create_invalidation(paths).await.map_or(0, |_| count)
    }

    /// Purge the broad stale patterns; returns the number of invalidations created.
    pub async fn invalidate_stale(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        usize::from(self.create_invalidation(planner::stale_paths()).await.is_some())
    }

    /// Status of one invalidation; `None` when disabled, unknown, or failed.
    pub async fn invalidation_status(&self, id: &str) -> Option<InvalidationStatus> {
        let backend = self.backend.as_ref()?;
        match backend.get_invalidation_status(id).await {
            Ok(status) => status,
            Err(err) => {
                error!(invalidation_id = id, %err, "failed to read invalidation status");
                None
            }
        }
    }

    /// Up to `max_items` recent invalidations; empty when disabled or failed.
    pub async fn recent_invalidations(&self, max_items: u32) -> Vec<InvalidationStatus> {
        let Some(backend) = &self.backend else {
            return Vec::new();
        };
        match backend.list_recent_invalidations(max_items).await {
            Ok(items) => items,
            Err(err) => {
                error!(%err, "failed to list invalidations");
                Vec::new()
            }
        }
    }
}
