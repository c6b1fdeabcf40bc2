//! Local HTTP surface over the pool.
//!
//! Routes:
//! - `GET /health` plain-text liveness of the service itself.
//! - `GET /stats` pool utilisation.
//! - `POST /workspaces/{id}/session` get or start the workspace's session.
//! - `GET /workspaces/{id}/session` registry row.
//! - `DELETE /workspaces/{id}/session` stop the session.
//! - `POST /workspaces/{id}/activity` record user activity.
//! - `GET /workspaces/{id}/health` run both liveness checks.
//! - `POST /workspaces/{id}/cleanup` full workspace teardown.
//! - `POST /cache/stale` purge the broad stale patterns.
//! - `POST /cache/sessions` purge the paths of the given sessions.
//! - `GET /cache/invalidations[?max_items=n]` recent invalidations.
//! - `GET /cache/invalidations/{id}` one invalidation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{CacheInvalidator, DEFAULT_RECENT_LIMIT};
use crate::models::workspace::{validate_workspace_id, WorkspaceState};
use crate::orchestrator::cleanup::WorkspaceCleanup;
use crate::orchestrator::pool::PoolManager;
use crate::{AppError, Result};

/// Seconds a refused caller is asked to wait.
pub const RETRY_AFTER_SECONDS: u64 = 5;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    /// Session pool.
    pub pool: Arc<PoolManager>,
    /// Workspace teardown service.
    pub cleanup: Arc<WorkspaceCleanup>,
    /// Cache invalidation front end.
    pub cache: CacheInvalidator,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    retryable: bool,
}

/// Handler-level error wrapping [`AppError`].
#[derive(Debug)]
pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            AppError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::StartFailed(_) | AppError::StopFailed(_) | AppError::Substrate(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidTransition(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match &self.0 {
            AppError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            AppError::StartFailed(_) => "START_FAILED",
            AppError::StopFailed(_) => "STOP_FAILED",
            AppError::Substrate(_) => "SUBSTRATE_UNAVAILABLE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::InvalidTransition(_) => "CONFLICT",
            _ => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(%status, err = %self.0, "request failed");
        }
        let body = Json(ErrorBody {
            error: self.error_code(),
            message: self.0.user_message(),
            retryable: self.0.is_retryable(),
        });
        if matches!(self.0, AppError::CapacityExceeded(_)) {
            (
                status,
                [(header::RETRY_AFTER, RETRY_AFTER_SECONDS.to_string())],
                body,
            )
                .into_response()
        } else {
            (status, body).into_response()
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
struct Touched {
    workspace_id: String,
    recorded: bool,
}

/// Request body for a workspace cleanup. The path segment supplies the id.
#[derive(Debug, Deserialize)]
struct CleanupRequest {
    #[serde(default)]
    company_id: String,
    #[serde(default)]
    published_url: Option<String>,
    #[serde(default)]
    session_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SessionPathsRequest {
    session_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    max_items: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Purged {
    paths: usize,
}

#[derive(Debug, Serialize)]
struct StalePurged {
    invalidations: usize,
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pool.stats().await?))
}

async fn get_or_start(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.pool.get_or_start(&workspace_id).await?))
}

async fn session_status(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .pool
        .status(&workspace_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::NotFound(format!("no session for workspace {workspace_id}")).into()
        })
}

async fn stop_session(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.pool.stop(&workspace_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("no live session for workspace {workspace_id}")).into())
    }
}

async fn touch(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let recorded = state.pool.touch(&workspace_id).await?;
    Ok(Json(Touched {
        workspace_id,
        recorded,
    }))
}

async fn health_report(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .pool
        .health_report(&workspace_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::NotFound(format!("no live session for workspace {workspace_id}")).into()
        })
}

async fn cleanup(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
    Json(req): Json<CleanupRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_workspace_id(&workspace_id)?;
    let workspace = WorkspaceState {
        id: workspace_id,
        company_id: req.company_id,
        published_url: req.published_url,
        session_ids: req.session_ids,
    };
    Ok(Json(state.cleanup.cleanup(&workspace).await))
}

async fn purge_stale(State(state): State<ApiState>) -> impl IntoResponse {
    Json(StalePurged {
        invalidations: state.cache.invalidate_stale().await,
    })
}

async fn purge_sessions(
    State(state): State<ApiState>,
    Json(req): Json<SessionPathsRequest>,
) -> impl IntoResponse {
    Json(Purged {
        paths: state.cache.invalidate_sessions(&req.session_ids).await,
    })
}

async fn recent_invalidations(
    State(state): State<ApiState>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let max_items = query.max_items.unwrap_or(DEFAULT_RECENT_LIMIT);
    Json(state.cache.recent_invalidations(max_items).await)
}

async fn invalidation_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .cache
        .invalidation_status(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("invalidation {id}")).into())
}

/// Build the router over `state`.
#[must_use]
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route(
            "/workspaces/{id}/session",
            post(get_or_start).get(session_status).delete(stop_session),
        )
        .route("/workspaces/{id}/activity", post(touch))
        .route("/workspaces/{id}/health", get(health_report))
        .route("/workspaces/{id}/cleanup", post(cleanup))
        .route("/cache/stale", post(purge_stale))
        .route("/cache/sessions", post(purge_sessions))
        .route("/cache/invalidations", get(recent_invalidations))
        .route("/cache/invalidations/{id}", get(invalidation_status))
        .with_state(state)
}

/// Serve the API on `127.0.0.1:port` until `cancel` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind or the server fails.
pub async fn serve(state: ApiState, port: u16, cancel: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind API on {bind}: {err}")))?;

    info!(%bind, "starting pool API");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("API server error: {err}")))?;

    info!("pool API shut down");
    Ok(())
}
