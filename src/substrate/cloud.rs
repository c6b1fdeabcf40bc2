//! Cloud task-execution control plane.
//!
//! [`HttpCloudControl`] speaks a small JSON API rooted at
//! `<endpoint>/clusters/<cluster>/tasks`:
//!
//! | Call | Request |
//! |---|---|
//! | start | `POST /tasks` `{task_definition, tags, overrides}` → `{task_ref}` |
//! | stop | `POST /tasks/<ref>/stop` `{reason}`; 404/410 mean already gone |
//! | list | `GET /tasks?desired_status=RUNNING[&tag=WorkspaceId:<id>][&next_token=..]` |
//! | describe | `POST /tasks/describe` `{task_refs, include: ["TAGS"]}` |

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CloudConfig;
use crate::models::cloud_task::{
    CloudTask, ReclaimScope, RuntimeStatus, StopOutcome, TaskSpec, TaskTag, WORKSPACE_TAG,
};
use crate::{AppError, Result};

/// Pages fetched by one listing before giving up.
const MAX_LIST_PAGES: usize = 100;

/// Remote task operations used by the pool and the reclaimer.
pub trait CloudControl: Send + Sync {
    /// Start a task and return its reference.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StartFailed` if the task could not be started.
    fn start_task(
        &self,
        spec: TaskSpec,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;

    /// Stop a task. Stopping a task that is already gone is success.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StopFailed` for any other failure.
    fn stop_task(
        &self,
        task_ref: &str,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<StopOutcome>> + Send + '_>>;

    /// List references of running tasks within `scope`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Substrate` if the listing fails.
    fn list_running_tasks(
        &self,
        scope: ReclaimScope,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>>;

    /// Describe tasks, including their tags.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Substrate` if the call fails.
    fn describe_tasks(
        &self,
        task_refs: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CloudTask>>> + Send + '_>>;
}

#[derive(Debug, Serialize)]
struct StartTaskBody<'a> {
    task_definition: &'a str,
    tags: &'a [TaskTag],
    overrides: StartOverrides<'a>,
}

#[derive(Debug, Serialize)]
struct StartOverrides<'a> {
    workspace_id: &'a str,
    session_id: &'a str,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct StartTaskResponse {
    task_ref: String,
}

#[derive(Debug, Serialize)]
struct StopTaskBody<'a> {
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListTasksResponse {
    #[serde(default)]
    task_refs: Vec<String>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct DescribeBody<'a> {
    task_refs: &'a [String],
    include: [&'static str; 1],
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    tasks: Vec<DescribedTask>,
}

#[derive(Debug, Deserialize)]
struct DescribedTask {
    task_ref: String,
    #[serde(default)]
    last_status: String,
    #[serde(default)]
    tags: Vec<TaskTag>,
}

/// [`CloudControl`] over HTTP with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpCloudControl {
    client: reqwest::Client,
    base: String,
    task_definition: String,
    token: Option<String>,
}

impl HttpCloudControl {
    /// Build a client for the configured control plane.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build cloud client: {err}")))?;
        Ok(Self {
            client,
            base: format!(
                "{}/clusters/{}/tasks",
                config.endpoint.trim_end_matches('/'),
                config.cluster
            ),
            task_definition: config.task_definition.clone(),
            token: config.token.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn list_page(
        &self,
        scope: &ReclaimScope,
        next_token: Option<&str>,
    ) -> Result<ListTasksResponse> {
        let mut query: Vec<(&str, String)> = vec![("desired_status", "RUNNING".into())];
        if let ReclaimScope::Workspace(id) = scope {
            query.push(("tag", format!("{WORKSPACE_TAG}:{id}")));
        }
        if let Some(token) = next_token {
            query.push(("next_token", token.to_owned()));
        }

        let response = self
            .authorize(self.client.get(&self.base).query(&query))
            .send()
            .await
            .map_err(|err| AppError::Substrate(format!("list tasks failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AppError::Substrate(format!(
                "list tasks returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| AppError::Substrate(format!("invalid list response: {err}")))
    }
}

impl CloudControl for HttpCloudControl {
    fn start_task(
        &self,
        spec: TaskSpec,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move {
            let body = StartTaskBody {
                task_definition: &self.task_definition,
                tags: &spec.tags,
                overrides: StartOverrides {
                    workspace_id: &spec.workspace_id,
                    session_id: &spec.session_id,
                    port: spec.port,
                },
            };
            let response = self
                .authorize(self.client.post(&self.base).json(&body))
                .send()
                .await
                .map_err(|err| AppError::StartFailed(format!("start task failed: {err}")))?;
            if !response.status().is_success() {
                return Err(AppError::StartFailed(format!(
                    "start task returned {}",
                    response.status()
                )));
            }
            let started: StartTaskResponse = response
                .json()
                .await
                .map_err(|err| AppError::StartFailed(format!("invalid start response: {err}")))?;

            info!(
                workspace_id = spec.workspace_id,
                session_id = spec.session_id,
                task_ref = started.task_ref,
                "cloud task started"
            );
            Ok(started.task_ref)
        })
    }

    fn stop_task(
        &self,
        task_ref: &str,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<StopOutcome>> + Send + '_>> {
        let task_ref = task_ref.to_owned();
        let reason = reason.to_owned();
        Box::pin(async move {
            let url = format!("{}/{task_ref}/stop", self.base);
            let response = self
                .authorize(self.client.post(&url).json(&StopTaskBody { reason: &reason }))
                .send()
                .await
                .map_err(|err| {
                    AppError::StopFailed(format!("stop task {task_ref} failed: {err}"))
                })?;

            match response.status() {
                status if status.is_success() => {
                    info!(task_ref, reason, "cloud task stopped");
                    Ok(StopOutcome::Stopped)
                }
                StatusCode::NOT_FOUND | StatusCode::GONE => {
                    debug!(task_ref, "cloud task already gone");
                    Ok(StopOutcome::AlreadyAbsent)
                }
                status => Err(AppError::StopFailed(format!(
                    "stop task {task_ref} returned {status}"
                ))),
            }
        })
    }

    fn list_running_tasks(
        &self,
        scope: ReclaimScope,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move {
            let mut refs = Vec::new();
            let mut next: Option<String> = None;
            for _ in 0..MAX_LIST_PAGES {
                let page = self.list_page(&scope, next.as_deref()).await?;
                refs.extend(page.task_refs);
                match page.next_token {
                    Some(token) if !token.is_empty() => next = Some(token),
                    _ => return Ok(refs),
                }
            }
            Err(AppError::Substrate(format!(
                "task listing exceeded {MAX_LIST_PAGES} pages"
            )))
        })
    }

    fn describe_tasks(
        &self,
        task_refs: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CloudTask>>> + Send + '_>> {
        Box::pin(async move {
            if task_refs.is_empty() {
                return Ok(Vec::new());
            }
            let url = format!("{}/describe", self.base);
            let body = DescribeBody {
                task_refs: &task_refs,
                include: ["TAGS"],
            };
            let response = self
                .authorize(self.client.post(&url).json(&body))
                .send()
                .await
                .map_err(|err| AppError::Substrate(format!("describe tasks failed: {err}")))?;
            if !response.status().is_success() {
                return Err(AppError::Substrate(format!(
                    "describe tasks returned {}",
                    response.status()
                )));
            }
            let described: DescribeResponse = response
                .json()
                .await
                .map_err(|err| AppError::Substrate(format!("invalid describe response: {err}")))?;

            Ok(described
                .tasks
                .into_iter()
                .map(|t| CloudTask {
                    runtime_status: RuntimeStatus::from_provider(&t.last_status),
                    task_ref: t.task_ref,
                    tags: t.tags,
                })
                .collect())
        })
    }
}
