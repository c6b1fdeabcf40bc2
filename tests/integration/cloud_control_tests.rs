use std::collections::HashMap;

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use preview_pool::config::CloudConfig;
use preview_pool::models::cloud_task::{ReclaimScope, RuntimeStatus, StopOutcome, TaskSpec};
use preview_pool::substrate::cloud::{CloudControl, HttpCloudControl};
use preview_pool::AppError;

async fn start(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer secret");
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    let ws = body["overrides"]["workspace_id"].as_str().unwrap_or_default();
    (StatusCode::OK, Json(json!({ "task_ref": format!("task-for-{ws}") })))
}

async fn stop(Path(task_ref): Path<String>) -> StatusCode {
    match task_ref.as_str() {
        "gone" => StatusCode::NOT_FOUND,
        "broken" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    }
}

async fn list(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    if query.get("tag").map(String::as_str) == Some("WorkspaceId:ws-9") {
        return Json(json!({ "task_refs": ["t-9"] }));
    }
    match query.get("next_token").map(String::as_str) {
        None => Json(json!({ "task_refs": ["t-1", "t-2"], "next_token": "page-2" })),
        Some(_) => Json(json!({ "task_refs": ["t-3"] })),
    }
}

async fn describe(Json(body): Json<Value>) -> Json<Value> {
    let tasks: Vec<Value> = body["task_refs"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|r| {
            json!({
                "task_ref": r,
                "last_status": "RUNNING",
                "tags": [{ "key": "WorkspaceId", "value": "ws-1" }],
            })
        })
        .collect();
    Json(json!({ "tasks": tasks }))
}

async fn control_plane() -> HttpCloudControl {
    let router = Router::new()
        .route("/clusters/previews/tasks", get(list).post(start))
        .route("/clusters/previews/tasks/describe", post(describe))
        .route("/clusters/previews/tasks/{task_ref}/stop", post(stop));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    HttpCloudControl::new(&CloudConfig {
        endpoint: format!("http://{addr}/"),
        cluster: "previews".into(),
        task_definition: "preview:1".into(),
        request_timeout_seconds: 2,
        token: Some("secret".into()),
    })
    .expect("client")
}

#[tokio::test]
async fn start_sends_token_and_returns_reference() {
    let cloud = control_plane().await;

    let task_ref = cloud
        .start_task(TaskSpec::for_session("ws-1", "s-1", 4001))
        .await
        .expect("start");

    assert_eq!(task_ref, "task-for-ws-1");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let cloud = control_plane().await;

    assert_eq!(
        cloud.stop_task("t-1", "idle").await.expect("stop"),
        StopOutcome::Stopped
    );
    assert_eq!(
        cloud.stop_task("gone", "idle").await.expect("already stopped"),
        StopOutcome::AlreadyAbsent
    );
    assert!(matches!(
        cloud.stop_task("broken", "idle").await,
        Err(AppError::StopFailed(_))
    ));
}

#[tokio::test]
async fn listing_follows_pages() {
    let cloud = control_plane().await;

    let refs = cloud
        .list_running_tasks(ReclaimScope::All)
        .await
        .expect("list");

    assert_eq!(refs, vec!["t-1", "t-2", "t-3"]);
}

#[tokio::test]
async fn workspace_scope_filters_by_tag() {
    let cloud = control_plane().await;

    let refs = cloud
        .list_running_tasks(ReclaimScope::Workspace("ws-9".into()))
        .await
        .expect("list");

    assert_eq!(refs, vec!["t-9"]);
}

#[tokio::test]
async fn describe_maps_status_and_tags() {
    let cloud = control_plane().await;

    let tasks = cloud
        .describe_tasks(vec!["t-1".into()])
        .await
        .expect("describe");

    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].runtime_status, RuntimeStatus::Running);
    assert_eq!(tasks[0].workspace_id(), Some("ws-1"));
    assert!(cloud.describe_tasks(Vec::new()).await.expect("empty").is_empty());
}

#[tokio::test]
async fn unreachable_plane_is_substrate_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let cloud = HttpCloudControl::new(&CloudConfig {
        endpoint: format!("http://127.0.0.1:{port}"),
        cluster: "previews".into(),
        task_definition: "preview:1".into(),
        request_timeout_seconds: 1,
        token: None,
    })
    .expect("client");

    assert!(matches!(
        cloud.list_running_tasks(ReclaimScope::All).await,
        Err(AppError::Substrate(_))
    ));
}
