use std::sync::atomic::Ordering;
use std::sync::Arc;

use preview_pool::cache::planner::paths_for;
use preview_pool::cache::{CacheInvalidator, CachePurge};
use preview_pool::models::session::SessionStatus;
use preview_pool::models::workspace::WorkspaceState;
use preview_pool::orchestrator::cleanup::{CleanupReport, WorkspaceCleanup};

use super::test_helpers::{harness, pool_config, FakeCachePurge, Harness};

fn cleanup_for(h: &Harness) -> (WorkspaceCleanup, Arc<FakeCachePurge>) {
    let fake = Arc::new(FakeCachePurge::default());
    let backend: Arc<dyn CachePurge> = fake.clone();
    let cleanup = WorkspaceCleanup::new(
        Arc::clone(&h.pool),
        Arc::clone(&h.reclaimer),
        CacheInvalidator::new(Some(backend)),
    );
    (cleanup, fake)
}

fn workspace(id: &str) -> WorkspaceState {
    WorkspaceState {
        id: id.into(),
        company_id: "co-1".into(),
        published_url: None,
        session_ids: vec!["s-1".into()],
    }
}

#[tokio::test]
async fn cleanup_stops_session_reclaims_and_purges() {
    let h = harness(pool_config(10)).await;
    let (cleanup, fake) = cleanup_for(&h);
    let handle = h.pool.get_or_start("ws-1").await.expect("start");
    h.cloud.add_task("stray", Some("ws-1"));
    h.cloud.add_task("other", Some("ws-2"));
    let ws = workspace("ws-1");

    let report = cleanup.cleanup(&ws).await;

    assert_eq!(
        report,
        CleanupReport {
            workspace_id: "ws-1".into(),
            session_stopped: true,
            tasks_reclaimed: 1,
            cache_paths_invalidated: paths_for(&ws).len(),
            errors: Vec::new(),
        }
    );
    let row = h.repo.get("ws-1").await.expect("get").expect("row");
    assert_eq!(row.status, SessionStatus::Stopped);
    assert!(!h.cloud.is_running(&handle.cloud_task_ref.expect("task")));
    assert!(!h.cloud.is_running("stray"));
    assert!(h.cloud.is_running("other"), "other workspaces untouched");
    assert_eq!(fake.requests().len(), 1);
}

#[tokio::test]
async fn cleanup_without_session_still_purges() {
    let h = harness(pool_config(10)).await;
    let (cleanup, fake) = cleanup_for(&h);

    let report = cleanup.cleanup(&workspace("ws-idle")).await;

    assert!(!report.session_stopped);
    assert_eq!(report.tasks_reclaimed, 0);
    assert!(report.cache_paths_invalidated > 0);
    assert!(report.errors.is_empty());
    assert_eq!(fake.requests().len(), 1);
}

#[tokio::test]
async fn failed_steps_are_reported_not_raised() {
    let h = harness(pool_config(10)).await;
    let (cleanup, fake) = cleanup_for(&h);
    h.pool.get_or_start("ws-1").await.expect("start");
    h.processes.fail_terminate.store(true, Ordering::SeqCst);
    fake.fail.store(true, Ordering::SeqCst);

    let report = cleanup.cleanup(&workspace("ws-1")).await;

    assert!(!report.session_stopped);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("session:"));
    assert_eq!(report.cache_paths_invalidated, 0);
    let row = h.repo.get("ws-1").await.expect("get").expect("row");
    assert_eq!(row.status, SessionStatus::Running, "left for the sweeper");
}

#[tokio::test]
async fn rejected_workspace_id_touches_nothing() {
    let h = harness(pool_config(10)).await;
    let (cleanup, fake) = cleanup_for(&h);
    h.cloud.add_task("tagged", Some("../ws"));

    let report = cleanup.cleanup(&workspace("../ws")).await;

    assert!(!report.session_stopped);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("workspace:"));
    assert!(h.cloud.is_running("tagged"));
    assert!(fake.requests().is_empty());
}
