use std::sync::Arc;

use chrono::{Duration, Utc};

use preview_pool::activity::{
    ActivityStore, ActivityTracker, MemoryActivityStore, MAX_TTL_SECONDS,
};
use preview_pool::persistence::activity_repo::SqliteActivityStore;
use preview_pool::persistence::db;

async fn sqlite_store() -> SqliteActivityStore {
    let database = db::connect_memory().await.expect("db connect");
    SqliteActivityStore::new(Arc::new(database))
}

#[test]
fn key_uses_activity_prefix() {
    assert_eq!(ActivityTracker::key("ws-1"), "preview_activity:ws-1");
}

#[test]
fn ttl_outlives_idle_threshold_by_a_minute() {
    let tracker = ActivityTracker::new(Arc::new(MemoryActivityStore::new()), 300);
    assert_eq!(tracker.ttl_seconds(), 360);
}

#[tokio::test]
async fn huge_threshold_is_clamped_not_overflowed() {
    let tracker = ActivityTracker::new(Arc::new(MemoryActivityStore::new()), u64::MAX);
    assert_eq!(tracker.ttl_seconds(), MAX_TTL_SECONDS);

    tracker.touch("ws-1").await;
    assert!(tracker.last_activity("ws-1").await.expect("read").is_some());

    let store = sqlite_store().await;
    store.put("k", "v".into(), u64::MAX).await.expect("put");
    assert_eq!(store.get("k").await.expect("get").as_deref(), Some("v"));
}

#[tokio::test]
async fn record_then_read_back() {
    let tracker = ActivityTracker::new(Arc::new(MemoryActivityStore::new()), 300);
    let at = Utc::now() - Duration::seconds(42);

    tracker.record("ws-1", at).await;

    let read = tracker.last_activity("ws-1").await.expect("read");
    assert_eq!(read.map(|t| t.timestamp_micros()), Some(at.timestamp_micros()));
    assert!(tracker.last_activity("ws-2").await.expect("read").is_none());
}

#[tokio::test]
async fn touch_overwrites_previous_entry() {
    let tracker = ActivityTracker::new(Arc::new(MemoryActivityStore::new()), 300);
    let old = Utc::now() - Duration::seconds(1000);
    tracker.record("ws-1", old).await;

    tracker.touch("ws-1").await;

    let read = tracker
        .last_activity("ws-1")
        .await
        .expect("read")
        .expect("entry");
    assert!(read > old);
}

#[tokio::test]
async fn clear_removes_entry() {
    let tracker = ActivityTracker::new(Arc::new(MemoryActivityStore::new()), 300);
    tracker.touch("ws-1").await;

    tracker.clear("ws-1").await;

    assert!(tracker.last_activity("ws-1").await.expect("read").is_none());
}

#[tokio::test]
async fn memory_entries_expire() {
    let store = MemoryActivityStore::new();
    store.put("k", "v".into(), 0).await.expect("put");
    assert!(store.get("k").await.expect("get").is_none());

    store.put("k", "v".into(), 60).await.expect("put");
    assert_eq!(store.get("k").await.expect("get").as_deref(), Some("v"));
}

#[tokio::test]
async fn unreadable_entry_reads_as_absent() {
    let store = Arc::new(MemoryActivityStore::new());
    store
        .put(&ActivityTracker::key("ws-1"), "not a timestamp".into(), 60)
        .await
        .expect("put");
    let tracker = ActivityTracker::new(store, 300);

    assert!(tracker.last_activity("ws-1").await.expect("read").is_none());
}

#[tokio::test]
async fn sqlite_store_upserts_and_expires() {
    let store = sqlite_store().await;

    store.put("k", "first".into(), 60).await.expect("put");
    store.put("k", "second".into(), 60).await.expect("put");
    assert_eq!(store.get("k").await.expect("get").as_deref(), Some("second"));

    store.put("gone", "v".into(), 0).await.expect("put");
    assert!(store.get("gone").await.expect("get").is_none());

    let purged = store
        .purge_expired(Utc::now() + Duration::seconds(1))
        .await
        .expect("purge");
    assert_eq!(purged, 1);

    store.remove("k").await.expect("remove");
    assert!(store.get("k").await.expect("get").is_none());
}

#[tokio::test]
async fn tracker_over_sqlite_store() {
    let tracker = ActivityTracker::new(Arc::new(sqlite_store().await), 300);
    let at = Utc::now() - Duration::seconds(5);

    tracker.record("ws-1", at).await;

    let read = tracker
        .last_activity("ws-1")
        .await
        .expect("read")
        .expect("entry");
    assert_eq!(read.timestamp_micros(), at.timestamp_micros());
}
