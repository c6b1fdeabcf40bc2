//! Retention service for time-based data purge.
//!
//! Runs as a background task deleting registry rows that have been
//! `stopped` for longer than `retention_days`, plus expired activity rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::activity_repo::SqliteActivityStore;
use super::db::Database;
use super::session_repo::SessionRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Rows removed by one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    /// Stopped sessions deleted.
    pub sessions: u64,
    /// Expired activity entries deleted.
    pub activity: u64,
}

/// Spawn the retention purge background task.
///
/// The task runs hourly, starting immediately.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run one purge pass.
///
/// # Errors
///
/// Returns `AppError::Db` if either delete fails.
pub async fn purge(db: &Arc<Database>, retention_days: u32) -> Result<PurgeCounts> {
    let now = Utc::now();
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));

    let sessions = SessionRepo::new(Arc::clone(db))
        .purge_stopped_before(cutoff)
        .await?;
    let activity = SqliteActivityStore::new(Arc::clone(db))
        .purge_expired(now)
        .await?;

    info!(retention_days, sessions, activity, "retention purge completed");
    Ok(PurgeCounts { sessions, activity })
}
