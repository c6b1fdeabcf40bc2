//! `SQLite`-backed activity store.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::activity::{ActivityStore, MAX_TTL_SECONDS};
use crate::config::seconds_delta;
use crate::Result;

use super::db::Database;
use super::fmt_ts;

/// Activity store persisted in the `activity` table.
///
/// Expired rows are invisible to reads and deleted by the retention task.
#[derive(Clone)]
pub struct SqliteActivityStore {
    db: Arc<Database>,
}

impl SqliteActivityStore {
    /// Create a new store instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Delete entries that expired before `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM activity WHERE expires_at <= ?1")
            .bind(fmt_ts(now))
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

impl ActivityStore for SqliteActivityStore {
    fn put(
        &self,
        key: &str,
        value: String,
        ttl_seconds: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let key = key.to_owned();
        Box::pin(async move {
            let now = Utc::now();
            let expires_at = now
                .checked_add_signed(seconds_delta(ttl_seconds.min(MAX_TTL_SECONDS)))
                .unwrap_or(now);
            sqlx::query(
                "INSERT INTO activity (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE
                 SET value = excluded.value, expires_at = excluded.expires_at",
            )
            .bind(&key)
            .bind(&value)
            .bind(fmt_ts(expires_at))
            .execute(self.db.as_ref())
            .await?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        let key = key.to_owned();
        Box::pin(async move {
            let value: Option<String> =
                sqlx::query_scalar("SELECT value FROM activity WHERE key = ?1 AND expires_at > ?2")
                    .bind(&key)
                    .bind(fmt_ts(Utc::now()))
                    .fetch_optional(self.db.as_ref())
                    .await?;
            Ok(value)
        })
    }

    fn remove(&self, key: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let key = key.to_owned();
        Box::pin(async move {
            sqlx::query("DELETE FROM activity WHERE key = ?1")
                .bind(&key)
                .execute(self.db.as_ref())
                .await?;
            Ok(())
        })
    }
}
