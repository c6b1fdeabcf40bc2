//! Activity tracking over an injected key/value store.
//!
//! Each use of a session refreshes a timestamp under
//! `preview_activity:<workspace_id>`. Entries expire `idle_threshold + 60s`
//! after their last write, so a missing entry reads as "idle since start".

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::warn;

use crate::persistence::{fmt_ts, parse_ts};
use crate::Result;

/// Key prefix for activity entries.
pub const ACTIVITY_KEY_PREFIX: &str = "preview_activity:";

/// Grace added to the idle threshold before an entry expires.
pub const TTL_GRACE_SECONDS: u64 = 60;

/// Longest expiry a store honours; larger TTLs are clamped to it.
pub const MAX_TTL_SECONDS: u64 = 10 * 365 * 86_400;

/// Persistent key/value store with per-entry expiry.
pub trait ActivityStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the backing store fails.
    fn put(
        &self,
        key: &str,
        value: String,
        ttl_seconds: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Read the value under `key`; expired entries read as absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the backing store fails.
    fn get(&self, key: &str) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;

    /// Delete the entry under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the backing store fails.
    fn remove(&self, key: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Process-local store with lazy expiry.
#[derive(Debug, Default)]
pub struct MemoryActivityStore {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryActivityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivityStore for MemoryActivityStore {
    fn put(
        &self,
        key: &str,
        value: String,
        ttl_seconds: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let key = key.to_owned();
        Box::pin(async move {
            let now = Instant::now();
            let expires = now
                .checked_add(Duration::from_secs(ttl_seconds.min(MAX_TTL_SECONDS)))
                .unwrap_or(now);
            self.entries.insert(key, (value, expires));
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        let key = key.to_owned();
        Box::pin(async move {
            let now = Instant::now();
            let value = self
                .entries
                .get(&key)
                .and_then(|entry| (entry.1 > now).then(|| entry.0.clone()));
            if value.is_none() {
                self.entries.remove_if(&key, |_, (_, expires)| *expires <= now);
            }
            Ok(value)
        })
    }

    fn remove(&self, key: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let key = key.to_owned();
        Box::pin(async move {
            self.entries.remove(&key);
            Ok(())
        })
    }
}

/// Records and reads per-workspace last-use timestamps.
#[derive(Clone)]
pub struct ActivityTracker {
    store: Arc<dyn ActivityStore>,
    ttl_seconds: u64,
}

impl ActivityTracker {
    /// Create a tracker whose entries outlive the idle threshold by one minute.
    #[must_use]
    pub fn new(store: Arc<dyn ActivityStore>, idle_threshold_seconds: u64) -> Self {
        Self {
            store,
            ttl_seconds: idle_threshold_seconds
                .saturating_add(TTL_GRACE_SECONDS)
                .min(MAX_TTL_SECONDS),
        }
    }

    /// Store key for a workspace.
    #[must_use]
    pub fn key(workspace_id: &str) -> String {
        format!("{ACTIVITY_KEY_PREFIX}{workspace_id}")
    }

    /// Entry lifetime in seconds.
    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Mark the workspace as used now.
    pub async fn touch(&self, workspace_id: &str) {
        self.record(workspace_id, Utc::now()).await;
    }

    /// Mark the workspace as used at `at`. Store failures are logged only.
    pub async fn record(&self, workspace_id: &str, at: DateTime<Utc>) {
        let key = Self::key(workspace_id);
        if let Err(err) = self.store.put(&key, fmt_ts(at), self.ttl_seconds).await {
            warn!(workspace_id, %err, "failed to record activity");
        }
    }

    /// Last recorded use, or `None` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns the store error so callers can skip rather than guess.
    pub async fn last_activity(&self, workspace_id: &str) -> Result<Option<DateTime<Utc>>> {
        let key = Self::key(workspace_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match parse_ts("activity", &raw) {
            Ok(at) => Ok(Some(at)),
            Err(err) => {
                warn!(workspace_id, %err, "discarding unreadable activity entry");
                Ok(None)
            }
        }
    }

    /// Drop the workspace's entry. Store failures are logged only.
    pub async fn clear(&self, workspace_id: &str) {
        let key = Self::key(workspace_id);
        if let Err(err) = self.store.remove(&key).await {
            warn!(workspace_id, %err, "failed to clear activity");
        }
    }
}
