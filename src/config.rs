//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keyring service under which control-plane tokens are stored.
pub const KEYRING_SERVICE: &str = "preview-pool";

/// Upper bound for a single health probe.
pub const MAX_HEALTH_TIMEOUT_MS: u64 = 2000;

/// Upper bound for every configured threshold, interval, and timeout.
pub const MAX_DURATION_SECONDS: u64 = 86_400;

/// Pool sizing and eviction thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PoolConfig {
    /// Maximum number of live sessions pool-wide.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Inactivity after which a session is evicted.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_seconds: u64,
    /// Inactivity after which a running session is marked idle.
    #[serde(default = "default_idle_after")]
    pub idle_after_seconds: u64,
    /// Period of the background eviction sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Period of the background orphan reclaim.
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_seconds: u64,
    /// Candidates processed per sweep or reclaim pass.
    #[serde(default = "default_max_candidates")]
    pub max_candidates_per_pass: u32,
    /// Upper bound for bringing a session to `running`.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_seconds: u64,
    /// Upper bound for a single resource stop.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            idle_threshold_seconds: default_idle_threshold(),
            idle_after_seconds: default_idle_after(),
            sweep_interval_seconds: default_sweep_interval(),
            reclaim_interval_seconds: default_reclaim_interval(),
            max_candidates_per_pass: default_max_candidates(),
            start_timeout_seconds: default_start_timeout(),
            stop_timeout_seconds: default_stop_timeout(),
        }
    }
}

impl PoolConfig {
    /// Idle threshold as a `chrono` duration.
    #[must_use]
    pub fn idle_threshold(&self) -> chrono::Duration {
        seconds_delta(self.idle_threshold_seconds)
    }

    /// Idle-marking threshold as a `chrono` duration.
    #[must_use]
    pub fn idle_after(&self) -> chrono::Duration {
        seconds_delta(self.idle_after_seconds)
    }

    /// Start bound.
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }

    /// Stop bound.
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

/// Seconds as a `chrono` duration, saturating at the largest representable span.
#[must_use]
pub fn seconds_delta(seconds: u64) -> chrono::Duration {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

fn default_capacity() -> u32 {
    100
}

fn default_idle_threshold() -> u64 {
    300
}

fn default_idle_after() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_reclaim_interval() -> u64 {
    300
}

fn default_max_candidates() -> u32 {
    50
}

fn default_start_timeout() -> u64 {
    45
}

fn default_stop_timeout() -> u64 {
    10
}

/// Local preview server process settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PreviewConfig {
    /// Executable that serves previews (e.g. `node`).
    pub command: String,
    /// Leading arguments; `--port=` and `--workspace=` are appended per session.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the preview process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Directory holding one subdirectory per workspace.
    pub workspaces_root: PathBuf,
    /// First port of the allocation range (inclusive).
    #[serde(default = "default_port_start")]
    pub port_range_start: u16,
    /// Last port of the allocation range (inclusive).
    #[serde(default = "default_port_end")]
    pub port_range_end: u16,
    /// Path of the health endpoint served by each preview process.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Per-probe timeout in milliseconds.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    /// How long a fresh process may take to answer its health endpoint.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_seconds: u64,
}

impl PreviewConfig {
    /// Health probe bound.
    #[must_use]
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Readiness wait bound.
    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }
}

fn default_port_start() -> u16 {
    3001
}

fn default_port_end() -> u16 {
    8000
}

fn default_health_path() -> String {
    "/health".into()
}

fn default_health_timeout_ms() -> u64 {
    MAX_HEALTH_TIMEOUT_MS
}

fn default_ready_timeout() -> u64 {
    30
}

/// Cloud task-execution control plane.
///
/// The bearer token is loaded at runtime, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CloudConfig {
    /// Base URL of the task API.
    pub endpoint: String,
    /// Cluster the preview tasks run in.
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// Task definition started for each session.
    pub task_definition: String,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Bearer token (populated at runtime).
    #[serde(skip)]
    pub token: Option<String>,
}

/// Cache-purge control plane.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    /// Base URL of the invalidation API.
    pub endpoint: String,
    /// Distribution whose cache is purged.
    pub distribution_id: String,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Bearer token (populated at runtime).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_cluster() -> String {
    "playcanvas-multiplayer".into()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_retention_days() -> u32 {
    30
}

fn default_http_port() -> u16 {
    8790
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the registry database.
    pub data_dir: PathBuf,
    /// Loopback port for the HTTP surface.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Days a stopped session row is kept before it is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Pool sizing and eviction.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Local preview process.
    pub preview: PreviewConfig,
    /// Optional remote task backend.
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
    /// Optional cache-purge backend.
    #[serde(default)]
    pub cache: Option<CacheConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load control-plane tokens from OS keychain with env-var fallback.
    ///
    /// Tries the `preview-pool` keyring service first, then falls back to
    /// `PREVIEW_POOL_CLOUD_TOKEN` / `PREVIEW_POOL_CACHE_TOKEN`. A missing
    /// token is not an error; the backend is then called unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain task cannot be joined.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if let Some(cloud) = self.cloud.as_mut() {
            cloud.token = load_credential("cloud_token", "PREVIEW_POOL_CLOUD_TOKEN").await?;
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.token = load_credential("cache_token", "PREVIEW_POOL_CACHE_TOKEN").await?;
        }
        Ok(())
    }

    /// Path of the `SQLite` registry database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("preview-pool.db")
    }

    fn validate(&mut self) -> Result<()> {
        if self.pool.capacity == 0 {
            return Err(AppError::Config(
                "pool.capacity must be greater than zero".into(),
            ));
        }

        if self.pool.idle_threshold_seconds == 0 {
            return Err(AppError::Config(
                "pool.idle_threshold_seconds must be greater than zero".into(),
            ));
        }

        let bounded = [
            ("pool.idle_threshold_seconds", self.pool.idle_threshold_seconds),
            ("pool.sweep_interval_seconds", self.pool.sweep_interval_seconds),
            ("pool.reclaim_interval_seconds", self.pool.reclaim_interval_seconds),
            ("pool.start_timeout_seconds", self.pool.start_timeout_seconds),
            ("pool.stop_timeout_seconds", self.pool.stop_timeout_seconds),
            ("preview.ready_timeout_seconds", self.preview.ready_timeout_seconds),
        ]
        .into_iter()
        .chain(
            self.cloud
                .as_ref()
                .map(|c| ("cloud.request_timeout_seconds", c.request_timeout_seconds)),
        )
        .chain(
            self.cache
                .as_ref()
                .map(|c| ("cache.request_timeout_seconds", c.request_timeout_seconds)),
        );
        for (name, value) in bounded {
            if value > MAX_DURATION_SECONDS {
                return Err(AppError::Config(format!(
                    "{name} must not exceed {MAX_DURATION_SECONDS}"
                )));
            }
        }

        if self.pool.idle_after_seconds >= self.pool.idle_threshold_seconds {
            return Err(AppError::Config(
                "pool.idle_after_seconds must be less than pool.idle_threshold_seconds".into(),
            ));
        }

        if self.pool.max_candidates_per_pass == 0 {
            return Err(AppError::Config(
                "pool.max_candidates_per_pass must be greater than zero".into(),
            ));
        }

        if self.pool.sweep_interval_seconds == 0 || self.pool.reclaim_interval_seconds == 0 {
            return Err(AppError::Config(
                "pool sweep and reclaim intervals must be greater than zero".into(),
            ));
        }

        if self.preview.command.trim().is_empty() {
            return Err(AppError::Config("preview.command must not be empty".into()));
        }

        if self.preview.port_range_start == 0
            || self.preview.port_range_start > self.preview.port_range_end
        {
            return Err(AppError::Config(format!(
                "preview port range {}-{} is invalid",
                self.preview.port_range_start, self.preview.port_range_end
            )));
        }

        if self.preview.health_timeout_ms == 0
            || self.preview.health_timeout_ms > MAX_HEALTH_TIMEOUT_MS
        {
            return Err(AppError::Config(format!(
                "preview.health_timeout_ms must be between 1 and {MAX_HEALTH_TIMEOUT_MS}"
            )));
        }

        if !self.preview.health_path.starts_with('/') {
            return Err(AppError::Config(
                "preview.health_path must start with '/'".into(),
            ));
        }

        let canonical_data = self
            .data_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("data_dir invalid: {err}")))?;
        self.data_dir = canonical_data;

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(Some(value)),
        _ => {
            warn!(
                key = keyring_key,
                env = env_key,
                "credential not found, control plane will be called unauthenticated"
            );
            Ok(None)
        }
    }
}
