//! `SQLite` schema bootstrap logic.
//!
//! All statements use `IF NOT EXISTS` and are re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the registry and activity tables.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS preview_session (
    workspace_id      TEXT PRIMARY KEY NOT NULL,
    session_id        TEXT NOT NULL,
    status            TEXT NOT NULL
                      CHECK(status IN ('starting','running','idle','stopping','stopped')),
    endpoint_port     INTEGER,
    process_handle    INTEGER,
    cloud_task_ref    TEXT,
    started_at        TEXT NOT NULL,
    last_activity_at  TEXT,
    updated_at        TEXT NOT NULL,
    stopped_at        TEXT
);

CREATE TABLE IF NOT EXISTS activity (
    key         TEXT PRIMARY KEY NOT NULL,
    value       TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_preview_session_status ON preview_session(status);
CREATE INDEX IF NOT EXISTS idx_preview_session_task ON preview_session(cloud_task_ref);
CREATE INDEX IF NOT EXISTS idx_activity_expires ON activity(expires_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
