//! Persistence layer modules.

pub mod activity_repo;
pub mod db;
pub mod retention;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

/// Render a timestamp in the fixed-width form stored in every table.
///
/// Fixed width keeps lexical order equal to chronological order, which the
/// range queries rely on.
#[must_use]
pub fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp column.
pub(crate) fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}
