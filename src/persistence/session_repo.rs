//! Session registry repository for `SQLite` persistence.
//!
//! The registry is the single source of truth for session status. Every
//! status change is a compare-and-set on `(workspace_id, session_id, status)`
//! so a stale writer cannot overwrite a newer incarnation.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::session::{Session, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{fmt_ts, parse_ts};

/// Result of an atomic admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A fresh incarnation was recorded in `starting` status.
    Admitted(Session),
    /// The pool already holds `capacity` live sessions.
    AtCapacity,
    /// The workspace already has a non-stopped session.
    Occupied(Session),
}

/// Repository wrapper around `SQLite` for preview session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    workspace_id: String,
    session_id: String,
    status: String,
    endpoint_port: Option<i64>,
    process_handle: Option<i64>,
    cloud_task_ref: Option<String>,
    started_at: String,
    last_activity_at: Option<String>,
    updated_at: String,
    stopped_at: Option<String>,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_session(self) -> Result<Session> {
        let status = SessionStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("invalid session status: {}", self.status)))?;
        let endpoint_port = self
            .endpoint_port
            .map(|p| {
                u16::try_from(p).map_err(|_| AppError::Db(format!("invalid endpoint_port: {p}")))
            })
            .transpose()?;
        let process_handle = self
            .process_handle
            .map(|p| {
                u32::try_from(p).map_err(|_| AppError::Db(format!("invalid process_handle: {p}")))
            })
            .transpose()?;

        Ok(Session {
            workspace_id: self.workspace_id,
            session_id: self.session_id,
            status,
            endpoint_port,
            process_handle,
            cloud_task_ref: self.cloud_task_ref,
            started_at: parse_ts("started_at", &self.started_at)?,
            last_activity_at: self
                .last_activity_at
                .as_deref()
                .map(|s| parse_ts("last_activity_at", s))
                .transpose()?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            stopped_at: self
                .stopped_at
                .as_deref()
                .map(|s| parse_ts("stopped_at", s))
                .transpose()?,
        })
    }
}

/// Render statuses as a SQL `IN` list.
///
/// Values come from [`SessionStatus::as_str`], never from callers.
fn status_list(statuses: &[SessionStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Atomically admit a new incarnation for `workspace_id`.
    ///
    /// A single statement checks the live count against `capacity` and
    /// upserts the row, overwriting it only when the previous incarnation is
    /// `stopped`. Concurrent admissions for different workspaces therefore
    /// cannot exceed `capacity`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the statement fails.
    pub async fn admit(&self, workspace_id: &str, capacity: u32) -> Result<Admission> {
        let candidate = Session::new(workspace_id.to_owned());
        let now = fmt_ts(candidate.started_at);

        let query = format!(
            "INSERT INTO preview_session (workspace_id, session_id, status, endpoint_port,
                 process_handle, cloud_task_ref, started_at, last_activity_at, updated_at,
                 stopped_at)
             SELECT ?1, ?2, 'starting', NULL, NULL, NULL, ?3, NULL, ?3, NULL
             WHERE (SELECT COUNT(*) FROM preview_session WHERE status IN ({live})) < ?4
             ON CONFLICT(workspace_id) DO UPDATE SET
                 session_id = excluded.session_id,
                 status = 'starting',
                 endpoint_port = NULL,
                 process_handle = NULL,
                 cloud_task_ref = NULL,
                 started_at = excluded.started_at,
                 updated_at = excluded.updated_at,
                 stopped_at = NULL
             WHERE preview_session.status = 'stopped'",
            live = status_list(&SessionStatus::LIVE),
        );

        let result = sqlx::query(&query)
            .bind(workspace_id)
            .bind(&candidate.session_id)
            .bind(&now)
            .bind(i64::from(capacity))
            .execute(self.db.as_ref())
            .await?;

        if result.rows_affected() == 1 {
            let admitted = self
                .get(workspace_id)
                .await?
                .ok_or_else(|| AppError::Db("admitted session vanished".into()))?;
            return Ok(Admission::Admitted(admitted));
        }

        match self.get(workspace_id).await? {
            Some(existing) if existing.status.is_non_stopped() => Ok(Admission::Occupied(existing)),
            _ => Ok(Admission::AtCapacity),
        }
    }

    /// Insert a session row verbatim.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails (including a duplicate workspace).
    pub async fn insert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO preview_session (workspace_id, session_id, status, endpoint_port,
             process_handle, cloud_task_ref, started_at, last_activity_at, updated_at, stopped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&session.workspace_id)
        .bind(&session.session_id)
        .bind(session.status.as_str())
        .bind(session.endpoint_port.map(i64::from))
        .bind(session.process_handle.map(i64::from))
        .bind(&session.cloud_task_ref)
        .bind(fmt_ts(session.started_at))
        .bind(session.last_activity_at.map(fmt_ts))
        .bind(fmt_ts(session.updated_at))
        .bind(session.stopped_at.map(fmt_ts))
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Retrieve the registry row for a workspace, whatever its status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, workspace_id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM preview_session WHERE workspace_id = ?1")
                .bind(workspace_id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Retrieve the workspace's session only if it is `starting`, `running` or `idle`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_live(&self, workspace_id: &str) -> Result<Option<Session>> {
        Ok(self
            .get(workspace_id)
            .await?
            .filter(|s| s.status.is_live()))
    }

    /// Whether the workspace has a session in any status other than `stopped`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn has_non_stopped_session(&self, workspace_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM preview_session WHERE workspace_id = ?1 AND status != 'stopped'",
        )
        .bind(workspace_id)
        .fetch_one(self.db.as_ref())
        .await?;

        Ok(count > 0)
    }

    /// Count sessions occupying a pool slot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_live(&self) -> Result<u64> {
        let query = format!(
            "SELECT COUNT(*) FROM preview_session WHERE status IN ({})",
            status_list(&SessionStatus::LIVE)
        );
        let count: i64 = sqlx::query_scalar(&query)
            .fetch_one(self.db.as_ref())
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// List `running`/`idle` sessions, least recently active first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_sweep_candidates(&self, limit: u32) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM preview_session WHERE status IN ('running','idle')
             ORDER BY COALESCE(last_activity_at, started_at) ASC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// List sessions in any of the given statuses.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_with_status(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT * FROM preview_session WHERE status IN ({}) ORDER BY workspace_id",
            status_list(statuses)
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// List every registry row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM preview_session ORDER BY workspace_id")
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Compare-and-set the status of one incarnation.
    ///
    /// Returns `false` when the row no longer matches `session_id` or is not
    /// in one of `from`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if any `from -> to` pair is not a
    /// permitted lifecycle transition, or `AppError::Db` if the update fails.
    pub async fn transition(
        &self,
        workspace_id: &str,
        session_id: &str,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<bool> {
        ensure_transitions(from, to)?;
        let query = format!(
            "UPDATE preview_session SET status = ?1, updated_at = ?2
             WHERE workspace_id = ?3 AND session_id = ?4 AND status IN ({})",
            status_list(from)
        );
        let result = sqlx::query(&query)
            .bind(to.as_str())
            .bind(fmt_ts(Utc::now()))
            .bind(workspace_id)
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record started resources and move `starting -> running`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_running(
        &self,
        workspace_id: &str,
        session_id: &str,
        port: u16,
        process_handle: Option<u32>,
        cloud_task_ref: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let ts = fmt_ts(at);
        let result = sqlx::query(
            "UPDATE preview_session SET status = 'running', endpoint_port = ?1,
                 process_handle = ?2, cloud_task_ref = ?3, last_activity_at = ?4, updated_at = ?4
             WHERE workspace_id = ?5 AND session_id = ?6 AND status = 'starting'",
        )
        .bind(i64::from(port))
        .bind(process_handle.map(i64::from))
        .bind(cloud_task_ref)
        .bind(&ts)
        .bind(workspace_id)
        .bind(session_id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mirror a use of a live incarnation into `last_activity_at`.
    ///
    /// Keeps sweep candidate order close to real usage; the activity
    /// tracker stays authoritative for eviction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn record_activity(
        &self,
        workspace_id: &str,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE preview_session SET last_activity_at = ?1
             WHERE workspace_id = ?2 AND session_id = ?3 AND status IN ('running','idle')",
        )
        .bind(fmt_ts(at))
        .bind(workspace_id)
        .bind(session_id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Move one incarnation to `stopped`, mirroring its last activity.
    ///
    /// Resource columns are kept so late orphan checks can still find the
    /// cloud task reference.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` for a non-permitted source
    /// status, or `AppError::Db` if the update fails.
    pub async fn mark_stopped(
        &self,
        workspace_id: &str,
        session_id: &str,
        from: &[SessionStatus],
        last_activity: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        ensure_transitions(from, SessionStatus::Stopped)?;
        let now = fmt_ts(Utc::now());
        let query = format!(
            "UPDATE preview_session SET status = 'stopped', stopped_at = ?1, updated_at = ?1,
                 last_activity_at = COALESCE(?2, last_activity_at)
             WHERE workspace_id = ?3 AND session_id = ?4 AND status IN ({})",
            status_list(from)
        );
        let result = sqlx::query(&query)
            .bind(&now)
            .bind(last_activity.map(fmt_ts))
            .bind(workspace_id)
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete `stopped` rows whose `stopped_at` is older than `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_stopped_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM preview_session WHERE status = 'stopped' AND stopped_at < ?1",
        )
        .bind(fmt_ts(cutoff))
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }
}

fn ensure_transitions(from: &[SessionStatus], to: SessionStatus) -> Result<()> {
    if from.is_empty() {
        return Err(AppError::InvalidTransition(format!(
            "no source status given for -> {to}"
        )));
    }
    if let Some(bad) = from.iter().find(|f| !f.can_transition_to(to)) {
        return Err(AppError::InvalidTransition(format!("{bad} -> {to}")));
    }
    Ok(())
}
