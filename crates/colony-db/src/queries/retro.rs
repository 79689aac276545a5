//! Database query functions for the `retrospective_jobs` work queue.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::models::RetrospectiveJob;

/// Parameters for inserting a new retrospective job.
#[derive(Debug, Clone)]
pub struct NewRetroJob<'a> {
    pub id: &'a str,
    pub agent_name: &'a str,
    pub project_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub since_event_id: i64,
    pub until_event_id: i64,
    pub max_attempts: i64,
    pub created_at: DateTime<Utc>,
}

/// Insert a new job in `queued` state, due immediately.
pub async fn insert_job(
    conn: &mut SqliteConnection,
    new: &NewRetroJob<'_>,
) -> Result<RetrospectiveJob> {
    let job = sqlx::query_as::<_, RetrospectiveJob>(
        "INSERT INTO retrospective_jobs \
             (id, agent_name, project_id, session_id, since_event_id, until_event_id, \
              status, max_attempts, next_run_at, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'queued', ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.agent_name)
    .bind(new.project_id)
    .bind(new.session_id)
    .bind(new.since_event_id)
    .bind(new.until_event_id)
    .bind(new.max_attempts)
    .bind(new.created_at)
    .bind(new.created_at)
    .bind(new.created_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(job)
}

/// Fetch a single job by ID.
pub async fn get_job(conn: &mut SqliteConnection, id: &str) -> Result<Option<RetrospectiveJob>> {
    let job = sqlx::query_as::<_, RetrospectiveJob>("SELECT * FROM retrospective_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(job)
}

/// Find the job recorded for `(agent_name, session_id)`; the pair is
/// unique while the session id is non-empty.
pub async fn find_by_session(
    conn: &mut SqliteConnection,
    agent_name: &str,
    session_id: &str,
) -> Result<Option<RetrospectiveJob>> {
    let job = sqlx::query_as::<_, RetrospectiveJob>(
        "SELECT * FROM retrospective_jobs WHERE agent_name = ? AND session_id = ?",
    )
    .bind(agent_name)
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}

/// Select the oldest due job: queued or retry, past its `next_run_at`,
/// and not held by a live lease.
pub async fn select_due(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<Option<RetrospectiveJob>> {
    let job = sqlx::query_as::<_, RetrospectiveJob>(
        "SELECT * FROM retrospective_jobs \
         WHERE status IN ('queued', 'retry') \
           AND next_run_at <= ? \
           AND (claimed_by IS NULL OR claim_expires_at < ?) \
         ORDER BY next_run_at ASC, created_at ASC \
         LIMIT 1",
    )
    .bind(now)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}

/// CAS a due job into `running` under a worker lease, incrementing its
/// attempt counter. Returns the updated row, or `None` when another worker
/// won the race.
pub async fn cas_claim(
    conn: &mut SqliteConnection,
    id: &str,
    worker: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<RetrospectiveJob>> {
    let job = sqlx::query_as::<_, RetrospectiveJob>(
        "UPDATE retrospective_jobs \
         SET status = 'running', claimed_by = ?, claim_expires_at = ?, \
             attempt = attempt + 1, updated_at = ? \
         WHERE id = ? \
           AND status IN ('queued', 'retry') \
           AND (claimed_by IS NULL OR claim_expires_at < ?) \
         RETURNING *",
    )
    .bind(worker)
    .bind(expires_at)
    .bind(now)
    .bind(id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}

/// Terminal success: release the claim, stamp `completed_at`, clear any
/// stored error.
pub async fn mark_succeeded(
    conn: &mut SqliteConnection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<Option<RetrospectiveJob>> {
    let job = sqlx::query_as::<_, RetrospectiveJob>(
        "UPDATE retrospective_jobs \
         SET status = 'succeeded', claimed_by = NULL, claim_expires_at = NULL, \
             completed_at = ?, last_error = NULL, updated_at = ? \
         WHERE id = ? \
         RETURNING *",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}

/// Release the claim and park the job for a later attempt.
pub async fn mark_retry(
    conn: &mut SqliteConnection,
    id: &str,
    error: &str,
    next_run_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<RetrospectiveJob>> {
    let job = sqlx::query_as::<_, RetrospectiveJob>(
        "UPDATE retrospective_jobs \
         SET status = 'retry', claimed_by = NULL, claim_expires_at = NULL, \
             next_run_at = ?, last_error = ?, updated_at = ? \
         WHERE id = ? \
         RETURNING *",
    )
    .bind(next_run_at)
    .bind(error)
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}

/// Terminal failure: release the claim and keep the final error.
pub async fn mark_dead(
    conn: &mut SqliteConnection,
    id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<Option<RetrospectiveJob>> {
    let job = sqlx::query_as::<_, RetrospectiveJob>(
        "UPDATE retrospective_jobs \
         SET status = 'dead', claimed_by = NULL, claim_expires_at = NULL, \
             completed_at = ?, last_error = ?, updated_at = ? \
         WHERE id = ? \
         RETURNING *",
    )
    .bind(now)
    .bind(error)
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}
