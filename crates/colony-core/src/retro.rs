//! The durable retrospective-job queue.
//!
//! Jobs cover an event id range for post-session analysis and move through
//! `queued <-> running -> {succeeded | retry | dead}`. Claims carry a
//! worker lease so a crashed worker's job becomes claimable again once the
//! lease expires.

use chrono::{TimeDelta, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use colony_db::error::{Result, StoreError};
use colony_db::ids;
use colony_db::models::RetrospectiveJob;
use colony_db::queries::retro::{self, NewRetroJob};
use colony_db::txn;

/// Attempt budget applied when the caller passes a non-positive value.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// Lease applied when the caller passes a non-positive value.
const DEFAULT_LEASE_SECONDS: i64 = 60;

/// Upper bound on a worker lease (one hour).
const MAX_LEASE_SECONDS: i64 = 3600;

/// Backoff applied when the caller passes a non-positive value.
const DEFAULT_BACKOFF_SECONDS: i64 = 30;

/// Upper bound on a retry backoff (one day).
const MAX_BACKOFF_SECONDS: i64 = 86_400;

/// Stored errors are truncated to this many bytes.
const MAX_ERROR_BYTES: usize = 2048;

/// Internal select+claim retries before reporting an empty queue.
const CLAIM_ATTEMPTS: u32 = 5;

/// Parameters for enqueueing a retrospective job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest<'a> {
    pub agent_name: &'a str,
    pub project_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub since_event_id: i64,
    pub until_event_id: i64,
    pub max_attempts: i64,
}

fn clamp_lease_seconds(lease_seconds: i64) -> i64 {
    if lease_seconds <= 0 {
        DEFAULT_LEASE_SECONDS
    } else {
        lease_seconds.min(MAX_LEASE_SECONDS)
    }
}

fn clamp_backoff_seconds(backoff_seconds: i64) -> i64 {
    if backoff_seconds <= 0 {
        DEFAULT_BACKOFF_SECONDS
    } else {
        backoff_seconds.min(MAX_BACKOFF_SECONDS)
    }
}

/// Truncate an error string to the persistence bound, respecting char
/// boundaries.
fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_BYTES {
        return error;
    }
    let mut end = MAX_ERROR_BYTES;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

/// Enqueue a retrospective job over `[since_event_id, until_event_id]`.
///
/// Negative range bounds clamp to 0 and an inverted range is raised to
/// `until = since`. When a job for `(agent_name, session_id)` already
/// exists (non-empty session), the existing job is returned unchanged.
pub async fn enqueue(pool: &SqlitePool, req: &EnqueueRequest<'_>) -> Result<RetrospectiveJob> {
    if req.agent_name.is_empty() {
        return Err(StoreError::invalid("agent_name must not be empty"));
    }

    let since = req.since_event_id.max(0);
    let until = req.until_event_id.max(since);
    let max_attempts = if req.max_attempts <= 0 {
        DEFAULT_MAX_ATTEMPTS
    } else {
        req.max_attempts
    };
    let session_id = req.session_id.filter(|s| !s.is_empty());
    let id = ids::new_id(ids::RETRO_PREFIX);
    let id = id.as_str();

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let new = NewRetroJob {
            id,
            agent_name: req.agent_name,
            project_id: req.project_id,
            session_id,
            since_event_id: since,
            until_event_id: until,
            max_attempts,
            created_at: now,
        };
        match retro::insert_job(&mut tx, &new).await {
            Ok(job) => {
                tx.commit().await?;
                debug!(job_id = %job.id, agent = %job.agent_name, "enqueued retrospective job");
                Ok(job)
            }
            Err(err) if err.is_unique_violation() => {
                // Another enqueue for this session got there first; hand
                // back its job.
                let Some(session) = session_id else {
                    return Err(err);
                };
                let existing = retro::find_by_session(&mut tx, req.agent_name, session)
                    .await?
                    .ok_or(err)?;
                Ok(existing)
            }
            Err(err) => Err(err),
        }
    })
    .await
}

/// Fetch a job by ID.
pub async fn get_job(pool: &SqlitePool, job_id: &str) -> Result<RetrospectiveJob> {
    let mut conn = pool.acquire().await?;
    retro::get_job(&mut conn, job_id)
        .await?
        .ok_or_else(|| StoreError::not_found("retrospective job", job_id))
}

/// Claim the oldest due job for `worker` under a lease, or `None` when
/// nothing is due.
///
/// Due means queued or retry, past `next_run_at`, and not held by a live
/// lease. The claim CAS is retried a few times internally before the
/// round reports an empty queue.
pub async fn claim_next_job(
    pool: &SqlitePool,
    worker: &str,
    lease_seconds: i64,
) -> Result<Option<RetrospectiveJob>> {
    if worker.is_empty() {
        return Err(StoreError::invalid("worker must not be empty"));
    }
    let lease = clamp_lease_seconds(lease_seconds);

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        for _ in 0..CLAIM_ATTEMPTS {
            let Some(due) = retro::select_due(&mut tx, now).await? else {
                return Ok(None);
            };
            let expires_at = now + TimeDelta::seconds(lease);
            if let Some(job) = retro::cas_claim(&mut tx, &due.id, worker, expires_at, now).await? {
                tx.commit().await?;
                debug!(job_id = %job.id, worker = %worker, attempt = job.attempt, "claimed retrospective job");
                return Ok(Some(job));
            }
        }

        Ok(None)
    })
    .await
}

/// Terminal success: clears the claim and any stored error, stamps
/// `completed_at`.
pub async fn mark_succeeded(pool: &SqlitePool, job_id: &str) -> Result<RetrospectiveJob> {
    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let job = retro::mark_succeeded(&mut tx, job_id, Utc::now())
            .await?
            .ok_or_else(|| StoreError::not_found("retrospective job", job_id))?;
        tx.commit().await?;
        Ok(job)
    })
    .await
}

/// Release the claim and park the job for another attempt after
/// `backoff_seconds`.
///
/// When the job has already burned through its attempt budget the retry
/// escalates to `dead` instead.
pub async fn mark_retry(
    pool: &SqlitePool,
    job_id: &str,
    error: &str,
    backoff_seconds: i64,
) -> Result<RetrospectiveJob> {
    let backoff = clamp_backoff_seconds(backoff_seconds);

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let job = retro::get_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| StoreError::not_found("retrospective job", job_id))?;
        let error = truncate_error(error);

        let updated = if job.attempt >= job.max_attempts {
            warn!(job_id = %job_id, attempt = job.attempt, "retrospective job exhausted its attempts, marking dead");
            retro::mark_dead(&mut tx, job_id, error, now).await?
        } else {
            let next_run_at = now + TimeDelta::seconds(backoff);
            retro::mark_retry(&mut tx, job_id, error, next_run_at, now).await?
        }
        .ok_or_else(|| StoreError::not_found("retrospective job", job_id))?;

        tx.commit().await?;
        Ok(updated)
    })
    .await
}

/// Terminal failure: releases the claim and keeps the final error.
pub async fn mark_dead(pool: &SqlitePool, job_id: &str, error: &str) -> Result<RetrospectiveJob> {
    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let job = retro::mark_dead(&mut tx, job_id, truncate_error(error), Utc::now())
            .await?
            .ok_or_else(|| StoreError::not_found("retrospective job", job_id))?;
        tx.commit().await?;
        Ok(job)
    })
    .await
}
