//! Exclusive working leases on tasks.
//!
//! A lease is orthogonal to task status: it can exist on `pending` or
//! `in_progress` tasks, and expiry GC never changes status. The lease
//! triple plus `last_heartbeat_at` always move together.

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use colony_db::error::{Result, StoreError};
use colony_db::models::Task;
use colony_db::queries::leases;
use colony_db::queries::tasks;
use colony_db::txn;

/// TTL applied when the caller passes a non-positive value.
pub const DEFAULT_CLAIM_TTL_MINUTES: i64 = 5;

/// Upper bound on a claim TTL (one day).
pub const MAX_CLAIM_TTL_MINUTES: i64 = 1440;

/// Clamp a requested TTL into `(0, 1440]` minutes, defaulting to 5.
pub(crate) fn clamp_ttl_minutes(ttl_minutes: i64) -> i64 {
    if ttl_minutes <= 0 {
        DEFAULT_CLAIM_TTL_MINUTES
    } else {
        ttl_minutes.min(MAX_CLAIM_TTL_MINUTES)
    }
}

/// Whether `agent` currently holds an unexpired lease on the task.
pub(crate) fn holds_live_claim(task: &Task, agent: &str, now: DateTime<Utc>) -> bool {
    task.claimed_by.as_deref() == Some(agent)
        && task.claim_expires_at.is_some_and(|expires| expires > now)
}

/// Claim a task for exclusive work.
///
/// Succeeds when the task is unclaimed, already self-claimed, or the
/// previous lease has expired; otherwise fails with `ClaimContention`.
/// `attempt` increments only when a new lease is acquired -- a refresh by
/// the current owner leaves it unchanged.
pub async fn claim_task(
    pool: &SqlitePool,
    agent: &str,
    task_id: &str,
    ttl_minutes: i64,
) -> Result<Task> {
    if agent.is_empty() {
        return Err(StoreError::invalid("agent must not be empty"));
    }
    if task_id.is_empty() {
        return Err(StoreError::invalid("task_id must not be empty"));
    }
    let ttl = clamp_ttl_minutes(ttl_minutes);

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let task = tasks::get_task(&mut tx, task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        if task.has_live_foreign_claim(agent, now) {
            return Err(StoreError::ClaimContention {
                task_id: task_id.to_owned(),
                owner: task.claimed_by.clone().unwrap_or_default(),
                expires_at: task.claim_expires_at.unwrap_or(now),
            });
        }

        let refresh = holds_live_claim(&task, agent, now);
        let expires_at = now + TimeDelta::minutes(ttl);
        let updated = leases::cas_claim(
            &mut tx,
            task_id,
            agent,
            expires_at,
            !refresh,
            task.version,
            now,
        )
        .await?
        .ok_or_else(|| StoreError::VersionConflict {
            task_id: task_id.to_owned(),
            expected: task.version,
        })?;

        tx.commit().await?;
        debug!(task_id = %task_id, agent = %agent, refresh, ttl_minutes = ttl, "claimed task");
        Ok(updated)
    })
    .await
}

/// Extend a held lease and record the heartbeat.
///
/// Only the current owner of an unexpired lease may heartbeat; anything
/// else fails with `ClaimNotOwned`.
pub async fn heartbeat_task(
    pool: &SqlitePool,
    agent: &str,
    task_id: &str,
    ttl_minutes: i64,
) -> Result<Task> {
    if agent.is_empty() {
        return Err(StoreError::invalid("agent must not be empty"));
    }
    let ttl = clamp_ttl_minutes(ttl_minutes);

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let task = tasks::get_task(&mut tx, task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        if !holds_live_claim(&task, agent, now) {
            return Err(StoreError::ClaimNotOwned {
                task_id: task_id.to_owned(),
                agent: agent.to_owned(),
            });
        }

        let expires_at = now + TimeDelta::minutes(ttl);
        let updated = leases::extend_claim(&mut tx, task_id, agent, expires_at, now)
            .await?
            .ok_or_else(|| StoreError::ClaimNotOwned {
                task_id: task_id.to_owned(),
                agent: agent.to_owned(),
            })?;

        tx.commit().await?;
        Ok(updated)
    })
    .await
}

/// Release a self-held lease.
///
/// Returns whether a lease was actually cleared; releasing a lease that
/// is absent or held by someone else is a silent no-op so that release
/// stays idempotent (GC may have already reclaimed it).
pub async fn release_task_claim(pool: &SqlitePool, agent: &str, task_id: &str) -> Result<bool> {
    if agent.is_empty() {
        return Err(StoreError::invalid("agent must not be empty"));
    }

    txn::with_retry(|| async move {
        let mut conn = pool.acquire().await?;
        let rows = leases::release_claim(&mut conn, task_id, agent, Utc::now()).await?;
        if rows > 0 {
            debug!(task_id = %task_id, agent = %agent, "released claim");
        }
        Ok(rows > 0)
    })
    .await
}

/// Garbage-collect expired leases across all tasks. Task status is left
/// untouched. Returns the number of leases released.
pub async fn release_expired_claims(pool: &SqlitePool) -> Result<u64> {
    txn::with_retry(|| async move {
        let mut conn = pool.acquire().await?;
        let released = leases::release_expired_claims(&mut conn, Utc::now()).await?;
        if released > 0 {
            info!(released, "released expired claims");
        }
        Ok(released)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_clamps_into_range() {
        assert_eq!(clamp_ttl_minutes(0), 5);
        assert_eq!(clamp_ttl_minutes(-10), 5);
        assert_eq!(clamp_ttl_minutes(1), 1);
        assert_eq!(clamp_ttl_minutes(1440), 1440);
        assert_eq!(clamp_ttl_minutes(10_000), 1440);
    }
}
