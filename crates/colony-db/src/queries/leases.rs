//! Lease-field updates on the `tasks` table.
//!
//! The lease triple (`claimed_by`, `claimed_at`, `claim_expires_at`) and
//! `last_heartbeat_at` always move together; no partial lease state is
//! observable outside a transaction.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::models::Task;

/// CAS-acquire or refresh a lease. `increment_attempt` is set when the
/// caller is acquiring a new lease rather than refreshing its own.
/// Returns the updated row, or `None` when the version did not match.
pub async fn cas_claim(
    conn: &mut SqliteConnection,
    task_id: &str,
    agent: &str,
    expires_at: DateTime<Utc>,
    increment_attempt: bool,
    expected_version: i64,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET claimed_by = ?, claimed_at = ?, claim_expires_at = ?, last_heartbeat_at = ?, \
             attempt = attempt + ?, version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ? \
         RETURNING *",
    )
    .bind(agent)
    .bind(now)
    .bind(expires_at)
    .bind(now)
    .bind(i64::from(increment_attempt))
    .bind(now)
    .bind(task_id)
    .bind(expected_version)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(task)
}

/// Extend a live, self-owned lease. The WHERE clause gates on ownership
/// and expiry, so zero rows means the caller lost the lease.
pub async fn extend_claim(
    conn: &mut SqliteConnection,
    task_id: &str,
    agent: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET claim_expires_at = ?, last_heartbeat_at = ?, version = version + 1, updated_at = ? \
         WHERE id = ? AND claimed_by = ? AND claim_expires_at > ? \
         RETURNING *",
    )
    .bind(expires_at)
    .bind(now)
    .bind(now)
    .bind(task_id)
    .bind(agent)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(task)
}

/// Clear the lease iff held by `agent`. Returns affected rows; zero is a
/// no-op, not an error, which keeps release idempotent.
pub async fn release_claim(
    conn: &mut SqliteConnection,
    task_id: &str,
    agent: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET claimed_by = NULL, claimed_at = NULL, claim_expires_at = NULL, \
             last_heartbeat_at = NULL, version = version + 1, updated_at = ? \
         WHERE id = ? AND claimed_by = ?",
    )
    .bind(now)
    .bind(task_id)
    .bind(agent)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Clear the lease on every task whose claim has expired. Task status is
/// left untouched. Returns the number of leases released.
pub async fn release_expired_claims(conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET claimed_by = NULL, claimed_at = NULL, claim_expires_at = NULL, \
             last_heartbeat_at = NULL, version = version + 1, updated_at = ? \
         WHERE claim_expires_at IS NOT NULL AND claim_expires_at < ?",
    )
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}
