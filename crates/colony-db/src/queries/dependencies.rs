//! Database query functions for the `task_dependencies` table.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::queries::MAX_BIND_PARAMS;

/// Insert a dependency edge: `task_id` depends on `depends_on_task_id`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent. Returns whether a
/// new edge was created.
pub async fn insert_edge(
    conn: &mut SqliteConnection,
    task_id: &str,
    depends_on_task_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on_task_id, created_at) \
         VALUES (?, ?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on_task_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete a dependency edge. Returns whether an edge existed.
pub async fn delete_edge(
    conn: &mut SqliteConnection,
    task_id: &str,
    depends_on_task_id: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM task_dependencies WHERE task_id = ? AND depends_on_task_id = ?",
    )
    .bind(task_id)
    .bind(depends_on_task_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn dependency_ids(conn: &mut SqliteConnection, task_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT depends_on_task_id FROM task_dependencies \
         WHERE task_id = ? \
         ORDER BY depends_on_task_id",
    )
    .bind(task_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Get all `(task_id, depends_on_task_id)` edges whose task is in `ids`,
/// chunked to stay under the bound-parameter ceiling.
pub async fn edges_for_tasks(
    conn: &mut SqliteConnection,
    ids: &[String],
) -> Result<Vec<(String, String)>> {
    let mut edges = Vec::new();
    for chunk in ids.chunks(MAX_BIND_PARAMS) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT task_id, depends_on_task_id FROM task_dependencies \
             WHERE task_id IN ({placeholders}) \
             ORDER BY task_id, depends_on_task_id",
        );
        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        edges.extend(query.fetch_all(&mut *conn).await?);
    }

    Ok(edges)
}

/// Get the IDs of all tasks that depend on the given task.
pub async fn dependent_ids(conn: &mut SqliteConnection, task_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT task_id FROM task_dependencies \
         WHERE depends_on_task_id = ? \
         ORDER BY task_id",
    )
    .bind(task_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Count dependencies of `task_id` whose target is not yet completed.
pub async fn incomplete_dependency_count(
    conn: &mut SqliteConnection,
    task_id: &str,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_dependencies td \
         JOIN tasks dep ON dep.id = td.depends_on_task_id \
         WHERE td.task_id = ? AND dep.status != 'completed'",
    )
    .bind(task_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.0)
}

/// Unblock every dependent of `completed_task_id` that is blocked exactly
/// for `dependency` and has no other incomplete dependency. A single
/// set-update; each affected row's version is bumped. Returns the
/// newly-unblocked task IDs.
///
/// The completing task's own status change must already be visible on this
/// connection, otherwise it still counts as an incomplete dependency.
pub async fn unblock_dependents(
    conn: &mut SqliteConnection,
    completed_task_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "UPDATE tasks \
         SET status = 'pending', blocked_reason = NULL, version = version + 1, updated_at = ? \
         WHERE id IN (SELECT task_id FROM task_dependencies WHERE depends_on_task_id = ?) \
           AND status = 'blocked' \
           AND blocked_reason = 'dependency' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on_task_id \
               WHERE td.task_id = tasks.id AND dep.status != 'completed' \
           ) \
         RETURNING id",
    )
    .bind(now)
    .bind(completed_task_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Apply the unblock predicate to an explicit candidate set; used after a
/// task deletion has cascaded its edges away. Returns the newly-unblocked
/// task IDs.
pub async fn unblock_among(
    conn: &mut SqliteConnection,
    candidate_ids: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut unblocked = Vec::new();
    // One slot of the parameter budget goes to the timestamp bind.
    for chunk in candidate_ids.chunks(MAX_BIND_PARAMS - 1) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "UPDATE tasks \
             SET status = 'pending', blocked_reason = NULL, version = version + 1, updated_at = ? \
             WHERE id IN ({placeholders}) \
               AND status = 'blocked' \
               AND blocked_reason = 'dependency' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM task_dependencies td \
                   JOIN tasks dep ON dep.id = td.depends_on_task_id \
                   WHERE td.task_id = tasks.id AND dep.status != 'completed' \
               ) \
             RETURNING id",
        );
        let mut query = sqlx::query_as::<_, (String,)>(&sql).bind(now);
        for id in chunk {
            query = query.bind(id);
        }
        unblocked.extend(
            query
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .map(|(id,)| id),
        );
    }

    Ok(unblocked)
}
