//! Database query functions for the `tasks` table.
//!
//! Mutations are compare-and-swap on `version`: the UPDATE's WHERE clause
//! pins the version read by the caller, and zero affected rows means the
//! row changed underneath it.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::models::{Task, TaskStatus};

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub project_id: Option<&'a str>,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

/// Filters for listing tasks; `None` fields match everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter<'a> {
    pub status: Option<TaskStatus>,
    pub project_id: Option<&'a str>,
    pub priority: Option<i64>,
}

/// Insert a new task row. The row starts `pending`, version 1, unleased.
pub async fn insert_task(conn: &mut SqliteConnection, new: &NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, title, description, status, priority, project_id, created_at, updated_at) \
         VALUES (?, ?, ?, 'pending', ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.title)
    .bind(new.description)
    .bind(new.priority)
    .bind(new.project_id)
    .bind(new.created_at)
    .bind(new.created_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(conn: &mut SqliteConnection, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(task)
}

/// List tasks matching the filter, highest priority first, newest first
/// within a priority.
pub async fn list_tasks(conn: &mut SqliteConnection, filter: &TaskFilter<'_>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE (? IS NULL OR status = ?) \
           AND (? IS NULL OR project_id = ?) \
           AND (? IS NULL OR priority = ?) \
         ORDER BY priority DESC, created_at DESC",
    )
    .bind(filter.status)
    .bind(filter.status)
    .bind(filter.project_id)
    .bind(filter.project_id)
    .bind(filter.priority)
    .bind(filter.priority)
    .fetch_all(&mut *conn)
    .await?;

    Ok(tasks)
}

/// CAS-update status and blocked_reason. Returns affected rows (0 means
/// the version did not match or the task is gone).
pub async fn cas_set_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: TaskStatus,
    blocked_reason: Option<&str>,
    expected_version: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, blocked_reason = ?, version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ?",
    )
    .bind(status)
    .bind(blocked_reason)
    .bind(now)
    .bind(id)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// CAS-update priority. Returns affected rows.
pub async fn cas_set_priority(
    conn: &mut SqliteConnection,
    id: &str,
    priority: i64,
    expected_version: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET priority = ?, version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ?",
    )
    .bind(priority)
    .bind(now)
    .bind(id)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Select the next task eligible for claiming by `agent`: pending, not
/// held by a live foreign lease, in the requested project (when given),
/// and with zero unresolved dependencies. Highest priority wins; ties go
/// to the oldest task.
pub async fn select_next_pending(
    conn: &mut SqliteConnection,
    agent: &str,
    project_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         WHERE t.status = 'pending' \
           AND (t.claimed_by IS NULL OR t.claimed_by = ? OR t.claim_expires_at < ?) \
           AND (? IS NULL OR t.project_id = ?) \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on_task_id \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           ) \
         ORDER BY t.priority DESC, t.created_at ASC \
         LIMIT 1",
    )
    .bind(agent)
    .bind(now)
    .bind(project_id)
    .bind(project_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(task)
}

/// Delete a task row. Dependency edges referencing it are removed by the
/// schema's ON DELETE CASCADE. Returns affected rows.
pub async fn delete_task(conn: &mut SqliteConnection, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

/// Null out `project_id` on all tasks referencing the given project,
/// bumping each row's version. Returns affected rows.
pub async fn clear_project_refs(
    conn: &mut SqliteConnection,
    project_id: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET project_id = NULL, version = version + 1, updated_at = ? \
         WHERE project_id = ?",
    )
    .bind(now)
    .bind(project_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}
