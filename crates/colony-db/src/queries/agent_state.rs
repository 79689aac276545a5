//! Database query functions for the per-agent `agent_state` singleton.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::models::AgentState;

/// Fetch an agent's state row, if one exists.
pub async fn get_agent_state(
    conn: &mut SqliteConnection,
    agent_name: &str,
) -> Result<Option<AgentState>> {
    let state = sqlx::query_as::<_, AgentState>("SELECT * FROM agent_state WHERE agent_name = ?")
        .bind(agent_name)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(state)
}

/// Upsert an agent's focus, overwriting both focus fields.
pub async fn upsert_focus(
    conn: &mut SqliteConnection,
    agent_name: &str,
    focus_task_id: Option<&str>,
    focus_project_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<AgentState> {
    let state = sqlx::query_as::<_, AgentState>(
        "INSERT INTO agent_state (agent_name, focus_task_id, focus_project_id, updated_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT (agent_name) DO UPDATE SET \
             focus_task_id = excluded.focus_task_id, \
             focus_project_id = excluded.focus_project_id, \
             updated_at = excluded.updated_at \
         RETURNING *",
    )
    .bind(agent_name)
    .bind(focus_task_id)
    .bind(focus_project_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(state)
}

/// Advance an agent's journal cursor to `position` if it is ahead of the
/// stored one; the cursor never moves backwards.
pub async fn advance_cursor(
    conn: &mut SqliteConnection,
    agent_name: &str,
    position: i64,
    now: DateTime<Utc>,
) -> Result<AgentState> {
    let state = sqlx::query_as::<_, AgentState>(
        "INSERT INTO agent_state (agent_name, cursor_position, updated_at) \
         VALUES (?, ?, ?) \
         ON CONFLICT (agent_name) DO UPDATE SET \
             cursor_position = MAX(cursor_position, excluded.cursor_position), \
             updated_at = excluded.updated_at \
         RETURNING *",
    )
    .bind(agent_name)
    .bind(position.max(0))
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(state)
}

/// Null out `focus_project_id` on all agents focused on the given project.
pub async fn clear_project_refs(
    conn: &mut SqliteConnection,
    project_id: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_state SET focus_project_id = NULL, updated_at = ? \
         WHERE focus_project_id = ?",
    )
    .bind(now)
    .bind(project_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}
