//! Agent focus and checkpointing.
//!
//! Each agent has a singleton state row holding its current focus and the
//! journal cursor (the highest event id it has observed). Checkpoints are
//! journal events that advance the cursor atomically.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

use colony_db::error::{Result, StoreError};
use colony_db::models::{AgentState, EventKind};
use colony_db::queries::events::NewEvent;
use colony_db::queries::{agent_state, events};
use colony_db::txn;

/// Parameters for recording a checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointRequest<'a> {
    pub agent_name: &'a str,
    /// When set, replays of the same checkpoint are deduplicated.
    pub request_id: Option<&'a str>,
    pub message: &'a str,
    pub metadata: Option<Value>,
}

/// Result of recording (or replaying) a checkpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CheckpointResult {
    pub event_id: i64,
    pub cursor_position: i64,
}

/// Fetch an agent's state row, if it exists yet.
pub async fn get_agent_state(pool: &SqlitePool, agent_name: &str) -> Result<Option<AgentState>> {
    let mut conn = pool.acquire().await?;
    agent_state::get_agent_state(&mut conn, agent_name).await
}

/// Set an agent's focus, overwriting both focus fields, and append an
/// `agent_focus` event. Returns the event id.
pub async fn set_agent_focus(
    pool: &SqlitePool,
    agent_name: &str,
    task_id: Option<&str>,
    project_id: Option<&str>,
) -> Result<i64> {
    if agent_name.is_empty() {
        return Err(StoreError::invalid("agent_name must not be empty"));
    }

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        agent_state::upsert_focus(&mut tx, agent_name, task_id, project_id, now).await?;

        let message = match (task_id, project_id) {
            (Some(task), _) => format!("agent {agent_name} focused on task {task}"),
            (None, Some(project)) => format!("agent {agent_name} focused on project {project}"),
            (None, None) => format!("agent {agent_name} cleared focus"),
        };
        let event = events::insert_event(
            &mut tx,
            &NewEvent {
                kind: EventKind::AgentFocus,
                task_id,
                project_id,
                metadata: Some(serde_json::json!({
                    "task_id": task_id,
                    "project_id": project_id,
                })),
                ..NewEvent::new(EventKind::AgentFocus, agent_name, &message, now)
            },
        )
        .await?;

        tx.commit().await?;
        Ok(event.id)
    })
    .await
}

/// Advance an agent's journal cursor; it never moves backwards. Returns
/// the cursor after the update.
pub async fn advance_cursor(pool: &SqlitePool, agent_name: &str, position: i64) -> Result<i64> {
    if agent_name.is_empty() {
        return Err(StoreError::invalid("agent_name must not be empty"));
    }

    txn::with_retry(|| async move {
        let mut conn = pool.acquire().await?;
        let state = agent_state::advance_cursor(&mut conn, agent_name, position, Utc::now()).await?;
        Ok(state.cursor_position)
    })
    .await
}

/// Record a checkpoint event and advance the agent's cursor to it, in one
/// transaction. A replay carrying the same `request_id` returns the
/// original event id.
pub async fn checkpoint(pool: &SqlitePool, req: &CheckpointRequest<'_>) -> Result<CheckpointResult> {
    if req.agent_name.is_empty() {
        return Err(StoreError::invalid("agent_name must not be empty"));
    }
    if req.message.is_empty() {
        return Err(StoreError::invalid("message must not be empty"));
    }

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let new = NewEvent {
            kind: EventKind::Checkpoint,
            agent_name: req.agent_name,
            project_id: None,
            task_id: None,
            message: req.message,
            metadata: req.metadata.clone(),
            request_id: req.request_id,
            created_at: now,
        };
        let event = match req.request_id {
            Some(_) => events::insert_event_idempotent(&mut tx, &new).await?.0,
            None => events::insert_event(&mut tx, &new).await?,
        };

        let state =
            agent_state::advance_cursor(&mut tx, req.agent_name, event.id, now).await?;

        tx.commit().await?;
        Ok(CheckpointResult {
            event_id: event.id,
            cursor_position: state.cursor_position,
        })
    })
    .await
}
