//! The close pipeline.
//!
//! Closing a task is one transaction: the status CAS, the dependent
//! unblocking (on completion), the blocked-reason write, and both journal
//! events commit together or not at all.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::debug;

use colony_db::error::{Result, StoreError};
use colony_db::models::{EventKind, TaskStatus};
use colony_db::queries::events::NewEvent;
use colony_db::queries::{dependencies, events, tasks};
use colony_db::txn;

/// Parameters for closing a task.
#[derive(Debug, Clone)]
pub struct CloseTaskRequest<'a> {
    pub agent: &'a str,
    pub task_id: &'a str,
    /// Must be `completed` or `blocked`.
    pub status: TaskStatus,
    pub summary: &'a str,
    pub label: Option<&'a str>,
    /// Reason stored when closing as `blocked`; an empty or absent value
    /// clears any stale reason rather than retaining it.
    pub blocked_reason: Option<&'a str>,
}

/// Event ids produced by a successful close.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CloseTaskResult {
    pub status_event_id: i64,
    pub close_event_id: i64,
}

/// Close a task with an outcome.
///
/// On `completed`, dependents blocked only on this task return to
/// `pending` within the same transaction. The `task_closed` event carries
/// `{outcome, summary, label?}` as metadata.
pub async fn close_task(pool: &SqlitePool, req: &CloseTaskRequest<'_>) -> Result<CloseTaskResult> {
    if req.agent.is_empty() {
        return Err(StoreError::invalid("agent must not be empty"));
    }
    if req.task_id.is_empty() {
        return Err(StoreError::invalid("task_id must not be empty"));
    }
    if req.summary.is_empty() {
        return Err(StoreError::invalid("summary must not be empty"));
    }
    if !matches!(req.status, TaskStatus::Completed | TaskStatus::Blocked) {
        return Err(StoreError::invalid(format!(
            "close status must be completed or blocked, got {}",
            req.status
        )));
    }

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let task = tasks::get_task(&mut tx, req.task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", req.task_id))?;

        let reason = match req.status {
            TaskStatus::Blocked => req.blocked_reason.filter(|r| !r.is_empty()),
            _ => None,
        };
        let rows =
            tasks::cas_set_status(&mut tx, req.task_id, req.status, reason, task.version, now)
                .await?;
        if rows == 0 {
            return Err(StoreError::VersionConflict {
                task_id: req.task_id.to_owned(),
                expected: task.version,
            });
        }

        let status_message = format!("task {} status {} -> {}", req.task_id, task.status, req.status);
        let status_event = events::insert_event(
            &mut tx,
            &NewEvent {
                kind: EventKind::TaskStatus,
                task_id: Some(req.task_id),
                project_id: task.project_id.as_deref(),
                metadata: Some(serde_json::json!({
                    "from": task.status,
                    "to": req.status,
                })),
                ..NewEvent::new(EventKind::TaskStatus, req.agent, &status_message, now)
            },
        )
        .await?;

        let unblocked = if req.status == TaskStatus::Completed {
            dependencies::unblock_dependents(&mut tx, req.task_id, now).await?
        } else {
            Vec::new()
        };

        let mut close_metadata = Map::new();
        close_metadata.insert("outcome".to_owned(), Value::String(req.status.to_string()));
        close_metadata.insert("summary".to_owned(), Value::String(req.summary.to_owned()));
        if let Some(label) = req.label {
            close_metadata.insert("label".to_owned(), Value::String(label.to_owned()));
        }

        let close_event = events::insert_event(
            &mut tx,
            &NewEvent {
                kind: EventKind::TaskClosed,
                task_id: Some(req.task_id),
                project_id: task.project_id.as_deref(),
                metadata: Some(Value::Object(close_metadata)),
                ..NewEvent::new(EventKind::TaskClosed, req.agent, req.summary, now)
            },
        )
        .await?;

        tx.commit().await?;
        if !unblocked.is_empty() {
            debug!(task_id = %req.task_id, unblocked = unblocked.len(), "completion unblocked dependents");
        }
        Ok(CloseTaskResult {
            status_event_id: status_event.id,
            close_event_id: close_event.id,
        })
    })
    .await
}
