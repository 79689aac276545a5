//! Task registry: CRUD with optimistic versioning.
//!
//! Every mutation is compare-and-swap on the task's `version` and appends
//! a journal event in the same transaction.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use colony_db::error::{Result, StoreError};
use colony_db::ids;
use colony_db::models::{EventKind, Task, TaskStatus};
use colony_db::queries::events::NewEvent;
use colony_db::queries::tasks::{NewTask, TaskFilter};
use colony_db::queries::{dependencies, events, tasks};
use colony_db::txn;

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct CreateTaskRequest<'a> {
    pub agent: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub project_id: Option<&'a str>,
    pub priority: i64,
}

/// Create a new task. The task starts `pending` at version 1 with no
/// lease and no blocked reason; a `task_created` event is appended in the
/// same transaction.
pub async fn create_task(pool: &SqlitePool, req: &CreateTaskRequest<'_>) -> Result<Task> {
    if req.agent.is_empty() {
        return Err(StoreError::invalid("agent must not be empty"));
    }
    if req.title.is_empty() {
        return Err(StoreError::invalid("title must not be empty"));
    }

    let id = ids::new_id(ids::TASK_PREFIX);
    let id = id.as_str();
    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let task = tasks::insert_task(
            &mut tx,
            &NewTask {
                id,
                title: req.title,
                description: req.description,
                project_id: req.project_id,
                priority: req.priority,
                created_at: now,
            },
        )
        .await?;

        let message = format!("created task {}", task.id);
        events::insert_event(
            &mut tx,
            &NewEvent {
                kind: EventKind::TaskCreated,
                task_id: Some(&task.id),
                project_id: req.project_id,
                metadata: Some(serde_json::json!({
                    "title": req.title,
                    "priority": req.priority,
                })),
                ..NewEvent::new(EventKind::TaskCreated, req.agent, &message, now)
            },
        )
        .await?;

        tx.commit().await?;
        Ok(task)
    })
    .await
}

/// Fetch a task by ID with its dependency list attached.
pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Task> {
    let mut conn = pool.acquire().await?;
    let mut task = tasks::get_task(&mut conn, id)
        .await?
        .ok_or_else(|| StoreError::not_found("task", id))?;
    task.depends_on = dependencies::dependency_ids(&mut conn, id).await?;
    Ok(task)
}

/// List tasks matching the filter, highest priority first. Dependency
/// lists are attached in batches.
pub async fn list_tasks(pool: &SqlitePool, filter: &TaskFilter<'_>) -> Result<Vec<Task>> {
    let mut conn = pool.acquire().await?;
    let mut listed = tasks::list_tasks(&mut conn, filter).await?;

    let ids: Vec<String> = listed.iter().map(|t| t.id.clone()).collect();
    let mut by_task: HashMap<String, Vec<String>> = HashMap::new();
    for (task_id, depends_on) in dependencies::edges_for_tasks(&mut conn, &ids).await? {
        by_task.entry(task_id).or_default().push(depends_on);
    }
    for task in &mut listed {
        if let Some(deps) = by_task.remove(&task.id) {
            task.depends_on = deps;
        }
    }

    Ok(listed)
}

/// CAS-update a task's status. Fails with `VersionConflict` when the
/// stored version no longer matches `expected_version`.
///
/// Moving out of `blocked` clears the stored `blocked_reason`; moving into
/// it keeps whatever reason is already present (the close pipeline and the
/// dependency graph are the writers of reasons).
pub async fn update_task_status(
    pool: &SqlitePool,
    agent: &str,
    id: &str,
    new_status: TaskStatus,
    expected_version: i64,
) -> Result<Task> {
    if agent.is_empty() {
        return Err(StoreError::invalid("agent must not be empty"));
    }

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let task = tasks::get_task(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", id))?;

        let reason: Option<String> = match new_status {
            TaskStatus::Blocked => task.blocked_reason.clone(),
            _ => None,
        };
        let rows =
            tasks::cas_set_status(&mut tx, id, new_status, reason.as_deref(), expected_version, now)
                .await?;
        if rows == 0 {
            return Err(StoreError::VersionConflict {
                task_id: id.to_owned(),
                expected: expected_version,
            });
        }

        let message = format!("task {} status {} -> {}", id, task.status, new_status);
        events::insert_event(
            &mut tx,
            &NewEvent {
                kind: EventKind::TaskStatus,
                task_id: Some(id),
                project_id: task.project_id.as_deref(),
                metadata: Some(serde_json::json!({
                    "from": task.status,
                    "to": new_status,
                })),
                ..NewEvent::new(EventKind::TaskStatus, agent, &message, now)
            },
        )
        .await?;

        tx.commit().await?;

        let mut updated = task;
        updated.status = new_status;
        updated.blocked_reason = reason;
        updated.version = expected_version + 1;
        updated.updated_at = now;
        Ok(updated)
    })
    .await
}

/// CAS-update a task's priority, appending a `task_priority_changed`
/// event.
pub async fn update_task_priority(
    pool: &SqlitePool,
    agent: &str,
    id: &str,
    priority: i64,
    expected_version: i64,
) -> Result<Task> {
    if agent.is_empty() {
        return Err(StoreError::invalid("agent must not be empty"));
    }

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let task = tasks::get_task(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", id))?;

        let rows = tasks::cas_set_priority(&mut tx, id, priority, expected_version, now).await?;
        if rows == 0 {
            return Err(StoreError::VersionConflict {
                task_id: id.to_owned(),
                expected: expected_version,
            });
        }

        let message = format!("task {} priority {} -> {}", id, task.priority, priority);
        events::insert_event(
            &mut tx,
            &NewEvent {
                kind: EventKind::TaskPriorityChanged,
                task_id: Some(id),
                project_id: task.project_id.as_deref(),
                metadata: Some(serde_json::json!({
                    "from": task.priority,
                    "to": priority,
                })),
                ..NewEvent::new(EventKind::TaskPriorityChanged, agent, &message, now)
            },
        )
        .await?;

        tx.commit().await?;

        let mut updated = task;
        updated.priority = priority;
        updated.version = expected_version + 1;
        updated.updated_at = now;
        Ok(updated)
    })
    .await
}

/// Delete a task.
///
/// Refused while the task is `in_progress` or another agent holds a live
/// lease on it; the error names the blocking agent. Dependency edges are
/// cascaded away and dependents that were only waiting on this task are
/// unblocked in the same transaction.
pub async fn delete_task(pool: &SqlitePool, agent: &str, id: &str) -> Result<()> {
    if agent.is_empty() {
        return Err(StoreError::invalid("agent must not be empty"));
    }

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let task = tasks::get_task(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", id))?;

        if task.status == TaskStatus::InProgress {
            let holder = task
                .claimed_by
                .as_deref()
                .map(|owner| format!(" (claimed by {owner})"))
                .unwrap_or_default();
            return Err(StoreError::invalid(format!(
                "cannot delete task {id}: status is in_progress{holder}"
            )));
        }
        if task.has_live_foreign_claim(agent, now) {
            return Err(StoreError::ClaimContention {
                task_id: id.to_owned(),
                owner: task.claimed_by.clone().unwrap_or_default(),
                expires_at: task.claim_expires_at.unwrap_or(now),
            });
        }

        let dependents = dependencies::dependent_ids(&mut tx, id).await?;
        tasks::delete_task(&mut tx, id).await?;
        let unblocked = dependencies::unblock_among(&mut tx, &dependents, now).await?;

        let message = format!("deleted task {id}");
        events::insert_event(
            &mut tx,
            &NewEvent {
                kind: EventKind::TaskDeleted,
                task_id: Some(id),
                project_id: task.project_id.as_deref(),
                metadata: Some(serde_json::json!({ "title": task.title })),
                ..NewEvent::new(EventKind::TaskDeleted, agent, &message, now)
            },
        )
        .await?;

        tx.commit().await?;
        if !unblocked.is_empty() {
            debug!(task_id = %id, unblocked = unblocked.len(), "deletion unblocked dependents");
        }
        Ok(())
    })
    .await
}
