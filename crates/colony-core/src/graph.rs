//! Dependency graph maintenance.
//!
//! Edges mean "task depends on target". The graph is kept acyclic by a
//! bounded breadth-first search at insertion time, and tasks waiting on
//! incomplete targets are parked as `blocked` with the canonical
//! `dependency` reason. Unblocking (on completion or deletion of the
//! target) never touches tasks parked for `failure:*` reasons.

use std::collections::HashSet;

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use colony_db::error::{Result, StoreError};
use colony_db::models::{BLOCKED_REASON_DEPENDENCY, TaskStatus};
use colony_db::queries::{dependencies, tasks};
use colony_db::txn;

/// Cycle detection gives up after visiting this many nodes.
const CYCLE_VISIT_LIMIT: usize = 1000;

/// Cycle detection gives up beyond this depth.
const CYCLE_DEPTH_LIMIT: usize = 50;

/// Add a dependency edge: `task_id` depends on `depends_on`.
///
/// Validates both tasks exist, rejects self-edges and cycles, inserts the
/// edge idempotently, and parks the task as `blocked`/`dependency` while
/// the target is incomplete.
pub async fn add_dependency(pool: &SqlitePool, task_id: &str, depends_on: &str) -> Result<()> {
    if task_id.is_empty() || depends_on.is_empty() {
        return Err(StoreError::invalid("task ids must not be empty"));
    }
    if task_id == depends_on {
        return Err(StoreError::invalid(format!(
            "task {task_id} cannot depend on itself"
        )));
    }

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let task = tasks::get_task(&mut tx, task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        let target = tasks::get_task(&mut tx, depends_on)
            .await?
            .ok_or_else(|| StoreError::not_found("task", depends_on))?;

        if path_exists(&mut tx, depends_on, task_id).await? {
            return Err(StoreError::CycleDetected {
                task_id: task_id.to_owned(),
                depends_on: depends_on.to_owned(),
            });
        }

        dependencies::insert_edge(&mut tx, task_id, depends_on, now).await?;

        let already_parked = task.status == TaskStatus::Blocked
            && task.blocked_reason.as_deref() == Some(BLOCKED_REASON_DEPENDENCY);
        if target.status != TaskStatus::Completed && !already_parked {
            let rows = tasks::cas_set_status(
                &mut tx,
                task_id,
                TaskStatus::Blocked,
                Some(BLOCKED_REASON_DEPENDENCY),
                task.version,
                now,
            )
            .await?;
            if rows == 0 {
                return Err(StoreError::VersionConflict {
                    task_id: task_id.to_owned(),
                    expected: task.version,
                });
            }
        }

        tx.commit().await?;
        debug!(task_id = %task_id, depends_on = %depends_on, "added dependency");
        Ok(())
    })
    .await
}

/// Remove a dependency edge. When the task was blocked on its
/// dependencies and none remain unresolved, it returns to `pending`.
pub async fn remove_dependency(pool: &SqlitePool, task_id: &str, depends_on: &str) -> Result<()> {
    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let task = tasks::get_task(&mut tx, task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        dependencies::delete_edge(&mut tx, task_id, depends_on).await?;

        let parked = task.status == TaskStatus::Blocked
            && task.blocked_reason.as_deref() == Some(BLOCKED_REASON_DEPENDENCY);
        if parked && dependencies::incomplete_dependency_count(&mut tx, task_id).await? == 0 {
            let rows = tasks::cas_set_status(
                &mut tx,
                task_id,
                TaskStatus::Pending,
                None,
                task.version,
                now,
            )
            .await?;
            if rows == 0 {
                return Err(StoreError::VersionConflict {
                    task_id: task_id.to_owned(),
                    expected: task.version,
                });
            }
        }

        tx.commit().await?;
        debug!(task_id = %task_id, depends_on = %depends_on, "removed dependency");
        Ok(())
    })
    .await
}

/// Whether a dependency path `from -> ... -> to` already exists.
///
/// Breadth-first over outgoing dependency edges, bounded by
/// [`CYCLE_VISIT_LIMIT`] nodes and [`CYCLE_DEPTH_LIMIT`] levels; graphs in
/// practice are single-digit deep, the bounds only guard pathological
/// ones.
async fn path_exists(conn: &mut SqliteConnection, from: &str, to: &str) -> Result<bool> {
    let mut visited: HashSet<String> = HashSet::from([from.to_owned()]);
    let mut frontier = vec![from.to_owned()];

    for _ in 0..CYCLE_DEPTH_LIMIT {
        if frontier.is_empty() || visited.len() >= CYCLE_VISIT_LIMIT {
            break;
        }
        let mut next = Vec::new();
        for (_, target) in dependencies::edges_for_tasks(&mut *conn, &frontier).await? {
            if target == to {
                return Ok(true);
            }
            if visited.insert(target.clone()) {
                next.push(target);
            }
        }
        frontier = next;
    }

    Ok(false)
}
