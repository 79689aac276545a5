//! Database query functions for the append-only `events` journal.
//!
//! Rows are immutable after insertion except for `archived_at`. Replayed
//! operations are deduplicated by the partial unique index over
//! `(agent_name, request_id)`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;
use sqlx::types::Json;

use crate::error::{Result, StoreError};
use crate::models::{Event, EventKind};

/// Parameters for inserting a new event row.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub kind: EventKind,
    pub agent_name: &'a str,
    pub project_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub message: &'a str,
    pub metadata: Option<Value>,
    pub request_id: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

impl<'a> NewEvent<'a> {
    /// A minimal event with only the always-required fields set.
    pub fn new(
        kind: EventKind,
        agent_name: &'a str,
        message: &'a str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            agent_name,
            project_id: None,
            task_id: None,
            message,
            metadata: None,
            request_id: None,
            created_at,
        }
    }
}

/// Filters for listing events; `None` fields match everything. Archived
/// events are excluded unless `include_archived` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventFilter<'a> {
    pub agent_name: Option<&'a str>,
    pub project_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub kind: Option<EventKind>,
    pub include_archived: bool,
    pub limit: Option<i64>,
}

/// The request id is carried both in its own column (for the unique index)
/// and embedded in the metadata object, so replayed callers can recover it
/// from either place.
fn metadata_json(metadata: Option<Value>, request_id: Option<&str>) -> Option<Json<Value>> {
    match (metadata, request_id) {
        (None, None) => None,
        (metadata, request_id) => {
            let mut value = metadata.unwrap_or_else(|| Value::Object(Default::default()));
            if let Some(rid) = request_id {
                if let Some(object) = value.as_object_mut() {
                    object.insert("request_id".to_owned(), Value::String(rid.to_owned()));
                }
            }
            Some(Json(value))
        }
    }
}

/// Insert a new event row. Event ids are assigned by the store and are
/// monotonically increasing by insertion order.
pub async fn insert_event(conn: &mut SqliteConnection, new: &NewEvent<'_>) -> Result<Event> {
    let metadata = metadata_json(new.metadata.clone(), new.request_id);
    let event = sqlx::query_as::<_, Event>(
        "INSERT INTO events (kind, agent_name, project_id, task_id, message, metadata, request_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.kind)
    .bind(new.agent_name)
    .bind(new.project_id)
    .bind(new.task_id)
    .bind(new.message)
    .bind(metadata)
    .bind(new.request_id)
    .bind(new.created_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(event)
}

/// Insert an event deduplicated by `(agent_name, request_id)`.
///
/// Returns the stored event and whether this call created it; a replay
/// hits the unique index and gets the original row back.
pub async fn insert_event_idempotent(
    conn: &mut SqliteConnection,
    new: &NewEvent<'_>,
) -> Result<(Event, bool)> {
    let request_id = new
        .request_id
        .ok_or_else(|| StoreError::invalid("request_id must not be empty"))?;

    match insert_event(&mut *conn, new).await {
        Ok(event) => Ok((event, true)),
        Err(err) if err.is_unique_violation() => {
            let existing = find_by_request_id(&mut *conn, new.agent_name, request_id)
                .await?
                .ok_or(err)?;
            Ok((existing, false))
        }
        Err(err) => Err(err),
    }
}

/// Look up the event recorded for a given `(agent_name, request_id)` pair.
pub async fn find_by_request_id(
    conn: &mut SqliteConnection,
    agent_name: &str,
    request_id: &str,
) -> Result<Option<Event>> {
    let event = sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE agent_name = ? AND request_id = ?",
    )
    .bind(agent_name)
    .bind(request_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(event)
}

/// List events matching the filter, newest first.
pub async fn list_events(conn: &mut SqliteConnection, filter: &EventFilter<'_>) -> Result<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events \
         WHERE (? IS NULL OR agent_name = ?) \
           AND (? IS NULL OR project_id = ?) \
           AND (? IS NULL OR task_id = ?) \
           AND (? IS NULL OR kind = ?) \
           AND (? OR archived_at IS NULL) \
         ORDER BY id DESC \
         LIMIT COALESCE(?, -1)",
    )
    .bind(filter.agent_name)
    .bind(filter.agent_name)
    .bind(filter.project_id)
    .bind(filter.project_id)
    .bind(filter.task_id)
    .bind(filter.task_id)
    .bind(filter.kind)
    .bind(filter.kind)
    .bind(filter.include_archived)
    .bind(filter.limit)
    .fetch_all(&mut *conn)
    .await?;

    Ok(events)
}

/// Fetch events with id greater than `after_id`, oldest first.
pub async fn fetch_events_since(
    conn: &mut SqliteConnection,
    after_id: i64,
    include_archived: bool,
    limit: Option<i64>,
) -> Result<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events \
         WHERE id > ? AND (? OR archived_at IS NULL) \
         ORDER BY id ASC \
         LIMIT COALESCE(?, -1)",
    )
    .bind(after_id)
    .bind(include_archived)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    Ok(events)
}

/// Count non-archived events, optionally scoped to a project.
pub async fn count_active_events(
    conn: &mut SqliteConnection,
    project_id: Option<&str>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM events \
         WHERE archived_at IS NULL AND (? IS NULL OR project_id = ?)",
    )
    .bind(project_id)
    .bind(project_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.0)
}

/// Identify the contiguous oldest range of active events to archive so
/// that `keep_recent` of them remain. Returns `(0, 0)` when there is
/// nothing to do.
pub async fn find_archive_window(
    conn: &mut SqliteConnection,
    project_id: Option<&str>,
    keep_recent: i64,
) -> Result<(i64, i64)> {
    let keep_recent = keep_recent.max(0);
    let total = count_active_events(&mut *conn, project_id).await?;
    if keep_recent >= total {
        return Ok((0, 0));
    }

    let row: (Option<i64>, Option<i64>) = sqlx::query_as(
        "SELECT MIN(id), MAX(id) FROM ( \
             SELECT id FROM events \
             WHERE archived_at IS NULL AND (? IS NULL OR project_id = ?) \
             ORDER BY id ASC \
             LIMIT ? \
         )",
    )
    .bind(project_id)
    .bind(project_id)
    .bind(total - keep_recent)
    .fetch_one(&mut *conn)
    .await?;

    Ok((row.0.unwrap_or(0), row.1.unwrap_or(0)))
}

/// Stamp `archived_at` on active events in `[from_id, to_id]` belonging to
/// `agent_name`, optionally narrowed to a project or task. Returns the
/// number of rows stamped.
pub async fn archive_range(
    conn: &mut SqliteConnection,
    agent_name: &str,
    project_id: Option<&str>,
    task_id: Option<&str>,
    from_id: i64,
    to_id: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE events \
         SET archived_at = ? \
         WHERE id BETWEEN ? AND ? \
           AND archived_at IS NULL \
           AND agent_name = ? \
           AND (? IS NULL OR project_id = ?) \
           AND (? IS NULL OR task_id = ?)",
    )
    .bind(now)
    .bind(from_id)
    .bind(to_id)
    .bind(agent_name)
    .bind(project_id)
    .bind(project_id)
    .bind(task_id)
    .bind(task_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Physically delete archived events whose `archived_at` predates
/// `cutoff`, oldest first, bounded by `limit`. Returns rows deleted.
pub async fn delete_archived(
    conn: &mut SqliteConnection,
    project_id: Option<&str>,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM events WHERE id IN ( \
             SELECT id FROM events \
             WHERE archived_at IS NOT NULL AND archived_at < ? \
               AND (? IS NULL OR project_id = ?) \
             ORDER BY id ASC \
             LIMIT ? \
         )",
    )
    .bind(cutoff)
    .bind(project_id)
    .bind(project_id)
    .bind(limit)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Null out `project_id` on all events referencing the given project.
pub async fn clear_project_refs(
    conn: &mut SqliteConnection,
    project_id: &str,
) -> Result<u64> {
    let result = sqlx::query("UPDATE events SET project_id = NULL WHERE project_id = ?")
        .bind(project_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}
