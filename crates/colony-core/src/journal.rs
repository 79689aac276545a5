//! Public surface of the append-only event journal.
//!
//! Appends, listings, archival, and pruning. Operations carrying a
//! `request_id` are idempotent per `(agent_name, request_id)`: a replay
//! returns the originally recorded outcome instead of acting twice.

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::debug;

use colony_db::error::{Result, StoreError};
use colony_db::models::{Event, EventKind};
use colony_db::queries::events::{self, EventFilter, NewEvent};
use colony_db::txn;

/// Rows pruned per call when the caller does not bound the sweep.
const DEFAULT_PRUNE_LIMIT: i64 = 1000;

/// Parameters for appending an event.
#[derive(Debug, Clone)]
pub struct AppendEvent<'a> {
    pub kind: EventKind,
    pub agent_name: &'a str,
    pub project_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub message: &'a str,
    pub metadata: Option<Value>,
    /// When set, the append is idempotent per `(agent_name, request_id)`
    /// and the id is embedded in the stored metadata.
    pub request_id: Option<&'a str>,
}

impl<'a> AppendEvent<'a> {
    pub fn new(kind: EventKind, agent_name: &'a str, message: &'a str) -> Self {
        Self {
            kind,
            agent_name,
            project_id: None,
            task_id: None,
            message,
            metadata: None,
            request_id: None,
        }
    }
}

/// Parameters for [`archive_events_range_with_summary`].
#[derive(Debug, Clone)]
pub struct ArchiveRequest<'a> {
    pub agent_name: &'a str,
    pub request_id: &'a str,
    pub project_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub from_id: i64,
    pub to_id: i64,
    pub summary: &'a str,
}

/// Result of an archival run (or of replaying one).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ArchiveOutcome {
    pub summary_event_id: i64,
    pub archived: u64,
}

/// Parameters for [`prune_archived_events`].
#[derive(Debug, Clone)]
pub struct PruneRequest<'a> {
    pub agent_name: &'a str,
    pub request_id: &'a str,
    pub project_id: Option<&'a str>,
    pub older_than_days: i64,
    pub limit: i64,
}

/// Append an event, returning the stored row.
///
/// With a `request_id`, a replayed call returns the original event.
pub async fn append_event(pool: &SqlitePool, req: &AppendEvent<'_>) -> Result<Event> {
    if req.agent_name.is_empty() {
        return Err(StoreError::invalid("agent_name must not be empty"));
    }

    txn::with_retry(|| async move {
        let mut conn = pool.acquire().await?;
        let new = NewEvent {
            kind: req.kind,
            agent_name: req.agent_name,
            project_id: req.project_id,
            task_id: req.task_id,
            message: req.message,
            metadata: req.metadata.clone(),
            request_id: req.request_id,
            created_at: Utc::now(),
        };
        let event = match req.request_id {
            Some(_) => events::insert_event_idempotent(&mut conn, &new).await?.0,
            None => events::insert_event(&mut conn, &new).await?,
        };
        Ok(event)
    })
    .await
}

/// List events matching the filter, newest first. Archived events are
/// excluded unless the filter opts in.
pub async fn list_events(pool: &SqlitePool, filter: &EventFilter<'_>) -> Result<Vec<Event>> {
    let mut conn = pool.acquire().await?;
    events::list_events(&mut conn, filter).await
}

/// Fetch events with id greater than `after_id`, oldest first.
pub async fn fetch_events_since(
    pool: &SqlitePool,
    after_id: i64,
    include_archived: bool,
    limit: Option<i64>,
) -> Result<Vec<Event>> {
    let mut conn = pool.acquire().await?;
    events::fetch_events_since(&mut conn, after_id, include_archived, limit).await
}

/// Count non-archived events, optionally scoped to a project.
pub async fn count_active_events(pool: &SqlitePool, project_id: Option<&str>) -> Result<i64> {
    let mut conn = pool.acquire().await?;
    events::count_active_events(&mut conn, project_id).await
}

/// Identify the oldest contiguous range of active events to archive so
/// that `keep_recent` remain; `(0, 0)` when there is nothing to do.
pub async fn find_archive_window(
    pool: &SqlitePool,
    project_id: Option<&str>,
    keep_recent: i64,
) -> Result<(i64, i64)> {
    let mut conn = pool.acquire().await?;
    events::find_archive_window(&mut conn, project_id, keep_recent).await
}

/// Archive the event range `[from_id, to_id]` and append a single
/// `events_summary` event carrying `summary`.
///
/// Idempotent per `(agent_name, request_id)`: replaying returns the
/// original summary event id and archived count, recorded in the summary
/// event's metadata.
pub async fn archive_events_range_with_summary(
    pool: &SqlitePool,
    req: &ArchiveRequest<'_>,
) -> Result<ArchiveOutcome> {
    if req.agent_name.is_empty() {
        return Err(StoreError::invalid("agent_name must not be empty"));
    }
    if req.request_id.is_empty() {
        return Err(StoreError::invalid("request_id must not be empty"));
    }
    if req.summary.is_empty() {
        return Err(StoreError::invalid("summary must not be empty"));
    }

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        if let Some(existing) =
            events::find_by_request_id(&mut tx, req.agent_name, req.request_id).await?
        {
            let archived = recorded_count(&existing, "archived");
            return Ok(ArchiveOutcome {
                summary_event_id: existing.id,
                archived,
            });
        }

        let archived = events::archive_range(
            &mut tx,
            req.agent_name,
            req.project_id,
            req.task_id,
            req.from_id,
            req.to_id,
            now,
        )
        .await?;

        let (summary_event, _) = events::insert_event_idempotent(
            &mut tx,
            &NewEvent {
                kind: EventKind::EventsSummary,
                agent_name: req.agent_name,
                project_id: req.project_id,
                task_id: req.task_id,
                message: req.summary,
                metadata: Some(serde_json::json!({
                    "from_id": req.from_id,
                    "to_id": req.to_id,
                    "archived": archived,
                })),
                request_id: Some(req.request_id),
                created_at: now,
            },
        )
        .await?;

        tx.commit().await?;
        debug!(
            from_id = req.from_id,
            to_id = req.to_id,
            archived,
            "archived event range"
        );
        Ok(ArchiveOutcome {
            summary_event_id: summary_event.id,
            archived,
        })
    })
    .await
}

/// Physically delete archived events older than `older_than_days`,
/// bounded by `limit` rows per call.
///
/// Idempotent per `(agent_name, request_id)`: the deletion count is
/// recorded on an `events_pruned` event and returned unchanged on replay.
pub async fn prune_archived_events(pool: &SqlitePool, req: &PruneRequest<'_>) -> Result<u64> {
    if req.agent_name.is_empty() {
        return Err(StoreError::invalid("agent_name must not be empty"));
    }
    if req.request_id.is_empty() {
        return Err(StoreError::invalid("request_id must not be empty"));
    }

    let older_than_days = req.older_than_days.max(0);
    let limit = if req.limit <= 0 {
        DEFAULT_PRUNE_LIMIT
    } else {
        req.limit
    };

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        if let Some(existing) =
            events::find_by_request_id(&mut tx, req.agent_name, req.request_id).await?
        {
            return Ok(recorded_count(&existing, "deleted"));
        }

        let cutoff = now - TimeDelta::days(older_than_days);
        let deleted = events::delete_archived(&mut tx, req.project_id, cutoff, limit).await?;

        let message = format!("pruned {deleted} archived events");
        events::insert_event_idempotent(
            &mut tx,
            &NewEvent {
                kind: EventKind::EventsPruned,
                agent_name: req.agent_name,
                project_id: req.project_id,
                task_id: None,
                message: &message,
                metadata: Some(serde_json::json!({
                    "deleted": deleted,
                    "older_than_days": older_than_days,
                })),
                request_id: Some(req.request_id),
                created_at: now,
            },
        )
        .await?;

        tx.commit().await?;
        debug!(deleted, older_than_days, "pruned archived events");
        Ok(deleted)
    })
    .await
}

/// Read a count previously recorded in an idempotency-log event.
fn recorded_count(event: &Event, key: &str) -> u64 {
    event
        .metadata_value()
        .and_then(|meta| meta.get(key))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}
