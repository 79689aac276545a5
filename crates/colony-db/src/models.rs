use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Canonical `blocked_reason` for tasks waiting on incomplete dependencies.
///
/// Reasons of the form `failure:<cause>` mark tasks parked by a failed
/// close; those are never touched by dependency-driven unblocking.
pub const BLOCKED_REASON_DEPENDENCY: &str = "dependency";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of journal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskStatus,
    TaskPriorityChanged,
    TaskClaimed,
    TaskClosed,
    TaskDeleted,
    AgentFocus,
    MemoryUpserted,
    Checkpoint,
    UserPrompt,
    EventsSummary,
    EventsPruned,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskCreated => "task_created",
            Self::TaskStatus => "task_status",
            Self::TaskPriorityChanged => "task_priority_changed",
            Self::TaskClaimed => "task_claimed",
            Self::TaskClosed => "task_closed",
            Self::TaskDeleted => "task_deleted",
            Self::AgentFocus => "agent_focus",
            Self::MemoryUpserted => "memory_upserted",
            Self::Checkpoint => "checkpoint",
            Self::UserPrompt => "user_prompt",
            Self::EventsSummary => "events_summary",
            Self::EventsPruned => "events_pruned",
        };
        f.write_str(s)
    }
}

impl FromStr for EventKind {
    type Err = EventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_created" => Ok(Self::TaskCreated),
            "task_status" => Ok(Self::TaskStatus),
            "task_priority_changed" => Ok(Self::TaskPriorityChanged),
            "task_claimed" => Ok(Self::TaskClaimed),
            "task_closed" => Ok(Self::TaskClosed),
            "task_deleted" => Ok(Self::TaskDeleted),
            "agent_focus" => Ok(Self::AgentFocus),
            "memory_upserted" => Ok(Self::MemoryUpserted),
            "checkpoint" => Ok(Self::Checkpoint),
            "user_prompt" => Ok(Self::UserPrompt),
            "events_summary" => Ok(Self::EventsSummary),
            "events_pruned" => Ok(Self::EventsPruned),
            other => Err(EventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventKind`] string.
#[derive(Debug, Clone)]
pub struct EventKindParseError(pub String);

impl fmt::Display for EventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event kind: {:?}", self.0)
    }
}

impl std::error::Error for EventKindParseError {}

// ---------------------------------------------------------------------------

/// Status of a retrospective job.
///
/// `succeeded` and `dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetroStatus {
    Queued,
    Running,
    Retry,
    Succeeded,
    Dead,
}

impl RetroStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }
}

impl fmt::Display for RetroStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retry => "retry",
            Self::Succeeded => "succeeded",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for RetroStatus {
    type Err = RetroStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "retry" => Ok(Self::Retry),
            "succeeded" => Ok(Self::Succeeded),
            "dead" => Ok(Self::Dead),
            other => Err(RetroStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RetroStatus`] string.
#[derive(Debug, Clone)]
pub struct RetroStatusParseError(pub String);

impl fmt::Display for RetroStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid retrospective job status: {:?}", self.0)
    }
}

impl std::error::Error for RetroStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the unit of claimable agent work.
///
/// `version` starts at 1 and increases on every mutation; all writes are
/// compare-and-swap on it. The lease triple (`claimed_by`, `claimed_at`,
/// `claim_expires_at`) together with `last_heartbeat_at` is set and cleared
/// as a unit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub project_id: Option<String>,
    pub blocked_reason: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub attempt: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// IDs of tasks this task depends on; populated by the registry, not
    /// stored on the row itself.
    #[sqlx(skip)]
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Task {
    /// Whether another agent currently holds an unexpired lease.
    pub fn has_live_foreign_claim(&self, agent: &str, now: DateTime<Utc>) -> bool {
        match (&self.claimed_by, self.claim_expires_at) {
            (Some(owner), Some(expires)) => owner != agent && expires > now,
            _ => false,
        }
    }
}

/// An edge in the task dependency DAG: `task_id` depends on
/// `depends_on_task_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: String,
    pub depends_on_task_id: String,
    pub created_at: DateTime<Utc>,
}

/// An append-only journal event.
///
/// Immutable after insertion except for `archived_at`. `metadata` is JSON
/// text in the store and surfaces parsed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: i64,
    pub kind: EventKind,
    pub agent_name: String,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub message: String,
    pub metadata: Option<Json<serde_json::Value>>,
    pub request_id: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// The parsed metadata object, if any.
    pub fn metadata_value(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref().map(|json| &json.0)
    }
}

/// Per-agent singleton tracking focus and journal cursor.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentState {
    pub agent_name: String,
    pub focus_task_id: Option<String>,
    pub focus_project_id: Option<String>,
    /// Highest event id the agent has observed.
    pub cursor_position: i64,
    pub updated_at: DateTime<Utc>,
}

/// A project namespace tag.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A durable retrospective job over an event id range.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RetrospectiveJob {
    pub id: String,
    pub agent_name: String,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub since_event_id: i64,
    pub until_event_id: i64,
    pub status: RetroStatus,
    pub attempt: i64,
    pub max_attempts: i64,
    pub next_run_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Completed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "escalated".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn event_kind_display_roundtrip() {
        let variants = [
            EventKind::TaskCreated,
            EventKind::TaskStatus,
            EventKind::TaskPriorityChanged,
            EventKind::TaskClaimed,
            EventKind::TaskClosed,
            EventKind::TaskDeleted,
            EventKind::AgentFocus,
            EventKind::MemoryUpserted,
            EventKind::Checkpoint,
            EventKind::UserPrompt,
            EventKind::EventsSummary,
            EventKind::EventsPruned,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: EventKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn event_kind_invalid() {
        let result = "task_exploded".parse::<EventKind>();
        assert!(result.is_err());
    }

    #[test]
    fn retro_status_display_roundtrip() {
        let variants = [
            RetroStatus::Queued,
            RetroStatus::Running,
            RetroStatus::Retry,
            RetroStatus::Succeeded,
            RetroStatus::Dead,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RetroStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn retro_terminal_states() {
        assert!(RetroStatus::Succeeded.is_terminal());
        assert!(RetroStatus::Dead.is_terminal());
        assert!(!RetroStatus::Queued.is_terminal());
        assert!(!RetroStatus::Running.is_terminal());
        assert!(!RetroStatus::Retry.is_terminal());
    }

    fn bare_task(now: DateTime<Utc>) -> Task {
        Task {
            id: "task_1".to_owned(),
            title: "t".to_owned(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: 0,
            project_id: None,
            blocked_reason: None,
            claimed_by: None,
            claimed_at: None,
            claim_expires_at: None,
            last_heartbeat_at: None,
            attempt: 0,
            version: 1,
            created_at: now,
            updated_at: now,
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn foreign_claim_detection() {
        let now = Utc::now();
        let mut task = bare_task(now);
        assert!(!task.has_live_foreign_claim("a", now));

        task.claimed_by = Some("b".to_owned());
        task.claim_expires_at = Some(now + TimeDelta::minutes(5));
        assert!(task.has_live_foreign_claim("a", now));
        assert!(!task.has_live_foreign_claim("b", now));

        task.claim_expires_at = Some(now - TimeDelta::minutes(5));
        assert!(!task.has_live_foreign_claim("a", now));
    }
}
