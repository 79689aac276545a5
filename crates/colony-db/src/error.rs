//! Categorized error type shared by every store operation.
//!
//! `VersionConflict` and `ClaimContention` are ordinary control-flow
//! outcomes for callers racing on hot rows; only `Transient` is eligible
//! for retry by the transaction runner.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result alias used throughout the store.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Error returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("version conflict on task {task_id}: expected version {expected}")]
    VersionConflict { task_id: String, expected: i64 },

    #[error("task {task_id} is claimed by {owner} until {expires_at}")]
    ClaimContention {
        task_id: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("agent {agent} does not hold a live claim on task {task_id}")]
    ClaimNotOwned { task_id: String, agent: String },

    #[error("dependency {task_id} -> {depends_on} would create a cycle")]
    CycleDetected {
        task_id: String,
        depends_on: String,
    },

    #[error("transient database error: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("database error: {0}")]
    Internal(#[source] sqlx::Error),
}

impl StoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the transaction runner may re-run the failed closure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the underlying driver error is a unique-constraint violation.
    ///
    /// Idempotent insertion paths use this to detect a replayed
    /// `(agent_name, request_id)` pair and fall back to the original row.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Transient(err) | Self::Internal(err) => match err {
                sqlx::Error::Database(db) => db.is_unique_violation(),
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            Self::Transient(err)
        } else {
            Self::Internal(err)
        }
    }
}

/// Classify SQLITE_BUSY / SQLITE_LOCKED (including their extended codes,
/// which carry the primary code in the low byte).
fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    match db.code().as_deref().and_then(|c| c.parse::<u32>().ok()) {
        Some(code) => matches!(code & 0xff, 5 | 6),
        None => {
            let message = db.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
    }
}
