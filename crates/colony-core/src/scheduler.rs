//! The "claim next" scheduler.
//!
//! Atomically picks the highest-priority eligible task for an agent and
//! claims it: lease acquisition, the `pending -> in_progress` transition,
//! the journal events, and the agent focus update all commit together.

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use colony_db::error::{Result, StoreError};
use colony_db::models::{EventKind, TaskStatus};
use colony_db::queries::events::NewEvent;
use colony_db::queries::{agent_state, events, leases, tasks};
use colony_db::txn;

use crate::lease::{clamp_ttl_minutes, holds_live_claim};

/// Bounded select+claim retries before giving up on the round.
const SELECT_CLAIM_ATTEMPTS: u32 = 3;

/// The compound result of a successful claim-next round.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimNextOutcome {
    pub task_id: String,
    pub status_event_id: i64,
    pub focus_event_id: i64,
    pub claim_event_id: i64,
}

/// Claim the next eligible task for `agent`, or `None` when the queue has
/// nothing claimable.
///
/// Eligibility: status `pending`, no live foreign lease, matching
/// `project_id` when given, and zero unresolved dependencies. Ties on
/// priority go to the oldest task. When the claim CAS loses a race the
/// select+claim loop retries a bounded number of times before reporting
/// an empty queue.
pub async fn claim_next_task(
    pool: &SqlitePool,
    agent: &str,
    project_id: Option<&str>,
    ttl_minutes: i64,
) -> Result<Option<ClaimNextOutcome>> {
    if agent.is_empty() {
        return Err(StoreError::invalid("agent must not be empty"));
    }
    let ttl = clamp_ttl_minutes(ttl_minutes);

    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        for _ in 0..SELECT_CLAIM_ATTEMPTS {
            let Some(candidate) =
                tasks::select_next_pending(&mut tx, agent, project_id, now).await?
            else {
                return Ok(None);
            };

            let refresh = holds_live_claim(&candidate, agent, now);
            let expires_at = now + TimeDelta::minutes(ttl);
            let Some(claimed) = leases::cas_claim(
                &mut tx,
                &candidate.id,
                agent,
                expires_at,
                !refresh,
                candidate.version,
                now,
            )
            .await?
            else {
                // Lost the CAS; pick again.
                continue;
            };

            let rows = tasks::cas_set_status(
                &mut tx,
                &claimed.id,
                TaskStatus::InProgress,
                None,
                claimed.version,
                now,
            )
            .await?;
            if rows == 0 {
                return Err(StoreError::VersionConflict {
                    task_id: claimed.id.clone(),
                    expected: claimed.version,
                });
            }

            let claim_message = format!("agent {agent} claimed task {}", claimed.id);
            let claim_event = events::insert_event(
                &mut tx,
                &NewEvent {
                    kind: EventKind::TaskClaimed,
                    task_id: Some(&claimed.id),
                    project_id: claimed.project_id.as_deref(),
                    metadata: Some(serde_json::json!({
                        "ttl_minutes": ttl,
                        "attempt": claimed.attempt,
                    })),
                    ..NewEvent::new(EventKind::TaskClaimed, agent, &claim_message, now)
                },
            )
            .await?;

            let status_message = format!("task {} status pending -> in_progress", claimed.id);
            let status_event = events::insert_event(
                &mut tx,
                &NewEvent {
                    kind: EventKind::TaskStatus,
                    task_id: Some(&claimed.id),
                    project_id: claimed.project_id.as_deref(),
                    metadata: Some(serde_json::json!({
                        "from": TaskStatus::Pending,
                        "to": TaskStatus::InProgress,
                    })),
                    ..NewEvent::new(EventKind::TaskStatus, agent, &status_message, now)
                },
            )
            .await?;

            let focus_message = format!("agent {agent} focused on task {}", claimed.id);
            let focus_event = events::insert_event(
                &mut tx,
                &NewEvent {
                    kind: EventKind::AgentFocus,
                    task_id: Some(&claimed.id),
                    project_id: claimed.project_id.as_deref(),
                    ..NewEvent::new(EventKind::AgentFocus, agent, &focus_message, now)
                },
            )
            .await?;
            agent_state::upsert_focus(
                &mut tx,
                agent,
                Some(&claimed.id),
                claimed.project_id.as_deref(),
                now,
            )
            .await?;

            tx.commit().await?;
            debug!(task_id = %claimed.id, agent = %agent, "claimed next task");
            return Ok(Some(ClaimNextOutcome {
                task_id: claimed.id,
                status_event_id: status_event.id,
                focus_event_id: focus_event.id,
                claim_event_id: claim_event.id,
            }));
        }

        Ok(None)
    })
    .await
}
