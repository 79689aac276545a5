//! Integration tests for the retrospective queue: enqueue clamping and
//! dedup, lease-based claiming, and the terminal state machine.

use chrono::{TimeDelta, Utc};
use sqlx::SqlitePool;

use colony_core::retro::{self, EnqueueRequest};
use colony_core::StoreError;
use colony_db::models::RetroStatus;

use colony_test_utils::create_test_db;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn enqueue_request<'a>(session_id: Option<&'a str>) -> EnqueueRequest<'a> {
    EnqueueRequest {
        agent_name: "claude",
        project_id: None,
        session_id,
        since_event_id: 10,
        until_event_id: 20,
        max_attempts: 5,
    }
}

async fn make_due_again(pool: &SqlitePool, job_id: &str) {
    sqlx::query("UPDATE retrospective_jobs SET next_run_at = ? WHERE id = ?")
        .bind(Utc::now() - TimeDelta::seconds(1))
        .bind(job_id)
        .execute(pool)
        .await
        .expect("should rewind next_run_at");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_starts_queued_and_due() {
    let (pool, _guard) = create_test_db().await;

    let job = retro::enqueue(&pool, &enqueue_request(Some("sess-1")))
        .await
        .expect("enqueue should succeed");

    assert!(job.id.starts_with("retro_"));
    assert_eq!(job.status, RetroStatus::Queued);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.max_attempts, 5);
    assert_eq!(job.since_event_id, 10);
    assert_eq!(job.until_event_id, 20);
    assert!(job.claimed_by.is_none());
    assert!(job.completed_at.is_none());
}

#[tokio::test]
async fn enqueue_clamps_ranges_and_defaults() {
    let (pool, _guard) = create_test_db().await;

    // Negative bounds clamp to zero; an inverted range is raised.
    let job = retro::enqueue(
        &pool,
        &EnqueueRequest {
            agent_name: "claude",
            project_id: None,
            session_id: None,
            since_event_id: -5,
            until_event_id: -10,
            max_attempts: 0,
        },
    )
    .await
    .expect("enqueue");
    assert_eq!(job.since_event_id, 0);
    assert_eq!(job.until_event_id, 0);
    assert_eq!(job.max_attempts, 5, "non-positive budget takes the default");

    let job = retro::enqueue(
        &pool,
        &EnqueueRequest {
            agent_name: "claude",
            project_id: None,
            session_id: None,
            since_event_id: 30,
            until_event_id: 20,
            max_attempts: 3,
        },
    )
    .await
    .expect("enqueue");
    assert_eq!(job.since_event_id, 30);
    assert_eq!(job.until_event_id, 30, "until is raised to since");
}

#[tokio::test]
async fn enqueue_dedups_per_session() {
    let (pool, _guard) = create_test_db().await;

    let first = retro::enqueue(&pool, &enqueue_request(Some("sess-1")))
        .await
        .expect("first enqueue");

    // A replay with a different range still returns the original job.
    let replay = retro::enqueue(
        &pool,
        &EnqueueRequest {
            since_event_id: 99,
            until_event_id: 100,
            ..enqueue_request(Some("sess-1"))
        },
    )
    .await
    .expect("replay enqueue");
    assert_eq!(replay.id, first.id);
    assert_eq!(replay.since_event_id, 10);
    assert_eq!(replay.until_event_id, 20);

    // Different session or agent gets a fresh job.
    let other_session = retro::enqueue(&pool, &enqueue_request(Some("sess-2")))
        .await
        .expect("other session");
    assert_ne!(other_session.id, first.id);

    let other_agent = retro::enqueue(
        &pool,
        &EnqueueRequest {
            agent_name: "codex",
            ..enqueue_request(Some("sess-1"))
        },
    )
    .await
    .expect("other agent");
    assert_ne!(other_agent.id, first.id);
}

#[tokio::test]
async fn empty_sessions_do_not_dedup() {
    let (pool, _guard) = create_test_db().await;

    let first = retro::enqueue(&pool, &enqueue_request(Some(""))).await.expect("first");
    let second = retro::enqueue(&pool, &enqueue_request(None)).await.expect("second");
    assert_ne!(first.id, second.id);
    assert!(first.session_id.is_none(), "empty session is stored as null");
}

#[tokio::test]
async fn claim_runs_oldest_due_job_under_lease() {
    let (pool, _guard) = create_test_db().await;

    let job = retro::enqueue(&pool, &enqueue_request(Some("sess-1")))
        .await
        .expect("enqueue");

    let claimed = retro::claim_next_job(&pool, "worker-1", 120)
        .await
        .expect("claim should succeed")
        .expect("a job should be due");
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, RetroStatus::Running);
    assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));
    assert_eq!(claimed.attempt, 1);
    assert!(claimed.claim_expires_at.is_some());

    // A running job is not claimable again while its lease lives.
    let none = retro::claim_next_job(&pool, "worker-2", 120)
        .await
        .expect("claim");
    assert!(none.is_none());
}

#[tokio::test]
async fn lease_seconds_are_clamped() {
    let (pool, _guard) = create_test_db().await;

    retro::enqueue(&pool, &enqueue_request(None)).await.expect("enqueue");
    let claimed = retro::claim_next_job(&pool, "worker-1", 0)
        .await
        .expect("claim")
        .expect("job due");
    let held = claimed.claim_expires_at.unwrap() - claimed.updated_at;
    assert_eq!(held, TimeDelta::seconds(60), "non-positive lease defaults");

    retro::enqueue(&pool, &enqueue_request(None)).await.expect("enqueue");
    let claimed = retro::claim_next_job(&pool, "worker-1", 50_000)
        .await
        .expect("claim")
        .expect("job due");
    let held = claimed.claim_expires_at.unwrap() - claimed.updated_at;
    assert_eq!(held, TimeDelta::seconds(3600), "oversized lease clamps");
}

#[tokio::test]
async fn expired_worker_lease_is_reclaimable() {
    let (pool, _guard) = create_test_db().await;

    let job = retro::enqueue(&pool, &enqueue_request(Some("sess-1")))
        .await
        .expect("enqueue");
    retro::claim_next_job(&pool, "worker-1", 60)
        .await
        .expect("claim")
        .expect("job due");

    // Worker 1 died; its lease lapses and the job goes back to retry.
    sqlx::query(
        "UPDATE retrospective_jobs SET status = 'retry', claim_expires_at = ?, next_run_at = ? \
         WHERE id = ?",
    )
    .bind(Utc::now() - TimeDelta::seconds(30))
    .bind(Utc::now() - TimeDelta::seconds(30))
    .bind(&job.id)
    .execute(&pool)
    .await
    .expect("simulate lapsed worker");

    let reclaimed = retro::claim_next_job(&pool, "worker-2", 60)
        .await
        .expect("claim")
        .expect("job reclaimable");
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.claimed_by.as_deref(), Some("worker-2"));
    assert_eq!(reclaimed.attempt, 2);
}

#[tokio::test]
async fn succeed_is_terminal() {
    let (pool, _guard) = create_test_db().await;

    let job = retro::enqueue(&pool, &enqueue_request(Some("sess-1")))
        .await
        .expect("enqueue");
    retro::claim_next_job(&pool, "worker-1", 60)
        .await
        .expect("claim")
        .expect("job due");

    let done = retro::mark_succeeded(&pool, &job.id).await.expect("succeed");
    assert_eq!(done.status, RetroStatus::Succeeded);
    assert!(done.completed_at.is_some());
    assert!(done.claimed_by.is_none());
    assert!(done.last_error.is_none());

    // Terminal jobs are never due again.
    make_due_again(&pool, &job.id).await;
    let none = retro::claim_next_job(&pool, "worker-2", 60).await.expect("claim");
    assert!(none.is_none());
}

#[tokio::test]
async fn retry_parks_with_backoff_and_truncated_error() {
    let (pool, _guard) = create_test_db().await;

    let job = retro::enqueue(&pool, &enqueue_request(Some("sess-1")))
        .await
        .expect("enqueue");
    retro::claim_next_job(&pool, "worker-1", 60)
        .await
        .expect("claim")
        .expect("job due");

    let huge_error = "e".repeat(5000);
    let parked = retro::mark_retry(&pool, &job.id, &huge_error, 300)
        .await
        .expect("retry");
    assert_eq!(parked.status, RetroStatus::Retry);
    assert!(parked.claimed_by.is_none());
    assert!(parked.completed_at.is_none());
    assert_eq!(parked.last_error.as_ref().map(String::len), Some(2048));
    assert!(parked.next_run_at > Utc::now() + TimeDelta::seconds(200));

    // Not due until the backoff passes.
    let none = retro::claim_next_job(&pool, "worker-1", 60).await.expect("claim");
    assert!(none.is_none());

    make_due_again(&pool, &job.id).await;
    let reclaimed = retro::claim_next_job(&pool, "worker-1", 60)
        .await
        .expect("claim")
        .expect("job due again");
    assert_eq!(reclaimed.attempt, 2);
}

#[tokio::test]
async fn exhausted_attempts_escalate_to_dead() {
    let (pool, _guard) = create_test_db().await;

    let job = retro::enqueue(
        &pool,
        &EnqueueRequest {
            max_attempts: 2,
            ..enqueue_request(Some("sess-1"))
        },
    )
    .await
    .expect("enqueue");

    for round in 1..=2 {
        make_due_again(&pool, &job.id).await;
        let claimed = retro::claim_next_job(&pool, "worker-1", 60)
            .await
            .expect("claim")
            .expect("job due");
        assert_eq!(claimed.attempt, round);
        let parked = retro::mark_retry(&pool, &job.id, "still broken", 1)
            .await
            .expect("retry");
        if round < 2 {
            assert_eq!(parked.status, RetroStatus::Retry);
        } else {
            assert_eq!(parked.status, RetroStatus::Dead, "budget exhausted");
            assert_eq!(parked.last_error.as_deref(), Some("still broken"));
        }
    }

    make_due_again(&pool, &job.id).await;
    let none = retro::claim_next_job(&pool, "worker-1", 60).await.expect("claim");
    assert!(none.is_none(), "dead jobs are terminal");
}

#[tokio::test]
async fn mark_dead_is_terminal_failure() {
    let (pool, _guard) = create_test_db().await;

    let job = retro::enqueue(&pool, &enqueue_request(Some("sess-1")))
        .await
        .expect("enqueue");
    retro::claim_next_job(&pool, "worker-1", 60)
        .await
        .expect("claim")
        .expect("job due");

    let dead = retro::mark_dead(&pool, &job.id, "unrecoverable").await.expect("dead");
    assert_eq!(dead.status, RetroStatus::Dead);
    assert!(dead.claimed_by.is_none());
    assert_eq!(dead.last_error.as_deref(), Some("unrecoverable"));
}

#[tokio::test]
async fn unknown_job_ids_are_not_found() {
    let (pool, _guard) = create_test_db().await;

    let result = retro::mark_succeeded(&pool, "retro_missing").await;
    assert!(matches!(result, Err(StoreError::NotFound { .. })));
    let result = retro::mark_retry(&pool, "retro_missing", "err", 1).await;
    assert!(matches!(result, Err(StoreError::NotFound { .. })));
    let result = retro::mark_dead(&pool, "retro_missing", "err").await;
    assert!(matches!(result, Err(StoreError::NotFound { .. })));
}
