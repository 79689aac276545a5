//! Integration tests for the close pipeline: validation, the status CAS,
//! dependent unblocking, and the journaled outcome.

use sqlx::SqlitePool;

use colony_core::close::{self, CloseTaskRequest};
use colony_core::registry::{self, CreateTaskRequest};
use colony_core::{StoreError, graph, journal};
use colony_db::models::{EventKind, Task, TaskStatus};
use colony_db::queries::events::EventFilter;

use colony_test_utils::create_test_db;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

async fn make_task(pool: &SqlitePool, title: &str) -> Task {
    registry::create_task(
        pool,
        &CreateTaskRequest {
            agent: "tester",
            title,
            description: "",
            project_id: None,
            priority: 0,
        },
    )
    .await
    .expect("create task should succeed")
}

fn close_request<'a>(task_id: &'a str, status: TaskStatus, summary: &'a str) -> CloseTaskRequest<'a> {
    CloseTaskRequest {
        agent: "closer",
        task_id,
        status,
        summary,
        label: None,
        blocked_reason: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_completed_updates_status_and_journals() {
    let (pool, _guard) = create_test_db().await;

    let task = make_task(&pool, "finishable").await;
    let result = close::close_task(
        &pool,
        &CloseTaskRequest {
            label: Some("shipped"),
            ..close_request(&task.id, TaskStatus::Completed, "all done")
        },
    )
    .await
    .expect("close should succeed");

    let closed = registry::get_task(&pool, &task.id).await.expect("get task");
    assert_eq!(closed.status, TaskStatus::Completed);
    assert_eq!(closed.version, 2);

    // Both events landed, in order.
    assert!(result.close_event_id > result.status_event_id);

    let closed_events = journal::list_events(
        &pool,
        &EventFilter {
            kind: Some(EventKind::TaskClosed),
            ..Default::default()
        },
    )
    .await
    .expect("list closed events");
    assert_eq!(closed_events.len(), 1);
    let meta = closed_events[0].metadata_value().expect("metadata");
    assert_eq!(meta["outcome"], "completed");
    assert_eq!(meta["summary"], "all done");
    assert_eq!(meta["label"], "shipped");
}

#[tokio::test]
async fn label_is_omitted_when_absent() {
    let (pool, _guard) = create_test_db().await;

    let task = make_task(&pool, "unlabelled").await;
    close::close_task(&pool, &close_request(&task.id, TaskStatus::Completed, "done"))
        .await
        .expect("close");

    let closed_events = journal::list_events(
        &pool,
        &EventFilter {
            kind: Some(EventKind::TaskClosed),
            ..Default::default()
        },
    )
    .await
    .expect("list closed events");
    let meta = closed_events[0].metadata_value().expect("metadata");
    assert!(meta.get("label").is_none());
}

#[tokio::test]
async fn close_completed_unblocks_dependents() {
    let (pool, _guard) = create_test_db().await;

    let a = make_task(&pool, "a").await;
    let b = make_task(&pool, "b").await;
    graph::add_dependency(&pool, &b.id, &a.id)
        .await
        .expect("add dependency");

    close::close_task(&pool, &close_request(&a.id, TaskStatus::Completed, "done"))
        .await
        .expect("close a");

    let released = registry::get_task(&pool, &b.id).await.expect("get b");
    assert_eq!(released.status, TaskStatus::Pending);
    assert!(released.blocked_reason.is_none());
}

#[tokio::test]
async fn close_blocked_stores_reason() {
    let (pool, _guard) = create_test_db().await;

    let task = make_task(&pool, "stuck").await;
    close::close_task(
        &pool,
        &CloseTaskRequest {
            blocked_reason: Some("failure:flaky_tests"),
            ..close_request(&task.id, TaskStatus::Blocked, "tests keep failing")
        },
    )
    .await
    .expect("close blocked");

    let parked = registry::get_task(&pool, &task.id).await.expect("get task");
    assert_eq!(parked.status, TaskStatus::Blocked);
    assert_eq!(parked.blocked_reason.as_deref(), Some("failure:flaky_tests"));
}

#[tokio::test]
async fn close_blocked_with_empty_reason_clears_stale_one() {
    let (pool, _guard) = create_test_db().await;

    let task = make_task(&pool, "re-stuck").await;
    close::close_task(
        &pool,
        &CloseTaskRequest {
            blocked_reason: Some("failure:first"),
            ..close_request(&task.id, TaskStatus::Blocked, "first failure")
        },
    )
    .await
    .expect("first close");

    close::close_task(
        &pool,
        &CloseTaskRequest {
            blocked_reason: Some(""),
            ..close_request(&task.id, TaskStatus::Blocked, "second failure")
        },
    )
    .await
    .expect("second close");

    let parked = registry::get_task(&pool, &task.id).await.expect("get task");
    assert_eq!(parked.status, TaskStatus::Blocked);
    assert!(
        parked.blocked_reason.is_none(),
        "an empty provided reason clears the stale one"
    );
}

#[tokio::test]
async fn invalid_close_arguments_are_rejected() {
    let (pool, _guard) = create_test_db().await;

    let task = make_task(&pool, "validated").await;

    let bad_status =
        close::close_task(&pool, &close_request(&task.id, TaskStatus::Pending, "nope")).await;
    assert!(matches!(bad_status, Err(StoreError::InvalidArgument(_))));

    let no_summary =
        close::close_task(&pool, &close_request(&task.id, TaskStatus::Completed, "")).await;
    assert!(matches!(no_summary, Err(StoreError::InvalidArgument(_))));

    let no_agent = close::close_task(
        &pool,
        &CloseTaskRequest {
            agent: "",
            ..close_request(&task.id, TaskStatus::Completed, "done")
        },
    )
    .await;
    assert!(matches!(no_agent, Err(StoreError::InvalidArgument(_))));

    let missing =
        close::close_task(&pool, &close_request("task_missing", TaskStatus::Completed, "x")).await;
    assert!(matches!(missing, Err(StoreError::NotFound { .. })));

    // Nothing was journaled by the rejected calls.
    let events = journal::list_events(
        &pool,
        &EventFilter {
            kind: Some(EventKind::TaskClosed),
            ..Default::default()
        },
    )
    .await
    .expect("list events");
    assert!(events.is_empty());
}

#[tokio::test]
async fn version_advances_through_close() {
    let (pool, _guard) = create_test_db().await;

    let a = make_task(&pool, "a").await;
    let b = make_task(&pool, "b").await;
    graph::add_dependency(&pool, &b.id, &a.id)
        .await
        .expect("add dependency");
    let blocked = registry::get_task(&pool, &b.id).await.expect("get b");
    assert_eq!(blocked.version, 2, "blocking bumped the version");

    close::close_task(&pool, &close_request(&a.id, TaskStatus::Completed, "done"))
        .await
        .expect("close a");

    let released = registry::get_task(&pool, &b.id).await.expect("get b");
    assert_eq!(released.version, 3, "unblocking bumped the version again");
}
