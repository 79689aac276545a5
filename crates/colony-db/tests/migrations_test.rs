//! Integration tests for database migrations and connection pooling.
//!
//! Each test creates a unique temporary SQLite database (via
//! colony-test-utils), runs migrations, and lets the temp-dir guard delete
//! it on completion so tests are fully isolated and idempotent.

use colony_db::pool;

use colony_test_utils::create_test_db;

/// Expected tables created by the initial migration.
const EXPECTED_TABLES: &[&str] = &[
    "agent_state",
    "events",
    "projects",
    "retrospective_jobs",
    "task_dependencies",
    "tasks",
];

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, _guard) = create_test_db().await;

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .expect("should list tables");

    let user_tables: Vec<&str> = rows
        .iter()
        .map(|(name,)| name.as_str())
        .filter(|t| !t.starts_with("_sqlx"))
        .collect();

    assert_eq!(
        user_tables, EXPECTED_TABLES,
        "migration should create exactly the expected tables"
    );

    pool.close().await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, _guard) = create_test_db().await;

    // create_test_db already ran migrations once; a second run should be a
    // no-op.
    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("second migration run should succeed (idempotent)");

    for table in EXPECTED_TABLES {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("failed to count {table}: {e}"));
        assert_eq!(count.0, 0, "table {table} should be empty after migrations");
    }

    pool.close().await;
}

#[tokio::test]
async fn pool_creates_and_destroys_cleanly() {
    let (pool, _guard) = create_test_db().await;

    let one: (i32,) = sqlx::query_as("SELECT 1")
        .fetch_one(&pool)
        .await
        .expect("simple query should work");
    assert_eq!(one.0, 1);

    pool.close().await;
}

#[tokio::test]
async fn unique_indexes_are_present() {
    let (pool, _guard) = create_test_db().await;

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'index' ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .expect("should list indexes");

    let names: Vec<&str> = rows.iter().map(|(name,)| name.as_str()).collect();
    assert!(names.contains(&"idx_events_agent_request"));
    assert!(names.contains(&"idx_retro_agent_session"));
    assert!(names.contains(&"idx_tasks_status_priority"));

    pool.close().await;
}
