//! Shared test utilities for colony integration tests.
//!
//! Each test gets its own SQLite database file inside a temporary
//! directory, with migrations applied. The directory (and database) is
//! removed when the returned guard drops, so tests are fully isolated and
//! idempotent.

use sqlx::SqlitePool;
use tempfile::TempDir;

use colony_db::pool;

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, guard)`. Keep the guard alive for the duration of the
/// test; dropping it deletes the database.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = dir.path().join("colony.db");

    let pool = pool::connect(&db_path)
        .await
        .expect("failed to open test database");

    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (pool, dir)
}
