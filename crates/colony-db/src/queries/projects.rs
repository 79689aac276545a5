//! Database query functions for the `projects` table.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::models::Project;

/// Insert a new project row.
pub async fn insert_project(
    conn: &mut SqliteConnection,
    id: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (id, name, created_at) VALUES (?, ?, ?) RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(project)
}

/// Fetch a project by ID.
pub async fn get_project(conn: &mut SqliteConnection, id: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(project)
}

/// List all projects, newest first.
pub async fn list_projects(conn: &mut SqliteConnection) -> Result<Vec<Project>> {
    let projects =
        sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at DESC")
            .fetch_all(&mut *conn)
            .await?;

    Ok(projects)
}

/// Delete a project row. Returns affected rows.
pub async fn delete_project(conn: &mut SqliteConnection, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}
