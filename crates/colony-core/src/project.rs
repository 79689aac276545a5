//! Project namespaces.
//!
//! Projects soft-scope tasks, events, and agent focus. Deletion nulls
//! every reference and removes the row inside one transaction; nothing
//! else is deleted with it.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use colony_db::error::{Result, StoreError};
use colony_db::ids;
use colony_db::models::Project;
use colony_db::queries::{agent_state, events, projects, tasks};
use colony_db::txn;

/// Create a new project.
pub async fn create_project(pool: &SqlitePool, name: &str) -> Result<Project> {
    if name.is_empty() {
        return Err(StoreError::invalid("name must not be empty"));
    }

    let id = ids::new_id(ids::PROJECT_PREFIX);
    let id = id.as_str();
    txn::with_retry(|| async move {
        let mut conn = pool.acquire().await?;
        projects::insert_project(&mut conn, id, name, Utc::now()).await
    })
    .await
}

/// Fetch a project by ID.
pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Project> {
    let mut conn = pool.acquire().await?;
    projects::get_project(&mut conn, id)
        .await?
        .ok_or_else(|| StoreError::not_found("project", id))
}

/// List all projects, newest first.
pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let mut conn = pool.acquire().await?;
    projects::list_projects(&mut conn).await
}

/// Delete a project.
///
/// Clears `project_id` on tasks and events and `focus_project_id` on
/// agent state, then removes the project row. Fails with `NotFound` when
/// no such project exists.
pub async fn delete_project(pool: &SqlitePool, id: &str) -> Result<()> {
    txn::with_retry(|| async move {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        projects::get_project(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::not_found("project", id))?;

        let tasks_cleared = tasks::clear_project_refs(&mut tx, id, now).await?;
        let events_cleared = events::clear_project_refs(&mut tx, id).await?;
        let agents_cleared = agent_state::clear_project_refs(&mut tx, id, now).await?;
        projects::delete_project(&mut tx, id).await?;

        tx.commit().await?;
        info!(
            project_id = %id,
            tasks_cleared,
            events_cleared,
            agents_cleared,
            "deleted project"
        );
        Ok(())
    })
    .await
}
