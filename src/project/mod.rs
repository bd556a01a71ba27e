//! Project model and repository.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A project grouping terminal sessions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub folder: String,
    pub owner_user_id: String,
    pub shared: bool,
    pub default_agent_id: Option<String>,
    pub created_at: String,
}

impl Project {
    /// Access rule: the owner always; any authenticated user if shared.
    pub fn accessible_by(&self, user_id: &str) -> bool {
        self.shared || self.owner_user_id == user_id
    }
}

/// Repository for project persistence.
#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, folder, owner_user_id, shared, default_agent_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.folder)
        .bind(&project.owner_user_id)
        .bind(project.shared)
        .bind(&project.default_agent_id)
        .bind(&project.created_at)
        .execute(&self.pool)
        .await
        .context("creating project")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            "SELECT id, name, folder, owner_user_id, shared, default_agent_id, created_at \
             FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching project")?;

        Ok(project)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting project")?;

        Ok(())
    }
}
