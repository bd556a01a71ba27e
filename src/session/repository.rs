//! Session database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{SessionStatus, TerminalSession};

const SESSION_COLUMNS: &str = "id, name, owner_user_id, project_id, parent_id, relation_type, \
     status, container_name, created_at, updated_at";

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new session.
    pub async fn create(&self, session: &TerminalSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, name, owner_user_id, project_id, parent_id, relation_type,
                status, container_name, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.owner_user_id)
        .bind(&session.project_id)
        .bind(&session.parent_id)
        .bind(&session.relation_type)
        .bind(session.status.to_string())
        .bind(&session.container_name)
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<TerminalSession>> {
        let session = sqlx::query_as::<_, TerminalSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    /// Find a user's active (starting/running) session within a project.
    pub async fn find_active_for_user(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<TerminalSession>> {
        let session = sqlx::query_as::<_, TerminalSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE id = ? AND owner_user_id = ? AND status IN ('starting', 'running')"
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching active session")?;

        Ok(session)
    }

    /// List sessions in a project with live-ish statuses, newest first.
    ///
    /// When `owner_filter` is set, only that user's sessions are returned
    /// (non-shared projects).
    pub async fn list_live_for_project(
        &self,
        project_id: &str,
        owner_filter: Option<&str>,
    ) -> Result<Vec<TerminalSession>> {
        let sessions = match owner_filter {
            Some(owner) => {
                sqlx::query_as::<_, TerminalSession>(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE project_id = ? AND owner_user_id = ? \
                       AND status IN ('running', 'pending', 'starting') \
                     ORDER BY created_at DESC"
                ))
                .bind(project_id)
                .bind(owner)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, TerminalSession>(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE project_id = ? \
                       AND status IN ('running', 'pending', 'starting') \
                     ORDER BY created_at DESC"
                ))
                .bind(project_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("listing project sessions")?;

        Ok(sessions)
    }

    /// List all sessions recorded as active (starting/running).
    pub async fn list_active(&self) -> Result<Vec<TerminalSession>> {
        let sessions = sqlx::query_as::<_, TerminalSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE status IN ('starting', 'running') ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing active sessions")?;

        Ok(sessions)
    }

    /// List sessions belonging to a project.
    pub async fn list_for_project(&self, project_id: &str) -> Result<Vec<TerminalSession>> {
        let sessions = sqlx::query_as::<_, TerminalSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE project_id = ? ORDER BY created_at DESC"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("listing project sessions")?;

        Ok(sessions)
    }

    /// IDs of sessions whose parent is the given session (fork/stack
    /// children).
    pub async fn list_descendant_ids(&self, id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM sessions WHERE parent_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .context("listing descendant sessions")?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Update status and container name in one write.
    pub async fn mark_running(&self, id: &str, container_name: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = 'running', container_name = ?, updated_at = ? WHERE id = ?",
        )
        .bind(container_name)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session running")?;

        Ok(())
    }

    /// Update session status.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        Ok(())
    }

    /// Delete a session.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(())
    }
}
