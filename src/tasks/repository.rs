//! Task and execution persistence.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{ExecutionStatus, Task, TaskExecution, TaskStatus};

const TASK_COLUMNS: &str =
    "id, body, status, agent_id, repository, mount_point, created_at, updated_at";
const EXECUTION_COLUMNS: &str = "id, task_id, status, created_at, updated_at";

/// Repository for the task delegation surface.
#[derive(Debug, Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new task.
    pub async fn create(
        &self,
        body: &str,
        status: TaskStatus,
        agent_id: Option<&str>,
        repository: Option<&str>,
        mount_point: Option<&str>,
    ) -> Result<Task> {
        let now = Utc::now().to_rfc3339();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            status,
            agent_id: agent_id.map(str::to_string),
            repository: repository.map(str::to_string),
            mount_point: mount_point.map(str::to_string),
            created_at: now.clone(),
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO tasks (id, body, status, agent_id, repository, mount_point, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.body)
        .bind(task.status.to_string())
        .bind(&task.agent_id)
        .bind(&task.repository)
        .bind(&task.mount_point)
        .bind(&task.created_at)
        .bind(&task.updated_at)
        .execute(&self.pool)
        .await
        .context("creating task")?;

        Ok(task)
    }

    /// Get a task by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching task")?;

        Ok(task)
    }

    /// Paginated task listing, newest first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>> {
        let tasks = match status {
            Some(status) => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(status.to_string())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("listing tasks")?;

        Ok(tasks)
    }

    /// Total tasks, optionally filtered by status.
    pub async fn count(&self, status: Option<TaskStatus>) -> Result<i64> {
        let (count,): (i64,) = match status {
            Some(status) => {
                sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = ?")
                    .bind(status.to_string())
                    .fetch_one(&self.pool)
                    .await
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM tasks")
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .context("counting tasks")?;

        Ok(count)
    }

    /// Insert a pending execution for a task.
    pub async fn create_execution(&self, task_id: &str) -> Result<TaskExecution> {
        let now = Utc::now().to_rfc3339();
        let execution = TaskExecution {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            status: ExecutionStatus::Pending,
            created_at: now.clone(),
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO task_executions (id, task_id, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&execution.id)
        .bind(&execution.task_id)
        .bind(execution.status.to_string())
        .bind(&execution.created_at)
        .bind(&execution.updated_at)
        .execute(&self.pool)
        .await
        .context("creating execution")?;

        Ok(execution)
    }

    /// Latest execution for a task, if any.
    pub async fn latest_execution(&self, task_id: &str) -> Result<Option<TaskExecution>> {
        let execution = sqlx::query_as::<_, TaskExecution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions \
             WHERE task_id = ? ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching latest execution")?;

        Ok(execution)
    }
}
