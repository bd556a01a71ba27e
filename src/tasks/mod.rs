//! Task delegation surface: models, repository and the enqueue interface.
//!
//! Only the enqueue side of the background job queue is in scope; the
//! execution machinery is an external collaborator.

mod repository;

pub use repository::TaskRepository;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Known agent ids, matching the per-user state directory layout.
pub const KNOWN_AGENTS: &[&str] = &["claude", "codex", "cursor"];

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
    Canceled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Todo => write!(f, "todo"),
            TaskStatus::Doing => write!(f, "doing"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "todo" => Ok(TaskStatus::Todo),
            "doing" => Ok(TaskStatus::Doing),
            "done" => Ok(TaskStatus::Done),
            "canceled" => Ok(TaskStatus::Canceled),
            _ => Err(format!("unknown task status: {}", s)),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NeedsInput,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::NeedsInput => write!(f, "needs_input"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "needs_input" => Ok(ExecutionStatus::NeedsInput),
            _ => Err(format!("unknown execution status: {}", s)),
        }
    }
}

impl TryFrom<String> for ExecutionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A delegated task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub body: String,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    pub repository: Option<String>,
    pub mount_point: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A single run of a task by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    #[sqlx(try_from = "String")]
    pub status: ExecutionStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Validate an agent id against the known set.
pub fn validate_agent_id(agent_id: &str) -> bool {
    KNOWN_AGENTS.contains(&agent_id)
}

/// Enqueue interface to the background job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Hand an execution to the queue. The execution row already exists in
    /// `pending` state.
    async fn enqueue(&self, execution: &TaskExecution) -> anyhow::Result<()>;
}

/// In-process queue stub: records the enqueue and leaves the execution
/// pending for an external worker to pick up.
#[derive(Debug, Clone, Default)]
pub struct InProcessQueue;

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn enqueue(&self, execution: &TaskExecution) -> anyhow::Result<()> {
        info!(
            "enqueued execution {} for task {}",
            execution.id, execution.task_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_validation() {
        assert!(validate_agent_id("claude"));
        assert!(validate_agent_id("codex"));
        assert!(validate_agent_id("cursor"));
        assert!(!validate_agent_id("hal9000"));
    }

    #[test]
    fn status_round_trips() {
        for status in ["todo", "doing", "done", "canceled"] {
            assert_eq!(status.parse::<TaskStatus>().unwrap().to_string(), status);
        }
        for status in ["pending", "running", "completed", "failed", "needs_input"] {
            assert_eq!(
                status.parse::<ExecutionStatus>().unwrap().to_string(),
                status
            );
        }
    }
}
