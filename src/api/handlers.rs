//! HTTP request handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Json, response::IntoResponse};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::session::StartOptions;
use crate::tasks::{Task, TaskExecution, TaskStatus, validate_agent_id};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    total: i64,
    limit: i64,
    offset: i64,
    has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    tasks: Vec<Task>,
    pagination: Pagination,
}

/// GET /api/tasks
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<TaskListResponse>> {
    let status = match query.status.as_deref() {
        Some(raw) if !raw.is_empty() => Some(
            raw.parse::<TaskStatus>()
                .map_err(|e| ApiError::bad_request(format!("invalid status filter: {e}")))?,
        ),
        _ => None,
    };

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let tasks = state.tasks.list(status, limit, offset).await?;
    let total = state.tasks.count(status).await?;

    Ok(Json(TaskListResponse {
        pagination: Pagination {
            total,
            limit,
            offset,
            has_more: offset + (tasks.len() as i64) < total,
        },
        tasks,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    body: Option<String>,
    agent_id: Option<String>,
    repository: Option<String>,
    /// Deprecated; kept for older clients.
    mount_point: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    task: Task,
    execution: Option<TaskExecution>,
}

/// POST /api/tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let body = match request.body.as_deref().map(str::trim) {
        Some(body) if !body.is_empty() => body.to_string(),
        _ => return Err(ApiError::bad_request("body is required")),
    };

    if let Some(ref agent_id) = request.agent_id
        && !validate_agent_id(agent_id)
    {
        return Err(ApiError::bad_request(format!(
            "invalid agentId '{agent_id}'"
        )));
    }

    // A cloned repository becomes the agent's /workspace.
    if let Some(ref repository) = request.repository {
        let path = state.git.clone_or_pull(repository).await?;
        info!("repository {} materialized at {}", repository, path);
    }

    let status = if request.agent_id.is_some() {
        TaskStatus::Doing
    } else {
        TaskStatus::Todo
    };

    let task = state
        .tasks
        .create(
            &body,
            status,
            request.agent_id.as_deref(),
            request.repository.as_deref(),
            request.mount_point.as_deref(),
        )
        .await?;

    let execution = if request.agent_id.is_some() {
        let execution = state.tasks.create_execution(&task.id).await?;
        if let Err(err) = state.queue.enqueue(&execution).await {
            warn!("enqueue of execution {} failed: {:#}", execution.id, err);
        }
        Some(execution)
    } else {
        None
    };

    Ok((StatusCode::CREATED, Json(TaskResponse { task, execution })))
}

/// GET /api/tasks/{task_id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let task = state
        .tasks
        .get(&task_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task not found: {task_id}")))?;

    let execution = state.tasks.latest_execution(&task_id).await?;

    Ok(Json(TaskResponse { task, execution }))
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct VerifyAccessRequest {
    repository: Option<String>,
}

/// POST /api/github/verify-access
pub async fn verify_github_access(
    State(state): State<AppState>,
    Json(request): Json<VerifyAccessRequest>,
) -> ApiResult<impl IntoResponse> {
    let repository = match request.repository.as_deref().map(str::trim) {
        Some(repo) if !repo.is_empty() => repo,
        _ => return Err(ApiError::bad_request("repository is required")),
    };

    let check = state.github.verify_access(repository).await;
    Ok(Json(check))
}

// ---------------------------------------------------------------------------
// Sessions & projects
// ---------------------------------------------------------------------------

/// POST /api/sessions/{session_id}/start
pub async fn start_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(opts): Json<StartOptions>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .sessions
        .repository()
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session not found: {session_id}")))?;

    let outcome = state
        .sessions
        .start(&session.owner_user_id, &session_id, opts)
        .await?;

    Ok(Json(outcome))
}

/// POST /api/sessions/{session_id}/stop
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.sessions.stop(&session_id).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct DeleteSessionQuery {
    #[serde(default)]
    confirm: bool,
}

/// DELETE /api/sessions/{session_id}
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<DeleteSessionQuery>,
) -> ApiResult<impl IntoResponse> {
    state.sessions.delete(&session_id, query.confirm).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/projects/{project_id}
///
/// Projects own their sessions: deletion cascade-stops them first.
pub async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let project = state
        .projects
        .get(&project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {project_id}")))?;

    state.sessions.stop_project_sessions(&project.id).await?;
    state.projects.delete(&project.id).await?;

    Ok(StatusCode::NO_CONTENT)
}
