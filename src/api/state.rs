//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::ApiKeys;
use crate::git::GitWorkspace;
use crate::github::GithubClient;
use crate::project::ProjectRepository;
use crate::session::SessionService;
use crate::tasks::{JobQueue, TaskRepository};

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session service for managing container lifecycles.
    pub sessions: Arc<SessionService>,
    /// Project store.
    pub projects: ProjectRepository,
    /// Task store.
    pub tasks: TaskRepository,
    /// Background job queue (enqueue only).
    pub queue: Arc<dyn JobQueue>,
    /// Git workspace service.
    pub git: GitWorkspace,
    /// GitHub access checks.
    pub github: GithubClient,
    /// Bearer keys for the task delegation surface.
    pub api_keys: ApiKeys,
}
