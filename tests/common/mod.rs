//! Test utilities and common setup.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;

use open_commander::api::{self, AppState};
use open_commander::auth::ApiKeys;
use open_commander::broadcast::BroadcasterRegistry;
use open_commander::container::{
    ContainerDriver, DriverError, DriverResult, ExecOutput, RunSpec,
};
use open_commander::db::Database;
use open_commander::git::GitWorkspace;
use open_commander::github::GithubClient;
use open_commander::ingress::IngressCleanup;
use open_commander::mounts::{MountPlanner, MountPlannerConfig};
use open_commander::project::ProjectRepository;
use open_commander::session::{SessionRepository, SessionService, SessionServiceConfig};
use open_commander::tasks::{InProcessQueue, TaskRepository};

/// Bearer key accepted by test apps.
pub const TEST_API_KEY: &str = "test-key-for-integration-tests";

/// Recording fake for the container engine.
#[derive(Default)]
pub struct FakeDriver {
    /// Call log: operation name plus primary argument.
    pub calls: Mutex<Vec<String>>,
    /// Known containers and whether each is running.
    pub containers: Mutex<HashMap<String, bool>>,
    /// Scripted failures popped by successive `run` calls.
    pub run_failures: Mutex<VecDeque<DriverError>>,
    /// When set, `start` on an unknown name brings the container up anyway
    /// (models a racer having created it between probe and start).
    pub start_creates_missing: Mutex<bool>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(name))
            .count()
    }

    pub fn insert_container(&self, name: &str, running: bool) {
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), running);
    }

    pub fn script_run_failure(&self, err: DriverError) {
        self.run_failures.lock().unwrap().push_back(err);
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn run(&self, spec: &RunSpec) -> DriverResult<()> {
        self.record(format!("run:{}", spec.name));
        if let Some(err) = self.run_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.insert_container(&spec.name, true);
        Ok(())
    }

    async fn start(&self, name: &str) -> DriverResult<()> {
        self.record(format!("start:{name}"));
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(name) {
            Some(running) => {
                *running = true;
                Ok(())
            }
            None if *self.start_creates_missing.lock().unwrap() => {
                containers.insert(name.to_string(), true);
                Ok(())
            }
            None => Err(DriverError::CommandFailed {
                command: "start".to_string(),
                message: format!("Error: No such container: {name}"),
            }),
        }
    }

    async fn restart(&self, name: &str) -> DriverResult<()> {
        self.record(format!("restart:{name}"));
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(name) {
            Some(running) => {
                *running = true;
                Ok(())
            }
            None => Err(DriverError::CommandFailed {
                command: "restart".to_string(),
                message: format!("Error: No such container: {name}"),
            }),
        }
    }

    async fn stop(&self, name: &str, _timeout_seconds: Option<u32>) -> DriverResult<()> {
        self.record(format!("stop:{name}"));
        if let Some(running) = self.containers.lock().unwrap().get_mut(name) {
            *running = false;
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> DriverResult<Option<bool>> {
        Ok(self.containers.lock().unwrap().get(name).copied())
    }

    async fn exec(&self, name: &str, argv: &[&str]) -> DriverResult<ExecOutput> {
        self.record(format!("exec:{name}:{}", argv.join(" ")));
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn pull(&self, image: &str) -> DriverResult<()> {
        self.record(format!("pull:{image}"));
        Ok(())
    }

    async fn ensure_network(&self, name: &str, _internal: bool) -> DriverResult<()> {
        self.record(format!("network:{name}"));
        Ok(())
    }

    async fn safe_remove(&self, name: &str) -> DriverResult<()> {
        self.record(format!("rm:{name}"));
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Ingress cleanup stub that records invocations.
#[derive(Default)]
pub struct RecordingIngress {
    pub cleaned: Mutex<Vec<String>>,
}

#[async_trait]
impl IngressCleanup for RecordingIngress {
    async fn cleanup(&self, session_id: &str) -> anyhow::Result<()> {
        self.cleaned.lock().unwrap().push(session_id.to_string());
        Ok(())
    }
}

/// Temp directory scoped to a test.
pub fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("oc-test-{label}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_planner() -> MountPlanner {
    MountPlanner::new(MountPlannerConfig {
        state_root: temp_dir("state"),
        workspace_root: temp_dir("workspace"),
        certs_path: PathBuf::from("/etc/commander/certs"),
        egress_proxy_url: "http://oc-egress:3128".to_string(),
        docker_host: "tcp://oc-dind:2376".to_string(),
        github_token: None,
        terminal_argv: vec!["ttyd".to_string(), "bash".to_string()],
    })
}

/// Everything a session-flow test needs.
pub struct SessionHarness {
    pub service: SessionService,
    pub repo: SessionRepository,
    pub driver: Arc<FakeDriver>,
    pub ingress: Arc<RecordingIngress>,
    pub broadcaster: BroadcasterRegistry,
    pub db: Database,
}

/// Build a session service over an in-memory database and a fake engine.
pub async fn session_harness() -> SessionHarness {
    let db = Database::in_memory().await.unwrap();
    let repo = SessionRepository::new(db.pool().clone());
    let driver = Arc::new(FakeDriver::new());
    let ingress = Arc::new(RecordingIngress::default());
    let broadcaster = BroadcasterRegistry::new();

    let service = SessionService::new(
        repo.clone(),
        driver.clone(),
        test_planner(),
        ingress.clone(),
        broadcaster.clone(),
        SessionServiceConfig::default(),
    );

    SessionHarness {
        service,
        repo,
        driver,
        ingress,
        broadcaster,
        db,
    }
}

/// Create a test application with all services initialized.
pub async fn test_app() -> Router {
    let (app, _db) = test_app_with_db().await;
    app
}

/// Create a test application and keep the database handle alive.
pub async fn test_app_with_db() -> (Router, Database) {
    let db = Database::in_memory().await.unwrap();

    let session_repo = SessionRepository::new(db.pool().clone());
    let project_repo = ProjectRepository::new(db.pool().clone());
    let task_repo = TaskRepository::new(db.pool().clone());

    let driver = Arc::new(FakeDriver::new());
    let ingress = Arc::new(RecordingIngress::default());
    let broadcaster = BroadcasterRegistry::new();

    let session_service = SessionService::new(
        session_repo,
        driver,
        test_planner(),
        ingress,
        broadcaster,
        SessionServiceConfig::default(),
    );

    let state = AppState {
        sessions: Arc::new(session_service),
        projects: project_repo,
        tasks: task_repo,
        queue: Arc::new(InProcessQueue),
        git: GitWorkspace::new(temp_dir("git"), None),
        github: GithubClient::new(None).unwrap(),
        api_keys: ApiKeys::new(vec![TEST_API_KEY.to_string()]),
    };

    (api::create_router(state), db)
}
