//! Session service - reconciles session records with container state.
//!
//! `start` and `stop` are serialized per session id; `start` is idempotent
//! and recovers from name conflicts and image layer-lock contention, which
//! are the two failure modes a concurrent cold start produces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::broadcast::{BroadcasterRegistry, sessions_topic};
use crate::container::{ContainerDriver, DriverError, RunSpec};
use crate::ingress::IngressCleanup;
use crate::mounts::MountPlanner;

use super::models::{
    SessionStatus, StartOptions, StartOutcome, StopOutcome, container_name_for,
};
use super::repository::SessionRepository;

/// Retry budget for layer-lock contention during create.
const MAX_LAYER_RETRIES: u32 = 5;

/// Sleep between layer-lock retries.
const LAYER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Session service configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Agent container image.
    pub image: String,
    /// Name of the agent-internal network.
    pub network: String,
    /// Extra `host:ip` entries for agent containers.
    pub extra_hosts: Vec<String>,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            image: "open-commander/agent:latest".to_string(),
            network: "oc-agents".to_string(),
            extra_hosts: Vec::new(),
        }
    }
}

/// Service for managing session container lifecycles.
#[derive(Clone)]
pub struct SessionService {
    repo: SessionRepository,
    driver: Arc<dyn ContainerDriver>,
    planner: MountPlanner,
    ingress: Arc<dyn IngressCleanup>,
    broadcaster: BroadcasterRegistry,
    config: SessionServiceConfig,
    /// Per-session start/stop serialization.
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SessionService {
    pub fn new(
        repo: SessionRepository,
        driver: Arc<dyn ContainerDriver>,
        planner: MountPlanner,
        ingress: Arc<dyn IngressCleanup>,
        broadcaster: BroadcasterRegistry,
        config: SessionServiceConfig,
    ) -> Self {
        Self {
            repo,
            driver,
            planner,
            ingress,
            broadcaster,
            config,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start a session's container. Safe to call repeatedly; `reset` forces
    /// a restart even when the container is already up.
    pub async fn start(
        &self,
        user_id: &str,
        session_id: &str,
        opts: StartOptions,
    ) -> Result<StartOutcome> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        // Short-circuit: a start already in flight (or finished) for this
        // user wins.
        if !opts.reset
            && let Some(active) = self.repo.find_active_for_user(user_id, session_id).await?
            && let Some(container_name) = active.container_name
        {
            debug!(
                "session {} already {} with container {}",
                session_id, active.status, container_name
            );
            return Ok(StartOutcome { container_name });
        }

        let session = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| anyhow!("session not found: {session_id}"))?;

        if session.status == SessionStatus::Stopped {
            bail!("session not found: {session_id} is stopped");
        }

        let container_name = container_name_for(session_id);

        match self.driver.is_running(&container_name).await? {
            None => {
                self.repo
                    .update_status(session_id, SessionStatus::Starting)
                    .await?;
                self.notify_project(&session.project_id);

                if let Err(err) = self
                    .provision(user_id, &container_name, opts.workspace_suffix.as_deref())
                    .await
                {
                    self.repo
                        .update_status(session_id, SessionStatus::Error)
                        .await?;
                    self.notify_project(&session.project_id);
                    return Err(err);
                }
            }
            Some(false) if opts.reset => {
                self.driver
                    .restart(&container_name)
                    .await
                    .context("restarting container")?;
            }
            Some(false) => {
                self.driver
                    .start(&container_name)
                    .await
                    .context("starting container")?;
            }
            Some(true) if opts.reset => {
                self.driver
                    .restart(&container_name)
                    .await
                    .context("restarting running container")?;
            }
            Some(true) => {}
        }

        if self.driver.is_running(&container_name).await? != Some(true) {
            self.repo
                .update_status(session_id, SessionStatus::Error)
                .await?;
            self.notify_project(&session.project_id);
            bail!("container {container_name} is not running after start");
        }

        if let Some(ref branch) = opts.git_branch {
            self.checkout_branch(&container_name, branch).await;
        }

        self.repo.mark_running(session_id, &container_name).await?;
        self.notify_project(&session.project_id);

        info!("session {} running in {}", session_id, container_name);
        Ok(StartOutcome { container_name })
    }

    /// Build mounts and environment, ensure the network and image, then run
    /// the create loop.
    async fn provision(
        &self,
        user_id: &str,
        container_name: &str,
        workspace_suffix: Option<&str>,
    ) -> Result<()> {
        let plan = self
            .planner
            .plan(user_id, workspace_suffix)
            .context("planning mounts")?;

        self.driver
            .ensure_network(&self.config.network, true)
            .await
            .context("ensuring agent network")?;

        self.driver
            .pull(&self.config.image)
            .await
            .context("pulling agent image")?;

        let spec = RunSpec {
            name: container_name.to_string(),
            image: self.config.image.clone(),
            network: self.config.network.clone(),
            env: plan.env,
            mounts: plan.mounts,
            extra_hosts: self.config.extra_hosts.clone(),
            args: plan.args,
        };

        self.create_with_retry(&spec).await
    }

    /// Create loop: retries layer-lock contention, recovers name conflicts
    /// by starting or replacing the existing container.
    async fn create_with_retry(&self, spec: &RunSpec) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.driver.run(spec).await {
                Ok(()) => return Ok(()),
                Err(DriverError::NameConflict(msg)) => {
                    debug!("name conflict on {}: {}", spec.name, msg);
                    if self.driver.start(&spec.name).await.is_ok() {
                        return Ok(());
                    }
                    // The existing container won't start; replace it.
                    self.driver.safe_remove(&spec.name).await?;
                    self.driver
                        .ensure_network(&spec.network, true)
                        .await
                        .context("ensuring network after conflict")?;
                    self.driver
                        .run(spec)
                        .await
                        .context("re-running after conflict")?;
                    return Ok(());
                }
                Err(DriverError::LayerLocked(msg)) => {
                    if attempt >= MAX_LAYER_RETRIES {
                        bail!(
                            "image layers still locked after {} attempts: {}",
                            attempt,
                            msg
                        );
                    }
                    warn!(
                        "image layers locked (attempt {}/{}), retrying: {}",
                        attempt, MAX_LAYER_RETRIES, msg
                    );
                    tokio::time::sleep(LAYER_RETRY_DELAY).await;
                }
                Err(err) => return Err(err).context("creating container"),
            }
        }
    }

    /// Best-effort branch checkout inside the workspace mount.
    async fn checkout_branch(&self, container_name: &str, branch: &str) {
        match self
            .driver
            .exec(
                container_name,
                &["git", "-C", "/workspace", "checkout", branch],
            )
            .await
        {
            Ok(output) if output.exit_code == 0 => {
                debug!("checked out branch {} in {}", branch, container_name);
            }
            Ok(output) => {
                warn!(
                    "branch checkout of {} in {} failed: {}",
                    branch,
                    container_name,
                    output.stderr.trim()
                );
            }
            Err(err) => {
                warn!(
                    "branch checkout of {} in {} failed: {:#}",
                    branch, container_name, err
                );
            }
        }
    }

    /// Stop a session: clean up the ingress helper, remove the container,
    /// and record the new state.
    pub async fn stop(&self, session_id: &str) -> Result<StopOutcome> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let session = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| anyhow!("session not found: {session_id}"))?;

        let container_name = container_name_for(session_id);

        if let Err(err) = self.ingress.cleanup(session_id).await {
            warn!("ingress cleanup for {} failed: {:#}", session_id, err);
        }

        let outcome = match self.driver.is_running(&container_name).await? {
            // Nothing to remove.
            None => StopOutcome {
                removed: false,
                container_name: container_name.clone(),
                error: None,
            },
            Some(_) => {
                self.driver
                    .safe_remove(&container_name)
                    .await
                    .context("removing container")?;

                // Removal may return before the engine finishes; verify.
                if self.driver.is_running(&container_name).await?.is_some() {
                    StopOutcome {
                        removed: false,
                        container_name: container_name.clone(),
                        error: Some("container still exists after removal".to_string()),
                    }
                } else {
                    StopOutcome {
                        removed: true,
                        container_name: container_name.clone(),
                        error: None,
                    }
                }
            }
        };

        self.repo
            .update_status(session_id, SessionStatus::Stopped)
            .await?;
        self.notify_project(&session.project_id);

        info!("session {} stopped (removed={})", session_id, outcome.removed);
        Ok(outcome)
    }

    /// Delete a session record. Sessions with fork/stack descendants are
    /// only deleted when the caller confirms.
    pub async fn delete(&self, session_id: &str, confirm: bool) -> Result<()> {
        let session = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| anyhow!("session not found: {session_id}"))?;

        if session.is_active() {
            bail!("cannot delete active session, stop it first");
        }

        let descendants = self.repo.list_descendant_ids(session_id).await?;
        if !descendants.is_empty() && !confirm {
            bail!(
                "session has {} descendant session(s), deletion must be confirmed",
                descendants.len()
            );
        }

        self.repo.delete(session_id).await?;
        self.notify_project(&session.project_id);
        Ok(())
    }

    /// Stop every session of a project (project deletion / un-share).
    pub async fn stop_project_sessions(&self, project_id: &str) -> Result<()> {
        for session in self.repo.list_for_project(project_id).await? {
            if session.is_active()
                && let Err(err) = self.stop(&session.id).await
            {
                warn!(
                    "stopping session {} during project teardown failed: {:#}",
                    session.id, err
                );
            }
        }
        Ok(())
    }

    /// Reconcile recorded state with the engine on boot: sessions marked
    /// active whose container is gone become `stopped`.
    pub async fn startup_cleanup(&self) -> Result<usize> {
        let mut cleaned = 0;
        let mut touched: HashMap<String, ()> = HashMap::new();

        for session in self.repo.list_active().await? {
            let container_name = container_name_for(&session.id);
            match self.driver.is_running(&container_name).await {
                Ok(Some(true)) => {}
                Ok(_) => {
                    warn!(
                        "session {} recorded {} but container {} is gone, marking stopped",
                        session.id, session.status, container_name
                    );
                    self.repo
                        .update_status(&session.id, SessionStatus::Stopped)
                        .await?;
                    if let Some(pid) = session.project_id {
                        touched.insert(pid, ());
                    }
                    cleaned += 1;
                }
                Err(err) => {
                    warn!(
                        "probing container {} for session {} failed: {:#}",
                        container_name, session.id, err
                    );
                }
            }
        }

        for project_id in touched.into_keys() {
            self.broadcaster.notify(&sessions_topic(&project_id));
        }

        Ok(cleaned)
    }

    fn notify_project(&self, project_id: &Option<String>) {
        if let Some(pid) = project_id {
            self.broadcaster.notify(&sessions_topic(pid));
        }
    }
}
