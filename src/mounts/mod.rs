//! Mount planner for agent containers.
//!
//! Produces the ordered mount list, the environment map and the container
//! entrypoint for a given user. State directories are created on demand;
//! the workspace suffix is validated so a caller can never mount a path
//! outside the configured workspace root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::container::Mount;

/// Agent ids with per-user state directories under the state root.
pub const AGENT_STATE_DIRS: &[&str] = &["claude", "codex", "cursor"];

/// Target home directory inside the agent container.
const CONTAINER_HOME: &str = "/home/agent";

/// Where the inner daemon's client TLS material is mounted.
const CERTS_TARGET: &str = "/certs/client";

pub type MountResult<T> = Result<T, MountError>;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid workspace suffix: {0}")]
    InvalidSuffix(String),

    #[error("workspace directory does not exist: {0}")]
    MissingWorkspace(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the mount planner.
#[derive(Debug, Clone)]
pub struct MountPlannerConfig {
    /// Root for per-user agent state (`<state_root>/<user_id>/...`).
    pub state_root: PathBuf,
    /// Root under which workspaces live.
    pub workspace_root: PathBuf,
    /// Host directory holding client TLS material for the inner daemon.
    pub certs_path: PathBuf,
    /// Egress proxy URL, the only network path out of the agent network.
    pub egress_proxy_url: String,
    /// Address of the inner container daemon.
    pub docker_host: String,
    /// Optional GitHub token handed to agents.
    pub github_token: Option<String>,
    /// Argv of the in-container terminal daemon.
    pub terminal_argv: Vec<String>,
}

/// The planner's output: mounts in order, environment, and entry argv.
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub mounts: Vec<Mount>,
    pub env: HashMap<String, String>,
    pub args: Vec<String>,
}

/// Plans mounts and environment for agent containers.
#[derive(Debug, Clone)]
pub struct MountPlanner {
    config: MountPlannerConfig,
}

impl MountPlanner {
    pub fn new(config: MountPlannerConfig) -> Self {
        Self { config }
    }

    /// Build the mount plan for a user, optionally mounting a workspace
    /// subdirectory at `/workspace`.
    pub fn plan(&self, user_id: &str, workspace_suffix: Option<&str>) -> MountResult<MountPlan> {
        let mut mounts = Vec::new();

        // Per-user agent state, created on demand.
        for agent in AGENT_STATE_DIRS {
            let host_dir = self.config.state_root.join(user_id).join(agent);
            std::fs::create_dir_all(&host_dir)?;
            mounts.push(Mount::new(
                host_dir.to_string_lossy().to_string(),
                format!("{CONTAINER_HOME}/.{agent}"),
            ));
        }

        // Shared agent configuration, mounted in every container.
        let shared_dir = self.config.state_root.join("agents");
        std::fs::create_dir_all(&shared_dir)?;
        mounts.push(Mount::new(
            shared_dir.to_string_lossy().to_string(),
            format!("{CONTAINER_HOME}/.commander"),
        ));

        // TLS material for the inner daemon, read-only.
        mounts.push(
            Mount::new(
                self.config.certs_path.to_string_lossy().to_string(),
                CERTS_TARGET,
            )
            .read_only(),
        );

        if let Some(suffix) = workspace_suffix {
            let workspace = self.resolve_workspace(suffix)?;
            mounts.push(Mount::new(
                workspace.to_string_lossy().to_string(),
                "/workspace",
            ));
        }

        let env = self.build_env();
        let args = self.entry_args();

        Ok(MountPlan { mounts, env, args })
    }

    /// Resolve a workspace suffix against the workspace root.
    ///
    /// The suffix must be a single path component: `..`, `/` and `\` are
    /// rejected outright, and the resolved directory must exist inside the
    /// root.
    pub fn resolve_workspace(&self, suffix: &str) -> MountResult<PathBuf> {
        if suffix.is_empty()
            || suffix.contains("..")
            || suffix.contains('/')
            || suffix.contains('\\')
        {
            return Err(MountError::InvalidSuffix(suffix.to_string()));
        }

        let resolved = self.config.workspace_root.join(suffix);
        if !path_within(&resolved, &self.config.workspace_root) {
            return Err(MountError::InvalidSuffix(suffix.to_string()));
        }

        if !resolved.is_dir() {
            return Err(MountError::MissingWorkspace(
                resolved.to_string_lossy().to_string(),
            ));
        }

        Ok(resolved)
    }

    fn build_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();

        let proxy = self.config.egress_proxy_url.clone();
        env.insert("HTTP_PROXY".to_string(), proxy.clone());
        env.insert("HTTPS_PROXY".to_string(), proxy.clone());
        env.insert("NO_PROXY".to_string(), "localhost,127.0.0.1".to_string());
        env.insert("http_proxy".to_string(), proxy.clone());
        env.insert("https_proxy".to_string(), proxy);
        env.insert("no_proxy".to_string(), "localhost,127.0.0.1".to_string());

        // Let the agent launch sub-containers through the inner daemon.
        env.insert("DOCKER_HOST".to_string(), self.config.docker_host.clone());
        env.insert("DOCKER_TLS_VERIFY".to_string(), "1".to_string());
        env.insert("DOCKER_CERT_PATH".to_string(), CERTS_TARGET.to_string());

        if let Some(ref token) = self.config.github_token {
            env.insert("GITHUB_TOKEN".to_string(), token.clone());
            env.insert("GH_TOKEN".to_string(), token.clone());
        }

        env
    }

    /// Entry command: one symlink step aliasing `~/.agents` to
    /// `~/.commander`, then exec into the terminal daemon.
    fn entry_args(&self) -> Vec<String> {
        let daemon = self
            .config
            .terminal_argv
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");

        let script =
            format!("ln -sfn \"$HOME/.commander\" \"$HOME/.agents\" && exec {daemon}");

        vec!["sh".to_string(), "-c".to_string(), script]
    }
}

fn path_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Quote a string for inclusion in a POSIX shell command.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner_with_roots(state: &Path, workspace: &Path) -> MountPlanner {
        MountPlanner::new(MountPlannerConfig {
            state_root: state.to_path_buf(),
            workspace_root: workspace.to_path_buf(),
            certs_path: PathBuf::from("/etc/commander/certs"),
            egress_proxy_url: "http://oc-egress:3128".to_string(),
            docker_host: "tcp://oc-dind:2376".to_string(),
            github_token: Some("ghp_test".to_string()),
            terminal_argv: vec![
                "ttyd".to_string(),
                "-p".to_string(),
                "7681".to_string(),
                "bash".to_string(),
            ],
        })
    }

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("oc-mounts-{label}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn plan_builds_state_mounts_and_env() {
        let state = temp_dir("state");
        let workspace = temp_dir("ws");
        let planner = planner_with_roots(&state, &workspace);

        let plan = planner.plan("u1", None).unwrap();

        // claude, codex, cursor, shared agents, certs
        assert_eq!(plan.mounts.len(), 5);
        assert!(state.join("u1").join("claude").is_dir());
        assert!(state.join("agents").is_dir());
        assert_eq!(plan.mounts[4].mode.as_deref(), Some("ro"));

        assert_eq!(plan.env["HTTP_PROXY"], "http://oc-egress:3128");
        assert_eq!(plan.env["http_proxy"], "http://oc-egress:3128");
        assert_eq!(plan.env["DOCKER_TLS_VERIFY"], "1");
        assert_eq!(plan.env["DOCKER_CERT_PATH"], "/certs/client");
        assert_eq!(plan.env["GITHUB_TOKEN"], "ghp_test");
        assert_eq!(plan.env["GH_TOKEN"], "ghp_test");
    }

    #[test]
    fn plan_mounts_workspace_suffix() {
        let state = temp_dir("state2");
        let workspace = temp_dir("ws2");
        std::fs::create_dir_all(workspace.join("proj")).unwrap();
        let planner = planner_with_roots(&state, &workspace);

        let plan = planner.plan("u1", Some("proj")).unwrap();
        let last = plan.mounts.last().unwrap();
        assert_eq!(last.target, "/workspace");
        assert!(last.source.ends_with("proj"));
    }

    #[test]
    fn suffix_traversal_rejected() {
        let state = temp_dir("state3");
        let workspace = temp_dir("ws3");
        let planner = planner_with_roots(&state, &workspace);

        for bad in ["..", "../etc", "a/b", "a\\b", ""] {
            let err = planner.resolve_workspace(bad).unwrap_err();
            assert!(matches!(err, MountError::InvalidSuffix(_)), "{bad}");
        }
    }

    #[test]
    fn missing_workspace_rejected() {
        let state = temp_dir("state4");
        let workspace = temp_dir("ws4");
        let planner = planner_with_roots(&state, &workspace);

        let err = planner.resolve_workspace("ghost").unwrap_err();
        assert!(matches!(err, MountError::MissingWorkspace(_)));
    }

    #[test]
    fn entry_command_symlinks_then_execs() {
        let state = temp_dir("state5");
        let workspace = temp_dir("ws5");
        let planner = planner_with_roots(&state, &workspace);

        let plan = planner.plan("u1", None).unwrap();
        assert_eq!(plan.args[0], "sh");
        assert_eq!(plan.args[1], "-c");
        let script = &plan.args[2];
        assert!(script.starts_with("ln -sfn \"$HOME/.commander\" \"$HOME/.agents\" && exec "));
        assert!(script.ends_with("ttyd -p 7681 bash"));
    }

    #[test]
    fn shell_quote_escapes() {
        assert_eq!(shell_quote("simple"), "simple");
        assert_eq!(shell_quote("/usr/bin/ttyd"), "/usr/bin/ttyd");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
