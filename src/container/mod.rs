//! Container engine driver.
//!
//! Thin typed interface over the Docker or Podman CLI. The runtime is
//! auto-detected or can be configured explicitly. Every operation other
//! than `run` has bounded wall time or returns `None` for missing
//! containers.

mod error;
mod spec;

pub use error::{DriverError, DriverResult};
pub use spec::{Mount, RunSpec, validate_container_name, validate_image_name};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime (default for macOS/Windows dev)
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Output of an in-container command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Container engine abstraction.
///
/// The session service and the proxy depend on this trait so tests can
/// substitute a recording fake.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create and start a container. Returns once the engine has accepted
    /// the create+start. Error kinds distinguish name conflicts, layer-lock
    /// contention and missing images.
    async fn run(&self, spec: &RunSpec) -> DriverResult<()>;

    /// Start a stopped container.
    async fn start(&self, name: &str) -> DriverResult<()>;

    /// Restart a container.
    async fn restart(&self, name: &str) -> DriverResult<()>;

    /// Stop a running container.
    async fn stop(&self, name: &str, timeout_seconds: Option<u32>) -> DriverResult<()>;

    /// Probe whether a container is running. `None` means no such
    /// container; `Some(false)` means it exists but is not running.
    async fn is_running(&self, name: &str) -> DriverResult<Option<bool>>;

    /// Execute a command in a container and wait for its output.
    async fn exec(&self, name: &str, argv: &[&str]) -> DriverResult<ExecOutput>;

    /// Pull an image. Idempotent; the engine deduplicates concurrent pulls.
    async fn pull(&self, image: &str) -> DriverResult<()>;

    /// Create a network if it doesn't exist. Idempotent.
    async fn ensure_network(&self, name: &str, internal: bool) -> DriverResult<()>;

    /// Force-remove a container, swallowing "no such container".
    async fn safe_remove(&self, name: &str) -> DriverResult<()>;
}

/// CLI-backed container driver.
#[derive(Debug, Clone)]
pub struct CliDriver {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for CliDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CliDriver {
    /// Create a new driver with auto-detection. Tries Docker first, then
    /// falls back to Podman.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        } else if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        } else {
            // Fall back to docker, will fail at runtime
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        }
    }

    /// Create a driver with a specific runtime type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a driver with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// The engine binary, needed by callers that spawn long-lived `exec -i`
    /// processes themselves (the exec tunnel).
    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check the engine is reachable.
    pub async fn health_check(&self) -> DriverResult<String> {
        let output = self.invoke("version", &["version", "--format", "json"]).await?;
        Ok(output)
    }

    /// Run an engine command, returning trimmed stdout or a classified
    /// failure.
    async fn invoke(&self, command: &str, args: &[&str]) -> DriverResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DriverError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerDriver for CliDriver {
    async fn run(&self, spec: &RunSpec) -> DriverResult<()> {
        spec.validate()?;

        let mut owned_args: Vec<String> = Vec::new();
        owned_args.push("run".to_string());
        owned_args.push("-d".to_string());
        owned_args.push("--name".to_string());
        owned_args.push(spec.name.clone());

        if !spec.network.is_empty() {
            owned_args.push("--network".to_string());
            owned_args.push(spec.network.clone());
        }

        for mount in &spec.mounts {
            owned_args.push("-v".to_string());
            owned_args.push(mount.render());
        }

        for (key, value) in &spec.env {
            owned_args.push("-e".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        for host in &spec.extra_hosts {
            owned_args.push("--add-host".to_string());
            owned_args.push(host.clone());
        }

        owned_args.push(spec.image.clone());

        for arg in &spec.args {
            owned_args.push(arg.clone());
        }

        let output = Command::new(&self.binary)
            .args(&owned_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DriverError::CommandFailed {
                command: "run".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::classify_run(&stderr));
        }

        Ok(())
    }

    async fn start(&self, name: &str) -> DriverResult<()> {
        validate_container_name(name)?;
        self.invoke("start", &["start", name]).await?;
        Ok(())
    }

    async fn restart(&self, name: &str) -> DriverResult<()> {
        validate_container_name(name)?;
        self.invoke("restart", &["restart", name]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, timeout_seconds: Option<u32>) -> DriverResult<()> {
        validate_container_name(name)?;

        let mut owned_args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            owned_args.push("-t".to_string());
            owned_args.push(t.to_string());
        }
        owned_args.push(name.to_string());

        let args: Vec<&str> = owned_args.iter().map(String::as_str).collect();
        self.invoke("stop", &args).await?;
        Ok(())
    }

    async fn is_running(&self, name: &str) -> DriverResult<Option<bool>> {
        validate_container_name(name)?;

        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Running}}", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DriverError::CommandFailed {
                command: "inspect".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as missing.
            return Ok(None);
        }

        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        match state.as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Ok(None),
        }
    }

    async fn exec(&self, name: &str, argv: &[&str]) -> DriverResult<ExecOutput> {
        validate_container_name(name)?;

        let mut args = vec!["exec", name];
        args.extend(argv);

        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DriverError::CommandFailed {
                command: "exec".to_string(),
                message: e.to_string(),
            })?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn pull(&self, image: &str) -> DriverResult<()> {
        validate_image_name(image)?;

        let output = Command::new(&self.binary)
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DriverError::CommandFailed {
                command: "pull".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lower = stderr.to_lowercase();
            if lower.contains("not found") || lower.contains("pull access denied") {
                return Err(DriverError::ImageMissing(stderr.trim().to_string()));
            }
            return Err(DriverError::CommandFailed {
                command: "pull".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    async fn ensure_network(&self, name: &str, internal: bool) -> DriverResult<()> {
        validate_container_name(name)?;

        let mut args = vec!["network", "create"];
        if internal {
            args.push("--internal");
        }
        args.push(name);

        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DriverError::CommandFailed {
                command: "network create".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("already exists") {
                return Ok(());
            }
            return Err(DriverError::CommandFailed {
                command: "network create".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    async fn safe_remove(&self, name: &str) -> DriverResult<()> {
        validate_container_name(name)?;

        let output = Command::new(&self.binary)
            .args(["rm", "-f", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DriverError::CommandFailed {
                command: "rm".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such container") {
                return Ok(());
            }
            return Err(DriverError::CommandFailed {
                command: "rm".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}
