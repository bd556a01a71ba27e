//! Run specification for agent containers.

use std::collections::HashMap;

use super::error::{DriverError, DriverResult};

/// A single bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    /// Optional mode suffix, e.g. `ro`.
    pub mode: Option<String>,
}

impl Mount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.mode = Some("ro".to_string());
        self
    }

    /// Render as a `-v` argument.
    pub fn render(&self) -> String {
        match &self.mode {
            Some(mode) => format!("{}:{}:{}", self.source, self.target, mode),
            None => format!("{}:{}", self.source, self.target),
        }
    }
}

/// Everything needed to create and start an agent container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Network to attach to.
    pub network: String,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Bind mounts, in order.
    pub mounts: Vec<Mount>,
    /// Extra `host:ip` entries.
    pub extra_hosts: Vec<String>,
    /// Command argv appended after the image.
    pub args: Vec<String>,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            network: String::new(),
            env: HashMap::new(),
            mounts: Vec::new(),
            extra_hosts: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Validate the spec before handing it to the engine.
    pub fn validate(&self) -> DriverResult<()> {
        validate_container_name(&self.name)?;
        validate_image_name(&self.image)?;
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(DriverError::InvalidInput(format!(
                    "invalid environment variable name '{key}'"
                )));
            }
        }
        for mount in &self.mounts {
            if mount.source.is_empty() || mount.target.is_empty() {
                return Err(DriverError::InvalidInput(
                    "mount source and target must be non-empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Validate a container name.
///
/// Names are alphanumeric with `-`, `_` and `.`, which also covers the hex
/// ids the engine hands back.
pub fn validate_container_name(name: &str) -> DriverResult<()> {
    if name.is_empty() {
        return Err(DriverError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }

    if name.len() > 128 {
        return Err(DriverError::InvalidInput(
            "container name exceeds maximum length".to_string(),
        ));
    }

    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !name.chars().all(valid) {
        return Err(DriverError::InvalidInput(format!(
            "container name '{name}' contains invalid characters"
        )));
    }

    Ok(())
}

/// Validate an image reference.
pub fn validate_image_name(image: &str) -> DriverResult<()> {
    if image.is_empty() {
        return Err(DriverError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(DriverError::InvalidInput(
            "image name exceeds maximum length".to_string(),
        ));
    }

    let valid = |c: char| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '/' || c == ':' || c == '@'
    };
    if !image.chars().all(valid) {
        return Err(DriverError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }

    Ok(())
}
