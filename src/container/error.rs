//! Container driver error types.

use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur while driving the container engine.
///
/// The session service keys its recovery paths off these kinds, so the
/// classification from engine stderr lives here rather than in callers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The requested container name is already taken.
    #[error("container name already in use: {0}")]
    NameConflict(String),

    /// Concurrent pull/extract contention on image layers.
    #[error("image layer locked: {0}")]
    LayerLocked(String),

    /// The image is not available locally or from the registry.
    #[error("image not found: {0}")]
    ImageMissing(String),

    /// Container was not found.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Invalid input provided (bad name, bad image reference).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine command failed for any other reason.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Classify an engine stderr message for a failed `run`/`create`.
    ///
    /// The engine reports these conditions only through message text, so the
    /// matching here is deliberately substring based.
    pub fn classify_run(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("already in use") {
            DriverError::NameConflict(stderr.trim().to_string())
        } else if lower.contains("failed to register layer")
            || (lower.contains("layer") && lower.contains("in use"))
            || lower.contains("could not get lock")
        {
            DriverError::LayerLocked(stderr.trim().to_string())
        } else if lower.contains("no such image")
            || lower.contains("pull access denied")
            || lower.contains("manifest unknown")
        {
            DriverError::ImageMissing(stderr.trim().to_string())
        } else {
            DriverError::CommandFailed {
                command: "run".to_string(),
                message: stderr.trim().to_string(),
            }
        }
    }

    /// Whether this error means the named container does not exist.
    pub fn is_missing_container(&self) -> bool {
        match self {
            DriverError::NotFound(_) => true,
            DriverError::CommandFailed { message, .. } => {
                message.to_lowercase().contains("no such container")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_name_conflict() {
        let err = DriverError::classify_run(
            "docker: Error response from daemon: Conflict. The container name \"/oc-sess-a\" is already in use by container \"deadbeef\".",
        );
        assert!(matches!(err, DriverError::NameConflict(_)));
    }

    #[test]
    fn classify_layer_locked() {
        let err = DriverError::classify_run(
            "docker: Error response from daemon: failed to register layer: layer sha256:abc is in use",
        );
        assert!(matches!(err, DriverError::LayerLocked(_)));
    }

    #[test]
    fn classify_image_missing() {
        let err = DriverError::classify_run("Unable to find image locally: no such image: ghost:1");
        assert!(matches!(err, DriverError::ImageMissing(_)));
    }

    #[test]
    fn classify_other() {
        let err = DriverError::classify_run("docker: permission denied on socket");
        assert!(matches!(err, DriverError::CommandFailed { .. }));
    }

    #[test]
    fn missing_container_detection() {
        let err = DriverError::CommandFailed {
            command: "rm".to_string(),
            message: "Error: No such container: oc-sess-x".to_string(),
        };
        assert!(err.is_missing_container());
    }
}
