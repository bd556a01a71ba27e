//! Terminal session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session exists but has never been started.
    Pending,
    /// Container is being provisioned.
    Starting,
    /// Container is running.
    Running,
    /// Container has stopped.
    Stopped,
    /// Session hit an unrecoverable driver failure.
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Stopped => write!(f, "stopped"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "stopped" => Ok(SessionStatus::Stopped),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Relation of a session to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    /// Sibling of the parent session.
    Fork,
    /// Continuation on top of the parent session.
    Stack,
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelationType::Fork => write!(f, "fork"),
            RelationType::Stack => write!(f, "stack"),
        }
    }
}

impl std::str::FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fork" => Ok(RelationType::Fork),
            "stack" => Ok(RelationType::Stack),
            _ => Err(format!("unknown relation type: {}", s)),
        }
    }
}

/// A terminal session, backed by at most one container at a time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSession {
    /// Unique session ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// User who owns this session.
    pub owner_user_id: String,
    /// Project the session belongs to.
    pub project_id: Option<String>,
    /// Parent session for fork/stack relations; stored as an id so the
    /// graph can never cycle in memory.
    pub parent_id: Option<String>,
    /// How this session relates to its parent.
    pub relation_type: Option<String>,
    /// Current status.
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Backing container name once started.
    pub container_name: Option<String>,
    /// When the session was created (RFC 3339).
    pub created_at: String,
    /// When the session was last updated (RFC 3339).
    pub updated_at: String,
}

impl TerminalSession {
    /// Check if the session is active (starting or running).
    pub fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Starting | SessionStatus::Running)
    }
}

/// Derive the deterministic container name for a session id.
///
/// The mapping is stable; both the session service and the proxy rely on it
/// without consulting the store.
pub fn container_name_for(session_id: &str) -> String {
    format!("oc-sess-{session_id}")
}

/// Options accepted by `start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Force a restart even if the container is already up.
    #[serde(default)]
    pub reset: bool,
    /// Workspace subdirectory to mount at `/workspace`.
    #[serde(default)]
    pub workspace_suffix: Option<String>,
    /// Branch to check out in `/workspace` after start (best-effort).
    #[serde(default)]
    pub git_branch: Option<String>,
}

/// Result of `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub container_name: String,
}

/// Result of `stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub removed: bool,
    pub container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_deterministic() {
        assert_eq!(container_name_for("abc123"), "oc-sess-abc123");
        assert_eq!(container_name_for("abc123"), container_name_for("abc123"));
    }

    #[test]
    fn status_round_trip() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Stopped,
            SessionStatus::Error,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn relation_round_trip() {
        assert_eq!("fork".parse::<RelationType>().unwrap(), RelationType::Fork);
        assert_eq!("stack".parse::<RelationType>().unwrap(), RelationType::Stack);
        assert!("loop".parse::<RelationType>().is_err());
    }
}
