//! Per-project presence tracking.
//!
//! Entries are transient, keyed by `(userId, sessionId)` within a project,
//! and never survive a restart. Status is derived from the age of the last
//! heartbeat at read time; a garbage-collection sweep removes entries that
//! aged far past the inactive horizon.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::broadcast::{BroadcasterRegistry, presence_topic};

/// Heartbeats younger than this keep the client-reported status.
const ACTIVE_HORIZON: Duration = Duration::from_secs(30);

/// Heartbeats younger than this degrade to at most `viewing`.
const INACTIVE_HORIZON: Duration = Duration::from_secs(120);

/// Entries older than this are garbage collected (5 min past inactive).
const GC_HORIZON: Duration = Duration::from_secs(120 + 300);

/// Sweep interval for the GC task.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Presence status as reported by clients and derived by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Viewing,
    Inactive,
}

/// A presence row as sent to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub project_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub status: PresenceStatus,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TrackedEntry {
    session_id: Option<String>,
    client_status: PresenceStatus,
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
}

/// Derive the effective status from heartbeat age.
///
/// The client-sent status is authoritative only inside the active window;
/// after that entries degrade to `viewing` and then `inactive` no matter
/// what was last sent. Boundary values fall into the older bucket.
pub fn derive_status(age: Duration, client_status: PresenceStatus) -> PresenceStatus {
    if age >= INACTIVE_HORIZON {
        PresenceStatus::Inactive
    } else if age >= ACTIVE_HORIZON {
        match client_status {
            PresenceStatus::Inactive => PresenceStatus::Inactive,
            _ => PresenceStatus::Viewing,
        }
    } else {
        client_status
    }
}

/// Tracks presence per project and publishes `presence:<pid>` on mutation.
#[derive(Clone)]
pub struct PresenceTracker {
    tables: Arc<DashMap<String, HashMap<(String, Option<String>), TrackedEntry>>>,
    broadcaster: BroadcasterRegistry,
}

impl PresenceTracker {
    pub fn new(broadcaster: BroadcasterRegistry) -> Self {
        Self {
            tables: Arc::new(DashMap::new()),
            broadcaster,
        }
    }

    /// Upsert an entry and refresh its heartbeat.
    pub fn heartbeat(
        &self,
        project_id: &str,
        user_id: &str,
        session_id: Option<String>,
        status: PresenceStatus,
    ) {
        let mut table = self.tables.entry(project_id.to_string()).or_default();
        table.insert(
            (user_id.to_string(), session_id.clone()),
            TrackedEntry {
                session_id,
                client_status: status,
                last_heartbeat: Instant::now(),
                last_heartbeat_at: Utc::now(),
            },
        );
        drop(table);

        self.broadcaster.notify(&presence_topic(project_id));
    }

    /// Remove an entry.
    pub fn leave(&self, project_id: &str, user_id: &str, session_id: Option<String>) {
        let removed = match self.tables.get_mut(project_id) {
            Some(mut table) => table
                .remove(&(user_id.to_string(), session_id))
                .is_some(),
            None => false,
        };

        if removed {
            self.broadcaster.notify(&presence_topic(project_id));
        }
    }

    /// Current entries for a project with derived statuses, stable-ordered
    /// by `(userId, sessionId)`.
    pub fn list(&self, project_id: &str) -> Vec<PresenceEntry> {
        let now = Instant::now();
        let mut entries: Vec<PresenceEntry> = match self.tables.get(project_id) {
            Some(table) => table
                .iter()
                .map(|((user_id, _), entry)| PresenceEntry {
                    project_id: project_id.to_string(),
                    user_id: user_id.clone(),
                    session_id: entry.session_id.clone(),
                    status: derive_status(
                        now.duration_since(entry.last_heartbeat),
                        entry.client_status,
                    ),
                    last_heartbeat_at: entry.last_heartbeat_at,
                })
                .collect(),
            None => Vec::new(),
        };

        entries.sort_by(|a, b| {
            (a.user_id.as_str(), a.session_id.as_deref())
                .cmp(&(b.user_id.as_str(), b.session_id.as_deref()))
        });
        entries
    }

    /// Remove entries past the GC horizon. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut touched = Vec::new();

        for mut table in self.tables.iter_mut() {
            let before = table.len();
            table.retain(|_, entry| now.duration_since(entry.last_heartbeat) < GC_HORIZON);
            let dropped = before - table.len();
            if dropped > 0 {
                removed += dropped;
                touched.push(table.key().clone());
            }
        }
        self.tables.retain(|_, table| !table.is_empty());

        for project_id in touched {
            self.broadcaster.notify(&presence_topic(&project_id));
        }

        if removed > 0 {
            debug!("presence sweep removed {} stale entries", removed);
        }
        removed
    }

    /// Spawn the periodic GC sweep.
    pub fn start_sweep_task(&self) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                tracker.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_status_windows() {
        let active = PresenceStatus::Active;
        assert_eq!(derive_status(Duration::from_secs(0), active), PresenceStatus::Active);
        assert_eq!(derive_status(Duration::from_secs(29), active), PresenceStatus::Active);
        // Exactly 30 s falls into the viewing bucket.
        assert_eq!(derive_status(Duration::from_secs(30), active), PresenceStatus::Viewing);
        assert_eq!(derive_status(Duration::from_secs(119), active), PresenceStatus::Viewing);
        // Exactly 120 s is inactive.
        assert_eq!(derive_status(Duration::from_secs(120), active), PresenceStatus::Inactive);
        assert_eq!(derive_status(Duration::from_secs(600), active), PresenceStatus::Inactive);
    }

    #[test]
    fn derive_status_respects_client_report_in_window() {
        assert_eq!(
            derive_status(Duration::from_secs(5), PresenceStatus::Viewing),
            PresenceStatus::Viewing
        );
        assert_eq!(
            derive_status(Duration::from_secs(5), PresenceStatus::Inactive),
            PresenceStatus::Inactive
        );
        // A stale "inactive" never upgrades to viewing.
        assert_eq!(
            derive_status(Duration::from_secs(45), PresenceStatus::Inactive),
            PresenceStatus::Inactive
        );
    }

    #[tokio::test]
    async fn heartbeat_upserts_single_entry() {
        let tracker = PresenceTracker::new(BroadcasterRegistry::new());
        tracker.heartbeat("p1", "u1", Some("s1".to_string()), PresenceStatus::Active);
        tracker.heartbeat("p1", "u1", Some("s1".to_string()), PresenceStatus::Viewing);

        let entries = tracker.list("p1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, PresenceStatus::Viewing);
    }

    #[tokio::test]
    async fn leave_removes_entry_and_notifies() {
        let registry = BroadcasterRegistry::new();
        let tracker = PresenceTracker::new(registry.clone());
        let mut sub = registry.subscribe("presence:p1");

        tracker.heartbeat("p1", "u1", Some("s1".to_string()), PresenceStatus::Active);
        assert!(sub.notified().await);

        tracker.leave("p1", "u1", Some("s1".to_string()));
        assert!(sub.notified().await);
        assert!(tracker.list("p1").is_empty());
    }

    #[tokio::test]
    async fn distinct_sessions_are_distinct_entries() {
        let tracker = PresenceTracker::new(BroadcasterRegistry::new());
        tracker.heartbeat("p1", "u1", Some("s1".to_string()), PresenceStatus::Active);
        tracker.heartbeat("p1", "u1", Some("s2".to_string()), PresenceStatus::Active);
        assert_eq!(tracker.list("p1").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_degrade_and_sweep() {
        let tracker = PresenceTracker::new(BroadcasterRegistry::new());
        tracker.heartbeat("p1", "u1", Some("s1".to_string()), PresenceStatus::Active);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(tracker.list("p1")[0].status, PresenceStatus::Viewing);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(tracker.list("p1")[0].status, PresenceStatus::Inactive);

        // Not yet past the GC horizon.
        assert_eq!(tracker.sweep(), 0);

        tokio::time::advance(Duration::from_secs(400)).await;
        assert_eq!(tracker.sweep(), 1);
        assert!(tracker.list("p1").is_empty());
    }

    #[test]
    fn list_round_trips_through_json() {
        let tracker = PresenceTracker::new(BroadcasterRegistry::new());
        tracker.heartbeat("p1", "u2", Some("s9".to_string()), PresenceStatus::Active);
        tracker.heartbeat("p1", "u1", None, PresenceStatus::Viewing);

        let entries = tracker.list("p1");
        let json = serde_json::to_string(&entries).unwrap();
        let parsed: Vec<PresenceEntry> = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.len(), entries.len());
        for (a, b) in entries.iter().zip(parsed.iter()) {
            assert_eq!(a.user_id, b.user_id);
            assert_eq!(a.session_id, b.session_id);
            assert_eq!(a.status, b.status);
        }
    }
}
