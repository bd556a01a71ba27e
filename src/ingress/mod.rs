//! Port mappings and ingress helper cleanup.
//!
//! Sessions own their published ports. Port publishing itself is handled
//! by a per-session helper container whose lifecycle is owned elsewhere;
//! session stop only needs a best-effort `cleanup` hook that tears down
//! the helper and the recorded mappings.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::container::ContainerDriver;

/// A published port, unique per `(sessionId, hostPort)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub session_id: String,
    pub host_port: i64,
    pub container_port: i64,
}

/// Store for session port mappings.
#[derive(Debug, Clone)]
pub struct PortMappingStore {
    pool: SqlitePool,
}

impl PortMappingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a mapping. Re-recording the same host port for a session
    /// replaces the container port.
    pub async fn record(&self, mapping: &PortMapping) -> Result<()> {
        if !(1..=65535).contains(&mapping.host_port) || !(1..=65535).contains(&mapping.container_port)
        {
            bail!(
                "invalid port mapping {}:{}",
                mapping.host_port,
                mapping.container_port
            );
        }

        sqlx::query(
            "INSERT INTO port_mappings (session_id, host_port, container_port) VALUES (?, ?, ?) \
             ON CONFLICT (session_id, host_port) DO UPDATE SET container_port = excluded.container_port",
        )
        .bind(&mapping.session_id)
        .bind(mapping.host_port)
        .bind(mapping.container_port)
        .execute(&self.pool)
        .await
        .context("recording port mapping")?;

        Ok(())
    }

    /// Mappings for a session, ordered by host port.
    pub async fn for_session(&self, session_id: &str) -> Result<Vec<PortMapping>> {
        let mappings = sqlx::query_as::<_, PortMapping>(
            "SELECT session_id, host_port, container_port FROM port_mappings \
             WHERE session_id = ? ORDER BY host_port",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing port mappings")?;

        Ok(mappings)
    }

    /// Drop every mapping of a session.
    pub async fn clear(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM port_mappings WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("clearing port mappings")?;

        Ok(())
    }
}

/// Cleanup hook invoked during session stop.
#[async_trait]
pub trait IngressCleanup: Send + Sync {
    async fn cleanup(&self, session_id: &str) -> Result<()>;
}

/// Derive the helper container name for a session.
pub fn ingress_container_for(session_id: &str) -> String {
    format!("oc-ingress-{session_id}")
}

/// Default cleanup: remove the helper container and the session's recorded
/// port mappings.
pub struct ContainerIngressCleanup {
    driver: Arc<dyn ContainerDriver>,
    ports: PortMappingStore,
}

impl ContainerIngressCleanup {
    pub fn new(driver: Arc<dyn ContainerDriver>, pool: SqlitePool) -> Self {
        Self {
            driver,
            ports: PortMappingStore::new(pool),
        }
    }
}

#[async_trait]
impl IngressCleanup for ContainerIngressCleanup {
    async fn cleanup(&self, session_id: &str) -> Result<()> {
        let helper = ingress_container_for(session_id);
        self.driver
            .safe_remove(&helper)
            .await
            .with_context(|| format!("removing ingress helper {helper}"))?;

        self.ports.clear(session_id).await?;

        debug!("cleaned up ingress for session {}", session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn helper_name_derivation() {
        assert_eq!(ingress_container_for("abc"), "oc-ingress-abc");
    }

    #[tokio::test]
    async fn mappings_round_trip_and_clear() {
        let db = Database::in_memory().await.unwrap();
        let store = PortMappingStore::new(db.pool().clone());

        store
            .record(&PortMapping {
                session_id: "s1".to_string(),
                host_port: 8080,
                container_port: 80,
            })
            .await
            .unwrap();
        store
            .record(&PortMapping {
                session_id: "s1".to_string(),
                host_port: 8443,
                container_port: 443,
            })
            .await
            .unwrap();

        // Same host port replaces instead of duplicating.
        store
            .record(&PortMapping {
                session_id: "s1".to_string(),
                host_port: 8080,
                container_port: 8080,
            })
            .await
            .unwrap();

        let mappings = store.for_session("s1").await.unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].container_port, 8080);

        store.clear("s1").await.unwrap();
        assert!(store.for_session("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_ports_rejected() {
        let db = Database::in_memory().await.unwrap();
        let store = PortMappingStore::new(db.pool().clone());

        let result = store
            .record(&PortMapping {
                session_id: "s1".to_string(),
                host_port: 0,
                container_port: 80,
            })
            .await;
        assert!(result.is_err());

        let result = store
            .record(&PortMapping {
                session_id: "s1".to_string(),
                host_port: 8080,
                container_port: 70000,
            })
            .await;
        assert!(result.is_err());
    }
}
