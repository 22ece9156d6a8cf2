//! Cluster service registration.
//!
//! Each throttle group registers an anonymous service activity under a
//! derived name so that a fleet-wide coordinator can discover its peers and,
//! eventually, apportion global quota among them. The apportionment
//! algorithm is deliberately absent: [`LocalRegistry`] keeps the local node
//! authoritative and only mints identities.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

/// External lock-manager collaborator.
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// Register an anonymous service activity; returns its identity.
    async fn register_service(&self, service_name: &str) -> anyhow::Result<String>;

    /// End a previously registered service activity.
    async fn end_service(&self, service_id: &str) -> anyhow::Result<()>;
}

/// Registry for single-node deployments: identities are minted locally and
/// ending an activity is a no-op.
#[derive(Debug, Default)]
pub struct LocalRegistry;

#[async_trait]
impl ClusterRegistry for LocalRegistry {
    async fn register_service(&self, service_name: &str) -> anyhow::Result<String> {
        let service_id = Uuid::new_v4().to_string();
        debug!(service = %service_name, service_id = %service_id, "Registered local service activity");
        Ok(service_id)
    }

    async fn end_service(&self, service_id: &str) -> anyhow::Result<()> {
        debug!(service_id = %service_id, "Ended local service activity");
        Ok(())
    }
}

/// Derived service name for a throttle group.
pub(crate) fn service_name(group_type: &str, group_name: &str) -> String {
    format!("_THROTTLEPOOL_{}_{}", group_type, group_name)
}
