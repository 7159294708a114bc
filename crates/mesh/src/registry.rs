//! Service-registry hook.
//!
//! The registry is an informational peer: it hears about nodes and links but
//! nothing in the core reads from it. Notification failures are logged and
//! otherwise ignored.

use crate::error::MeshResult;
use crate::link::Connection;
use crate::node::Node;
use async_trait::async_trait;
use std::sync::Arc;

/// Receiver of topology registrations.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn node_added(&self, node: &Node) -> MeshResult<()>;

    async fn node_removed(&self, node_id: &str) -> MeshResult<()>;

    async fn connection_established(&self, connection: &Connection) -> MeshResult<()>;
}

/// Registry that accepts everything and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

#[async_trait]
impl ServiceRegistry for NoopRegistry {
    async fn node_added(&self, _node: &Node) -> MeshResult<()> {
        Ok(())
    }

    async fn node_removed(&self, _node_id: &str) -> MeshResult<()> {
        Ok(())
    }

    async fn connection_established(&self, _connection: &Connection) -> MeshResult<()> {
        Ok(())
    }
}

/// Fire-and-log wrapper around a [`ServiceRegistry`].
#[derive(Clone)]
pub struct RegistryNotifier {
    registry: Arc<dyn ServiceRegistry>,
}

impl RegistryNotifier {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self { registry }
    }

    pub async fn node_added(&self, node: &Node) {
        if let Err(e) = self.registry.node_added(node).await {
            tracing::warn!(node_id = %node.id, error = %e, "Registry rejected node registration");
        }
    }

    pub async fn node_removed(&self, node_id: &str) {
        if let Err(e) = self.registry.node_removed(node_id).await {
            tracing::warn!(node_id, error = %e, "Registry rejected node removal");
        }
    }

    pub async fn connection_established(&self, connection: &Connection) {
        if let Err(e) = self.registry.connection_established(connection).await {
            tracing::warn!(connection_id = %connection.id, error = %e, "Registry rejected connection");
        }
    }
}

impl Default for RegistryNotifier {
    fn default() -> Self {
        Self::new(Arc::new(NoopRegistry))
    }
}
