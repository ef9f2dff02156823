//! Concurrent storage of the locally owned device clients.
//!
//! [`TelescopeRegistry`] maps a [`TelescopeId`] to the shared
//! [`DeviceClient`] that controls it. It is the source of truth for
//! "is this telescope local?" when routing commands.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use super::{DeviceStatus, TelescopeId};
use crate::device::DeviceClient;
use crate::error::GatewayError;

/// Read-only view of a local telescope for listings.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TelescopeSummary {
    /// Telescope identifier.
    #[schema(value_type = String)]
    pub telescope_id: TelescopeId,
    /// `host:port` of the device.
    pub address: String,
    /// Whether the device connection is established.
    pub online: bool,
    /// Latest status snapshot.
    #[schema(value_type = Object)]
    pub status: DeviceStatus,
}

/// Central store for all locally connected telescopes.
#[derive(Debug, Default)]
pub struct TelescopeRegistry {
    clients: RwLock<HashMap<TelescopeId, Arc<DeviceClient>>>,
}

impl TelescopeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client` under its own telescope id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if the id is already
    /// registered.
    pub async fn insert(&self, client: Arc<DeviceClient>) -> Result<TelescopeId, GatewayError> {
        let telescope_id = client.telescope_id().clone();
        let mut map = self.clients.write().await;
        if map.contains_key(&telescope_id) {
            return Err(GatewayError::InvalidRequest(format!(
                "telescope {telescope_id} is already registered"
            )));
        }
        map.insert(telescope_id.clone(), client);
        Ok(telescope_id)
    }

    /// Returns the client for `telescope_id`, if registered.
    pub async fn get(&self, telescope_id: &TelescopeId) -> Option<Arc<DeviceClient>> {
        self.clients.read().await.get(telescope_id).map(Arc::clone)
    }

    /// Removes and returns the client for `telescope_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Routing`] if no such telescope is registered.
    pub async fn remove(&self, telescope_id: &TelescopeId) -> Result<Arc<DeviceClient>, GatewayError> {
        self.clients
            .write()
            .await
            .remove(telescope_id)
            .ok_or_else(|| GatewayError::Routing(format!("telescope {telescope_id} is not registered locally")))
    }

    /// Returns `true` if `telescope_id` is registered.
    pub async fn contains(&self, telescope_id: &TelescopeId) -> bool {
        self.clients.read().await.contains_key(telescope_id)
    }

    /// Ids of every registered telescope.
    pub async fn ids(&self) -> Vec<TelescopeId> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// All registered clients.
    pub async fn clients(&self) -> Vec<Arc<DeviceClient>> {
        self.clients.read().await.values().map(Arc::clone).collect()
    }

    /// Summaries of every registered telescope, sorted by id.
    pub async fn list(&self) -> Vec<TelescopeSummary> {
        let mut summaries = Vec::new();
        for client in self.clients().await {
            summaries.push(TelescopeSummary {
                telescope_id: client.telescope_id().clone(),
                address: client.address(),
                online: client.is_online().await,
                status: client.status().await,
            });
        }
        summaries.sort_by(|a, b| a.telescope_id.as_str().cmp(b.telescope_id.as_str()));
        summaries
    }

    /// Number of registered telescopes.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Returns `true` if nothing is registered.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::device::DeviceClientConfig;
    use crate::domain::EventBus;

    fn client(id: &str) -> Arc<DeviceClient> {
        Arc::new(DeviceClient::new(
            TelescopeId::from(id),
            DeviceClientConfig::new("127.0.0.1", 4700),
            EventBus::new(8),
        ))
    }

    #[tokio::test]
    async fn insert_get_and_remove() {
        let registry = TelescopeRegistry::new();
        let Ok(id) = registry.insert(client("T1")).await else {
            panic!("insert failed");
        };
        assert!(registry.contains(&id).await);
        assert!(registry.get(&id).await.is_some());

        let Ok(removed) = registry.remove(&id).await else {
            panic!("remove failed");
        };
        assert_eq!(removed.telescope_id(), &id);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let registry = TelescopeRegistry::new();
        let _ = registry.insert(client("T1")).await;
        assert!(matches!(
            registry.insert(client("T1")).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_unknown_is_routing_error() {
        let registry = TelescopeRegistry::new();
        assert!(matches!(
            registry.remove(&TelescopeId::from("nope")).await,
            Err(GatewayError::Routing(_))
        ));
    }

    #[tokio::test]
    async fn list_is_sorted_and_offline() {
        let registry = TelescopeRegistry::new();
        let _ = registry.insert(client("T2")).await;
        let _ = registry.insert(client("T1")).await;

        let list = registry.list().await;
        let ids: Vec<_> = list.iter().map(|s| s.telescope_id.as_str()).collect();
        assert_eq!(ids, ["T1", "T2"]);
        assert!(list.iter().all(|s| !s.online));
        assert_eq!(list.first().map(|s| s.address.as_str()), Some("127.0.0.1:4700"));
    }
}
