//! Owner of every federation link.
//!
//! [`RemoteLinkManager`] keys links by controller id and answers
//! telescope-addressed sends and status queries. At most one link may
//! serve a given telescope id.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{RwLock, mpsc};

use super::controller::RemoteController;
use super::link_client::{LinkHealth, RemoteLinkClient, RemoteMessage};
use crate::domain::TelescopeId;
use crate::error::GatewayError;
use crate::ws::messages::WsMessage;
use crate::ws::subscription::SubscriptionTopic;

/// Set of [`RemoteLinkClient`]s keyed by controller id.
#[derive(Debug)]
pub struct RemoteLinkManager {
    links: RwLock<HashMap<String, Arc<RemoteLinkClient>>>,
    handler: mpsc::Sender<RemoteMessage>,
}

impl RemoteLinkManager {
    /// Creates a manager whose links forward peer messages to `handler`.
    #[must_use]
    pub fn new(handler: mpsc::Sender<RemoteMessage>) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            handler,
        }
    }

    /// Creates and connects a link for `controller`, then subscribes to
    /// every topic on the peer.
    ///
    /// A link whose first connect fails stays registered and keeps
    /// reconnecting in the background; the connect error is still
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for a duplicate controller
    /// id, [`GatewayError::Routing`] if another link already serves the
    /// telescope, and the connect error otherwise.
    pub async fn add(&self, controller: RemoteController) -> Result<Arc<RemoteLinkClient>, GatewayError> {
        let controller_id = controller.controller_id();
        let client = {
            let mut links = self.links.write().await;
            if links.contains_key(&controller_id) {
                return Err(GatewayError::InvalidRequest(format!(
                    "remote controller {controller_id} already exists"
                )));
            }
            if let Some(owner) = links
                .values()
                .find(|link| link.telescope_id() == &controller.telescope_id)
            {
                return Err(GatewayError::Routing(format!(
                    "telescope {} is already served by {}",
                    controller.telescope_id,
                    owner.controller().controller_id()
                )));
            }
            let client = Arc::new(RemoteLinkClient::new(controller, self.handler.clone()));
            links.insert(controller_id.clone(), Arc::clone(&client));
            client
        };

        let connected = client.connect().await;
        if let Err(err) = client.subscribe(&[SubscriptionTopic::All]).await {
            tracing::warn!(%controller_id, error = %err, "subscribe to peer failed");
        }
        match connected {
            Ok(()) => {
                tracing::info!(%controller_id, telescope_id = %client.telescope_id(), "remote controller added");
                Ok(client)
            }
            Err(err) => Err(err),
        }
    }

    /// Disconnects and discards the link `controller_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Routing`] if no such link exists.
    pub async fn remove(&self, controller_id: &str) -> Result<RemoteController, GatewayError> {
        let client = self
            .links
            .write()
            .await
            .remove(controller_id)
            .ok_or_else(|| GatewayError::Routing(format!("remote controller {controller_id} not found")))?;
        client.disconnect().await;
        tracing::info!(%controller_id, "remote controller removed");
        Ok(client.controller().clone())
    }

    /// The link serving `telescope_id`, whatever its state.
    pub async fn find(&self, telescope_id: &TelescopeId) -> Option<Arc<RemoteLinkClient>> {
        self.links
            .read()
            .await
            .values()
            .find(|link| link.telescope_id() == telescope_id)
            .map(Arc::clone)
    }

    /// Returns `true` if a link serves `telescope_id`.
    pub async fn owns(&self, telescope_id: &TelescopeId) -> bool {
        self.find(telescope_id).await.is_some()
    }

    /// Sends `message` through the connected link serving `telescope_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] if no connected link serves the
    /// telescope, plus any error of
    /// [`RemoteLinkClient::send_message`].
    pub async fn send_to_telescope(
        &self,
        telescope_id: &TelescopeId,
        message: WsMessage,
    ) -> Result<Option<WsMessage>, GatewayError> {
        let link = match self.find(telescope_id).await {
            Some(link) if link.is_connected().await => link,
            _ => {
                return Err(GatewayError::Connection(format!(
                    "no connected remote link for telescope {telescope_id}"
                )));
            }
        };
        link.send_message(message).await
    }

    /// State label of the link serving `telescope_id`, or `"disconnected"`.
    pub async fn get_status(&self, telescope_id: &TelescopeId) -> &'static str {
        match self.find(telescope_id).await {
            Some(link) => link.state().await.label(),
            None => "disconnected",
        }
    }

    /// Disconnects every link concurrently. Links stay registered.
    pub async fn disconnect_all(&self) {
        let links: Vec<_> = self.links.read().await.values().map(Arc::clone).collect();
        let count = links.len();
        join_all(links.iter().map(|link| link.disconnect())).await;
        tracing::info!(count, "all remote links disconnected");
    }

    /// Health of every link, sorted by controller id.
    pub async fn health(&self) -> Vec<LinkHealth> {
        let links: Vec<_> = self.links.read().await.values().map(Arc::clone).collect();
        let mut health = join_all(links.iter().map(|link| link.health())).await;
        health.sort_by(|a, b| a.controller_id.cmp(&b.controller_id));
        health
    }

    /// Telescopes served by any link.
    pub async fn telescope_ids(&self) -> Vec<TelescopeId> {
        self.links
            .read()
            .await
            .values()
            .map(|link| link.telescope_id().clone())
            .collect()
    }

    /// Number of links.
    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    /// Returns `true` if there are no links.
    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::federation::LinkState;
    use crate::federation::link_client::tests::{fast_controller, spawn_fake_peer};
    use crate::ws::messages::WsMessageType;

    fn manager() -> (RemoteLinkManager, mpsc::Receiver<RemoteMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (RemoteLinkManager::new(tx), rx)
    }

    #[tokio::test]
    async fn add_connects_and_subscribes_to_all() {
        let mut peer = spawn_fake_peer(true).await;
        let (manager, _rx) = manager();
        let Ok(link) = manager.add(fast_controller(peer.port, "T9")).await else {
            panic!("add failed");
        };
        assert!(link.is_connected().await);

        let (_, subscribe) = peer.expect(WsMessageType::Subscribe).await;
        assert_eq!(subscribe.telescope_id.as_ref().map(TelescopeId::as_str), Some("T9"));
        assert_eq!(manager.get_status(&TelescopeId::from("T9")).await, "connected");
        manager.disconnect_all().await;
        assert_eq!(manager.get_status(&TelescopeId::from("T9")).await, "disconnected");
    }

    #[tokio::test]
    async fn send_to_telescope_routes_by_id() {
        let peer = spawn_fake_peer(true).await;
        let (manager, _rx) = manager();
        let _ = manager.add(fast_controller(peer.port, "T9")).await;

        let command = WsMessage::control_command(TelescopeId::from("T9"), "park", Map::new(), true);
        let Ok(Some(response)) = manager.send_to_telescope(&TelescopeId::from("T9"), command).await else {
            panic!("expected a response");
        };
        assert_eq!(response.msg_type, WsMessageType::CommandResponse);

        let other = WsMessage::control_command(TelescopeId::from("T1"), "park", Map::new(), true);
        assert!(matches!(
            manager.send_to_telescope(&TelescopeId::from("T1"), other).await,
            Err(GatewayError::Connection(_))
        ));
        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn duplicate_controller_and_telescope_are_rejected() {
        let peer = spawn_fake_peer(false).await;
        let (manager, _rx) = manager();
        let _ = manager.add(fast_controller(peer.port, "T9")).await;

        assert!(matches!(
            manager.add(fast_controller(peer.port, "T9")).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        let mut aliased = fast_controller(peer.port, "T9");
        aliased.controller_id = Some("alias".to_string());
        assert!(matches!(manager.add(aliased).await, Err(GatewayError::Routing(_))));
        assert_eq!(manager.len().await, 1);
        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn failed_add_keeps_link_reconnecting() {
        let (manager, _rx) = manager();
        let mut controller = fast_controller(1, "T5");
        controller.max_reconnect_attempts = 0;
        assert!(manager.add(controller).await.is_err());
        assert!(manager.owns(&TelescopeId::from("T5")).await);

        let health = manager.health().await;
        assert_eq!(health.len(), 1);
        assert!(health.iter().all(|h| h.state == LinkState::Error));
        assert_eq!(
            health.first().map(|h| h.subscriptions.clone()),
            Some(vec![SubscriptionTopic::All])
        );

        let Ok(removed) = manager.remove("127.0.0.1:1/T5").await else {
            panic!("remove failed");
        };
        assert_eq!(removed.telescope_id.as_str(), "T5");
        assert!(manager.is_empty().await);
    }
}
