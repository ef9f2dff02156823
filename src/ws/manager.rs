//! Gateway WebSocket manager.
//!
//! [`GatewayWsManager`] owns every inbound WebSocket session. A session is
//! represented by the sending half of its outbound queue; the axum
//! connection loop drains that queue into the socket. Delivery uses
//! `try_send`, so a stalled or closed session is marked dead instead of
//! blocking broadcasts to everyone else. Dead sessions are reaped by the
//! heartbeat loop.
//!
//! Besides dispatching client messages, the manager runs two fan-out
//! loops: the device event forwarder (local [`DeviceEvent`]s) and the
//! remote relay (messages received over federation links).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior, interval};
use uuid::Uuid;

use super::messages::{ControlCommandPayload, SubscriptionPayload, WsMessage, WsMessageType};
use super::subscription::{SubscriptionManager, SubscriptionTopic};
use crate::device::DeviceClient;
use crate::domain::{DeviceEvent, DeviceStatus, StatusChanges, TelescopeId};
use crate::error::GatewayError;
use crate::federation::{RemoteController, RemoteMessage};
use crate::service::{Route, TelescopeService};

/// Outbound queue depth per session.
pub const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug)]
struct WsConnection {
    sender: mpsc::Sender<String>,
    alive: bool,
    last_heartbeat: Instant,
    subscriptions: SubscriptionManager,
    default_telescope: Option<TelescopeId>,
}

impl WsConnection {
    /// Queues `frame`; a full or closed queue marks the session dead.
    fn deliver(&mut self, frame: &str) -> bool {
        if !self.alive {
            return false;
        }
        if self.sender.try_send(frame.to_string()).is_err() {
            self.alive = false;
            return false;
        }
        true
    }
}

/// Manager of all inbound WebSocket sessions.
#[derive(Debug)]
pub struct GatewayWsManager {
    connections: RwLock<HashMap<Uuid, WsConnection>>,
    service: TelescopeService,
    heartbeat_interval: Duration,
}

impl GatewayWsManager {
    /// Creates a manager routing commands through `service`.
    #[must_use]
    pub fn new(service: TelescopeService, heartbeat_interval: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            service,
            heartbeat_interval,
        }
    }

    /// The routing service.
    #[must_use]
    pub fn service(&self) -> &TelescopeService {
        &self.service
    }

    /// Registers a session and queues the initial heartbeat.
    ///
    /// `default_telescope` is used for envelopes that omit `telescope_id`.
    pub async fn connect(
        &self,
        connection_id: Uuid,
        sender: mpsc::Sender<String>,
        default_telescope: Option<TelescopeId>,
    ) {
        let mut connection = WsConnection {
            sender,
            alive: true,
            last_heartbeat: Instant::now(),
            subscriptions: SubscriptionManager::new(),
            default_telescope,
        };
        if let Ok(frame) = WsMessage::heartbeat().to_json() {
            connection.deliver(&frame);
        }
        self.connections.write().await.insert(connection_id, connection);
        tracing::info!(%connection_id, "ws connection opened");
    }

    /// Marks the session dead and deregisters it. Dropping its queue
    /// closes the socket.
    pub async fn disconnect(&self, connection_id: Uuid) {
        if let Some(mut connection) = self.connections.write().await.remove(&connection_id) {
            connection.alive = false;
            tracing::info!(%connection_id, "ws connection closed");
        }
    }

    /// Number of registered sessions.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Returns `true` if the session is registered and alive.
    pub async fn is_alive(&self, connection_id: Uuid) -> bool {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .is_some_and(|c| c.alive)
    }

    /// Snapshot of a session's subscriptions.
    pub async fn subscriptions(&self, connection_id: Uuid) -> Option<SubscriptionManager> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| c.subscriptions.clone())
    }

    async fn send_to(&self, connection_id: Uuid, message: &WsMessage) -> bool {
        let Ok(frame) = message.to_json() else {
            return false;
        };
        let mut connections = self.connections.write().await;
        let Some(connection) = connections.get_mut(&connection_id) else {
            return false;
        };
        let delivered = connection.deliver(&frame);
        if !delivered {
            tracing::warn!(%connection_id, "ws delivery failed; connection marked dead");
        }
        delivered
    }

    /// Parses and dispatches one client frame. Malformed frames are logged
    /// and dropped without a reply.
    pub async fn handle_message(self: &Arc<Self>, connection_id: Uuid, raw: &str) {
        let message = match serde_json::from_str::<WsMessage>(raw) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(%connection_id, error = %err, "dropping malformed ws message");
                return;
            }
        };
        let telescope_id = match message.telescope_id.clone() {
            Some(id) => Some(id),
            None => self
                .connections
                .read()
                .await
                .get(&connection_id)
                .and_then(|c| c.default_telescope.clone()),
        };

        match message.msg_type {
            WsMessageType::ControlCommand => {
                self.handle_control_command(connection_id, message, telescope_id).await;
            }
            WsMessageType::Subscribe | WsMessageType::Unsubscribe => {
                self.handle_subscription(connection_id, &message, telescope_id).await;
            }
            WsMessageType::Heartbeat => {
                if let Some(connection) = self.connections.write().await.get_mut(&connection_id) {
                    connection.last_heartbeat = Instant::now();
                }
            }
            other => {
                tracing::debug!(%connection_id, msg_type = ?other, "ignoring client message type");
            }
        }
    }

    async fn handle_control_command(
        self: &Arc<Self>,
        connection_id: Uuid,
        message: WsMessage,
        telescope_id: Option<TelescopeId>,
    ) {
        let command = match message.payload_as::<ControlCommandPayload>() {
            Ok(command) => command,
            Err(err) => {
                let reply = WsMessage::command_response(&message.id, telescope_id, &Err(err));
                self.send_to(connection_id, &reply).await;
                return;
            }
        };
        let Some(telescope_id) = telescope_id else {
            let err = GatewayError::InvalidRequest("control_command requires telescope_id".to_string());
            let reply = WsMessage::command_response(&message.id, None, &Err(err));
            self.send_to(connection_id, &reply).await;
            return;
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = manager.service.execute(&telescope_id, &command).await;
            if let Err(err) = &outcome {
                tracing::warn!(
                    %connection_id,
                    %telescope_id,
                    action = %command.action,
                    error = %err,
                    "control command failed"
                );
            }
            let reply = WsMessage::command_response(&message.id, Some(telescope_id), &outcome);
            manager.send_to(connection_id, &reply).await;
        });
    }

    async fn handle_subscription(
        &self,
        connection_id: Uuid,
        message: &WsMessage,
        telescope_id: Option<TelescopeId>,
    ) {
        let payload = match message.payload_as::<SubscriptionPayload>() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%connection_id, error = %err, "dropping malformed subscription payload");
                return;
            }
        };
        let topics = payload.topics();
        let targets = if payload.all_telescopes {
            self.service.telescope_ids().await
        } else if let Some(id) = telescope_id {
            vec![id]
        } else {
            let notice = WsMessage::error(None, "subscription requires telescope_id or all_telescopes");
            self.send_to(connection_id, &notice).await;
            return;
        };

        let mut connections = self.connections.write().await;
        let Some(connection) = connections.get_mut(&connection_id) else {
            return;
        };
        for id in &targets {
            if message.msg_type == WsMessageType::Subscribe {
                connection.subscriptions.subscribe(id, &topics);
            } else {
                connection.subscriptions.unsubscribe(id, &topics);
            }
        }
        tracing::debug!(
            %connection_id,
            msg_type = ?message.msg_type,
            telescopes = targets.len(),
            topics = topics.len(),
            "subscriptions updated"
        );
    }

    /// Registers a local device client and announces it.
    ///
    /// # Errors
    ///
    /// See [`TelescopeService::register_local`].
    pub async fn register_telescope_client(&self, client: Arc<DeviceClient>) -> Result<TelescopeId, GatewayError> {
        let address = client.address();
        let telescope_id = self.service.register_local(client).await?;
        tracing::info!(%telescope_id, %address, "telescope registered");
        self.broadcast_telescope_discovered(&telescope_id, Route::Local, &address).await;
        Ok(telescope_id)
    }

    /// Removes a local device client and announces its loss.
    ///
    /// # Errors
    ///
    /// See [`TelescopeService::unregister_local`].
    pub async fn unregister_telescope_client(&self, telescope_id: &TelescopeId) -> Result<(), GatewayError> {
        self.service.unregister_local(telescope_id).await?;
        tracing::info!(%telescope_id, "telescope unregistered");
        self.broadcast_telescope_lost(telescope_id, "unregistered").await;
        Ok(())
    }

    /// Adds a federation link and announces its telescope once connected.
    ///
    /// # Errors
    ///
    /// See [`TelescopeService::add_remote`].
    pub async fn add_remote_controller(&self, controller: RemoteController) -> Result<(), GatewayError> {
        let telescope_id = controller.telescope_id.clone();
        let address = format!("{}:{}", controller.host, controller.port);
        self.service.add_remote(controller).await?;
        self.broadcast_telescope_discovered(&telescope_id, Route::Remote, &address).await;
        Ok(())
    }

    /// Removes a federation link and announces the loss of its telescope.
    ///
    /// # Errors
    ///
    /// See [`TelescopeService::remove_remote`].
    pub async fn remove_remote_controller(&self, controller_id: &str) -> Result<(), GatewayError> {
        let controller = self.service.remove_remote(controller_id).await?;
        self.broadcast_telescope_lost(&controller.telescope_id, "remote controller removed")
            .await;
        Ok(())
    }

    /// Delivers `message` to every live session subscribed to `topic` for
    /// `telescope_id`. Returns how many sessions received it.
    pub async fn broadcast_to_topic(
        &self,
        telescope_id: &TelescopeId,
        topic: SubscriptionTopic,
        message: &WsMessage,
    ) -> usize {
        let Ok(frame) = message.to_json() else {
            return 0;
        };
        let mut delivered = 0;
        for (connection_id, connection) in self.connections.write().await.iter_mut() {
            if !connection.alive || !connection.subscriptions.is_subscribed_to(telescope_id, topic) {
                continue;
            }
            if connection.deliver(&frame) {
                delivered += 1;
            } else {
                tracing::warn!(%connection_id, "ws delivery failed; connection marked dead");
            }
        }
        delivered
    }

    /// Delivers `message` to every live session.
    pub async fn broadcast_all(&self, message: &WsMessage) -> usize {
        let Ok(frame) = message.to_json() else {
            return 0;
        };
        let mut delivered = 0;
        for (connection_id, connection) in self.connections.write().await.iter_mut() {
            if connection.deliver(&frame) {
                delivered += 1;
            } else if !connection.alive {
                tracing::debug!(%connection_id, "skipping dead connection");
            }
        }
        delivered
    }

    /// Sends `status_update` to sessions subscribed to STATUS (or ALL) for
    /// `telescope_id`.
    pub async fn broadcast_status_update(
        &self,
        telescope_id: &TelescopeId,
        status: &DeviceStatus,
        changes: &StatusChanges,
    ) -> usize {
        let payload = json!({ "status": status, "changes": changes });
        let message = WsMessage::status_update(telescope_id.clone(), SubscriptionTopic::Status, payload);
        self.broadcast_to_topic(telescope_id, SubscriptionTopic::Status, &message)
            .await
    }

    /// Announces a reachable telescope to every session.
    pub async fn broadcast_telescope_discovered(&self, telescope_id: &TelescopeId, route: Route, address: &str) -> usize {
        let message = WsMessage::telescope_discovered(telescope_id.clone(), route.as_str(), address);
        self.broadcast_all(&message).await
    }

    /// Announces a lost telescope to every session.
    pub async fn broadcast_telescope_lost(&self, telescope_id: &TelescopeId, reason: &str) -> usize {
        let message = WsMessage::telescope_lost(telescope_id.clone(), reason);
        self.broadcast_all(&message).await
    }

    /// One heartbeat cycle: sessions silent for twice the interval are
    /// marked dead, the rest get a heartbeat, then dead sessions are
    /// reaped. Returns the number reaped.
    pub async fn check_connections_once(&self) -> usize {
        let window = self.heartbeat_interval.saturating_mul(2);
        let frame = WsMessage::heartbeat().to_json().unwrap_or_default();
        let mut connections = self.connections.write().await;
        for (connection_id, connection) in connections.iter_mut() {
            if connection.last_heartbeat.elapsed() > window {
                tracing::info!(%connection_id, "ws heartbeat timeout");
                connection.alive = false;
            } else if !connection.deliver(&frame) {
                tracing::warn!(%connection_id, "ws heartbeat delivery failed");
            }
        }
        let before = connections.len();
        connections.retain(|_, c| c.alive);
        let reaped = before - connections.len();
        if reaped > 0 {
            tracing::info!(reaped, remaining = connections.len(), "reaped dead ws connections");
        }
        reaped
    }

    /// Runs [`check_connections_once`](Self::check_connections_once) every
    /// heartbeat interval, forever.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.check_connections_once().await;
        }
    }

    /// Fans one device event out to subscribed sessions.
    pub async fn forward_event(&self, event: &DeviceEvent) -> usize {
        let telescope_id = event.telescope_id().clone();
        match event {
            DeviceEvent::Status { status, changes, .. } => {
                self.broadcast_status_update(&telescope_id, status, changes).await
            }
            DeviceEvent::ConnectionLost { reason, .. } => {
                self.broadcast_telescope_lost(&telescope_id, reason).await
            }
            DeviceEvent::Annotation { .. } => {
                let payload = serde_json::to_value(event).unwrap_or(Value::Null);
                let message = WsMessage::new(WsMessageType::AnnotationEvent, Some(telescope_id.clone()), payload);
                self.broadcast_to_topic(&telescope_id, SubscriptionTopic::Imaging, &message)
                    .await
            }
            DeviceEvent::StackProgress { .. } | DeviceEvent::WheelMove { .. } => {
                self.forward_as_status(&telescope_id, SubscriptionTopic::Imaging, event).await
            }
            DeviceEvent::FocuserMove { .. } => {
                self.forward_as_status(&telescope_id, SubscriptionTopic::Focus, event).await
            }
            DeviceEvent::ViewState { .. } => {
                self.forward_as_status(&telescope_id, SubscriptionTopic::Position, event).await
            }
            DeviceEvent::ClientModeChanged { .. } | DeviceEvent::ConditionChanged { .. } => {
                self.forward_as_status(&telescope_id, SubscriptionTopic::System, event).await
            }
        }
    }

    async fn forward_as_status(&self, telescope_id: &TelescopeId, topic: SubscriptionTopic, event: &DeviceEvent) -> usize {
        let payload = serde_json::to_value(event).unwrap_or(Value::Null);
        let message = WsMessage::status_update(telescope_id.clone(), topic, payload);
        self.broadcast_to_topic(telescope_id, topic, &message).await
    }

    /// Drains the device event bus into [`forward_event`](Self::forward_event)
    /// until the bus closes.
    pub async fn run_event_forwarder(self: Arc<Self>, mut events: broadcast::Receiver<DeviceEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.forward_event(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event forwarder lagged behind event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Re-broadcasts a message received from a peer using local topic
    /// rules. The link's telescope id wins over whatever the peer sent.
    pub async fn relay_remote(&self, remote: RemoteMessage) -> usize {
        let RemoteMessage {
            telescope_id,
            mut message,
        } = remote;
        message.telescope_id = Some(telescope_id.clone());
        match message.msg_type {
            WsMessageType::StatusUpdate => {
                let topic = message
                    .payload
                    .get("topic")
                    .and_then(Value::as_str)
                    .and_then(SubscriptionTopic::parse)
                    .unwrap_or(SubscriptionTopic::Status);
                self.broadcast_to_topic(&telescope_id, topic, &message).await
            }
            WsMessageType::AnnotationEvent => {
                self.broadcast_to_topic(&telescope_id, SubscriptionTopic::Imaging, &message)
                    .await
            }
            WsMessageType::TelescopeDiscovered | WsMessageType::TelescopeLost => {
                self.broadcast_all(&message).await
            }
            other => {
                tracing::debug!(%telescope_id, msg_type = ?other, "not relaying peer message");
                0
            }
        }
    }

    /// Drains federation links into [`relay_remote`](Self::relay_remote)
    /// until every link handle is dropped.
    pub async fn run_remote_relay(self: Arc<Self>, mut messages: mpsc::Receiver<RemoteMessage>) {
        while let Some(remote) = messages.recv().await {
            self.relay_remote(remote).await;
        }
    }
}
