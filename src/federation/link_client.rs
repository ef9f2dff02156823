//! Outbound WebSocket link to one peer gateway for one telescope.
//!
//! A [`RemoteLinkClient`] reproduces local semantics over federation:
//!
//! - `control_command`s with `response_expected` are correlated to their
//!   `command_response` by message id.
//! - Peer heartbeats refresh a liveness timestamp; silence for twice the
//!   heartbeat interval forces a reconnect cycle.
//! - Everything else the peer sends is forwarded on the handler channel,
//!   tagged with this link's telescope id.
//! - After every reconnect the recorded subscriptions are replayed.
//! - Losing the link, and running out of reconnect attempts, is announced
//!   as `telescope_lost` on the handler channel; the next successful
//!   connect is announced as `telescope_discovered`.
//!
//! Each successful connect starts a new *session*. Background tasks carry
//! the session number they were started for and ignore failures of older
//! sessions, so a late error can never tear down a fresh connection.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use utoipa::ToSchema;

use super::controller::RemoteController;
use super::state::LinkState;
use crate::domain::TelescopeId;
use crate::error::GatewayError;
use crate::pending::PendingRequests;
use crate::reconnect::ReconnectPolicy;
use crate::ws::messages::{WsMessage, WsMessageType};
use crate::ws::subscription::SubscriptionTopic;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// A message received from a peer, tagged with the link's telescope id.
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    /// Telescope of the link that received the message.
    pub telescope_id: TelescopeId,
    /// The peer's envelope.
    pub message: WsMessage,
}

/// Health snapshot of one link.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LinkHealth {
    /// Manager key of the link.
    pub controller_id: String,
    /// Telescope served by the peer.
    #[schema(value_type = String)]
    pub telescope_id: TelescopeId,
    /// Peer endpoint.
    pub url: String,
    /// Current state.
    pub state: LinkState,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// Pre-jitter delay of the most recent reconnect attempt, in ms.
    pub last_backoff_ms: Option<u64>,
    /// Seconds since the peer's last heartbeat.
    pub last_heartbeat_age_secs: Option<f64>,
    /// Outstanding correlated commands.
    pub pending_requests: usize,
    /// Recorded subscription topics.
    pub subscriptions: Vec<SubscriptionTopic>,
}

#[derive(Debug)]
struct LinkInner {
    state: LinkState,
    reconnect_attempts: u32,
    last_backoff: Option<Duration>,
    last_heartbeat: Option<Instant>,
    session: u64,
    lost_reported: bool,
    listener: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl LinkInner {
    fn take_session_tasks(&mut self) -> [Option<JoinHandle<()>>; 2] {
        [self.listener.take(), self.heartbeat.take()]
    }
}

/// WebSocket client for one peer gateway and one telescope.
pub struct RemoteLinkClient {
    controller: RemoteController,
    policy: ReconnectPolicy,
    sink: Mutex<Option<WsSink>>,
    inner: Mutex<LinkInner>,
    pending: PendingRequests<String, WsMessage>,
    subscriptions: Mutex<BTreeSet<SubscriptionTopic>>,
    handler: mpsc::Sender<RemoteMessage>,
    closed: AtomicBool,
}

impl fmt::Debug for RemoteLinkClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteLinkClient")
            .field("controller_id", &self.controller.controller_id())
            .field("url", &self.controller.url())
            .finish_non_exhaustive()
    }
}

impl RemoteLinkClient {
    /// Creates a disconnected link forwarding peer messages to `handler`.
    #[must_use]
    pub fn new(controller: RemoteController, handler: mpsc::Sender<RemoteMessage>) -> Self {
        let policy = controller.reconnect_policy();
        Self {
            controller,
            policy,
            sink: Mutex::new(None),
            inner: Mutex::new(LinkInner {
                state: LinkState::Disconnected,
                reconnect_attempts: 0,
                last_backoff: None,
                last_heartbeat: None,
                session: 0,
                lost_reported: false,
                listener: None,
                heartbeat: None,
                reconnect: None,
            }),
            pending: PendingRequests::new(),
            subscriptions: Mutex::new(BTreeSet::new()),
            handler,
            closed: AtomicBool::new(false),
        }
    }

    /// The peer descriptor.
    #[must_use]
    pub fn controller(&self) -> &RemoteController {
        &self.controller
    }

    /// Telescope served through this link.
    #[must_use]
    pub fn telescope_id(&self) -> &TelescopeId {
        &self.controller.telescope_id
    }

    /// Current state.
    pub async fn state(&self) -> LinkState {
        self.inner.lock().await.state
    }

    /// Returns `true` while the session is established.
    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    /// Reconnect attempts since the last successful connect.
    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().await.reconnect_attempts
    }

    /// Opens the WebSocket session. On failure a background reconnect
    /// cycle is scheduled and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] or [`GatewayError::Timeout`]
    /// when the peer cannot be reached.
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        self.closed.store(false, Ordering::SeqCst);
        if self.is_connected().await {
            return Ok(());
        }
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(url = %self.controller.url(), error = %err, "remote link connect failed");
                self.inner.lock().await.lost_reported = true;
                self.schedule_reconnect().await;
                Err(err)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<(), GatewayError> {
        self.inner.lock().await.state = LinkState::Connecting;
        let url = self.controller.url();
        let deadline = self.controller.message_timeout();

        let stream = match timeout(deadline, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                self.inner.lock().await.state = LinkState::Error;
                return Err(GatewayError::Connection(format!("connect to {url}: {err}")));
            }
            Err(_) => {
                self.inner.lock().await.state = LinkState::Error;
                return Err(GatewayError::timeout(format!("connect to {url}"), deadline));
            }
        };
        if self.closed.load(Ordering::SeqCst) {
            self.inner.lock().await.state = LinkState::Disconnected;
            return Err(GatewayError::Connection("remote link closed".to_string()));
        }

        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);

        let (stale, rediscovered) = {
            let mut inner = self.inner.lock().await;
            inner.session += 1;
            let session = inner.session;
            inner.state = LinkState::Connected;
            inner.reconnect_attempts = 0;
            inner.last_heartbeat = Some(Instant::now());
            let stale = inner.take_session_tasks();
            inner.listener = Some(tokio::spawn(Arc::clone(self).run_listener(source, session)));
            inner.heartbeat = Some(tokio::spawn(Arc::clone(self).run_heartbeat(session)));
            (stale, std::mem::take(&mut inner.lost_reported))
        };
        for handle in stale.into_iter().flatten() {
            handle.abort();
        }

        tracing::info!(url = %url, telescope_id = %self.controller.telescope_id, "remote link connected");
        if rediscovered {
            let address = format!("{}:{}", self.controller.host, self.controller.port);
            self.forward(WsMessage::telescope_discovered(
                self.controller.telescope_id.clone(),
                "remote",
                &address,
            ))
            .await;
        }
        self.restore_subscriptions().await;
        Ok(())
    }

    /// Starts the backoff loop unless one is already running.
    async fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.reconnect.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        inner.reconnect = Some(tokio::spawn(Arc::clone(self).run_reconnect()));
    }

    /// The backoff loop, boxed: it re-enters `schedule_reconnect` through
    /// `establish`, so its future type must be nameable to be `Send`.
    fn run_reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        self.reconnect_loop().boxed()
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let stale = self.inner.lock().await.take_session_tasks();
        for handle in stale.into_iter().flatten() {
            handle.abort();
        }

        loop {
            let next = {
                let mut inner = self.inner.lock().await;
                let attempt = inner.reconnect_attempts + 1;
                inner.state = LinkState::Error;
                if self.policy.allows(attempt) {
                    inner.reconnect_attempts = attempt;
                    inner.last_backoff = Some(self.policy.base_delay(attempt));
                    Some(attempt)
                } else {
                    tracing::error!(
                        url = %self.controller.url(),
                        attempts = inner.reconnect_attempts,
                        "remote link reconnect attempts exhausted"
                    );
                    inner.lost_reported = true;
                    None
                }
            };
            let Some(attempt) = next else {
                self.forward(WsMessage::telescope_lost(
                    self.controller.telescope_id.clone(),
                    "remote link reconnect attempts exhausted",
                ))
                .await;
                return;
            };

            let delay = self.policy.delay(attempt);
            tracing::info!(
                url = %self.controller.url(),
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "scheduling remote link reconnect"
            );
            sleep(delay).await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            self.inner.lock().await.state = LinkState::Reconnecting;
            match self.establish().await {
                Ok(()) if self.is_connected().await => return,
                Ok(()) => {
                    tracing::warn!(url = %self.controller.url(), attempt, "remote link dropped while restoring subscriptions");
                }
                Err(err) => {
                    tracing::warn!(url = %self.controller.url(), attempt, error = %err, "remote link reconnect failed");
                }
            }
        }
    }

    /// Tears down `session` after a transport failure and starts the
    /// reconnect cycle. Failures of older sessions are ignored.
    async fn on_link_failure(self: &Arc<Self>, session: u64, reason: &str) {
        {
            let mut inner = self.inner.lock().await;
            if inner.session != session
                || inner.state != LinkState::Connected
                || self.closed.load(Ordering::SeqCst)
            {
                return;
            }
            inner.state = LinkState::Error;
            inner.lost_reported = true;
        }
        tracing::warn!(url = %self.controller.url(), %reason, "remote link lost");
        self.sink.lock().await.take();
        let reason = format!("remote link lost: {reason}");
        self.pending.fail_all(&reason).await;
        self.forward(WsMessage::telescope_lost(self.controller.telescope_id.clone(), &reason))
            .await;
        self.schedule_reconnect().await;
    }

    /// Stops every task, closes the session and fails outstanding commands.
    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handles = {
            let mut inner = self.inner.lock().await;
            inner.state = LinkState::Disconnected;
            let [listener, heartbeat] = inner.take_session_tasks();
            [listener, heartbeat, inner.reconnect.take()]
        };
        for handle in handles.into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = timeout(Duration::from_secs(1), sink.close()).await;
        }
        let failed = self.pending.fail_all("remote link disconnected").await;
        tracing::info!(url = %self.controller.url(), failed_requests = failed, "remote link disconnected");
    }

    /// Sends `message`. A `control_command` with `response_expected` waits
    /// for its `command_response` and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] when the link is down or the
    /// send fails (which also starts a reconnect cycle), and
    /// [`GatewayError::Timeout`] when no response arrives in time.
    pub async fn send_message(self: &Arc<Self>, message: WsMessage) -> Result<Option<WsMessage>, GatewayError> {
        let expects_response = message.msg_type == WsMessageType::ControlCommand
            && message
                .payload
                .get("response_expected")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        if !expects_response {
            self.send_raw(&message).await?;
            return Ok(None);
        }

        let rx = self.pending.register(message.id.clone()).await?;
        if let Err(err) = self.send_raw(&message).await {
            self.pending.remove(&message.id).await;
            return Err(err);
        }
        self.pending
            .wait(&message.id, rx, self.controller.message_timeout(), &message.id)
            .await
            .map(Some)
    }

    async fn send_raw(self: &Arc<Self>, message: &WsMessage) -> Result<(), GatewayError> {
        let text = message.to_json()?;
        let session = self.inner.lock().await.session;
        let outcome = {
            let mut guard = self.sink.lock().await;
            let Some(sink) = guard.as_mut() else {
                return Err(GatewayError::Connection(format!(
                    "remote link to {} is not connected",
                    self.controller.url()
                )));
            };
            match timeout(self.controller.message_timeout(), sink.send(Message::text(text))).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err("send timed out".to_string()),
            }
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(reason) => {
                self.on_link_failure(session, &reason).await;
                Err(GatewayError::Connection(format!("send to {} failed: {reason}", self.controller.url())))
            }
        }
    }

    /// Records `topics` and subscribes to them on the peer if connected.
    /// Recorded topics are replayed after every reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] if the subscribe frame cannot
    /// be sent on a live link.
    pub async fn subscribe(self: &Arc<Self>, topics: &[SubscriptionTopic]) -> Result<(), GatewayError> {
        self.subscriptions.lock().await.extend(topics.iter().copied());
        if !self.is_connected().await {
            return Ok(());
        }
        let message = WsMessage::subscription(
            WsMessageType::Subscribe,
            Some(self.controller.telescope_id.clone()),
            topics,
            false,
        );
        self.send_raw(&message).await
    }

    /// Forgets `topics` and unsubscribes from them on the peer if connected.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] if the frame cannot be sent on
    /// a live link.
    pub async fn unsubscribe(self: &Arc<Self>, topics: &[SubscriptionTopic]) -> Result<(), GatewayError> {
        {
            let mut subscriptions = self.subscriptions.lock().await;
            if topics.contains(&SubscriptionTopic::All) {
                subscriptions.clear();
            } else {
                for topic in topics {
                    subscriptions.remove(topic);
                }
            }
        }
        if !self.is_connected().await {
            return Ok(());
        }
        let message = WsMessage::subscription(
            WsMessageType::Unsubscribe,
            Some(self.controller.telescope_id.clone()),
            topics,
            false,
        );
        self.send_raw(&message).await
    }

    async fn restore_subscriptions(self: &Arc<Self>) {
        let topics: Vec<_> = self.subscriptions.lock().await.iter().copied().collect();
        if topics.is_empty() {
            return;
        }
        let message = WsMessage::subscription(
            WsMessageType::Subscribe,
            Some(self.controller.telescope_id.clone()),
            &topics,
            false,
        );
        match self.send_raw(&message).await {
            Ok(()) => tracing::debug!(url = %self.controller.url(), count = topics.len(), "subscriptions restored"),
            Err(err) => tracing::warn!(url = %self.controller.url(), error = %err, "could not restore subscriptions"),
        }
    }

    async fn run_listener(self: Arc<Self>, mut source: WsSource, session: u64) {
        let reason = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(|| "peer closed the link".to_string(), |f| format!("peer closed the link: {}", f.reason.as_str()));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break err.to_string(),
                None => break "stream ended".to_string(),
            }
        };
        self.on_link_failure(session, &reason).await;
    }

    async fn handle_text(&self, text: &str) {
        let message = match serde_json::from_str::<WsMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(url = %self.controller.url(), error = %err, "dropping malformed peer message");
                return;
            }
        };
        match message.msg_type {
            WsMessageType::CommandResponse => {
                let Some(command_id) = message
                    .payload
                    .get("command_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    tracing::debug!(url = %self.controller.url(), "command_response without command_id");
                    return;
                };
                if !self.pending.resolve(&command_id, message).await {
                    tracing::debug!(url = %self.controller.url(), %command_id, "dropping uncorrelated command_response");
                }
            }
            WsMessageType::Heartbeat => {
                self.inner.lock().await.last_heartbeat = Some(Instant::now());
            }
            _ => self.forward(message).await,
        }
    }

    /// Hands `message` to the handler, tagged with this link's telescope.
    async fn forward(&self, message: WsMessage) {
        let forwarded = RemoteMessage {
            telescope_id: self.controller.telescope_id.clone(),
            message,
        };
        if self.handler.send(forwarded).await.is_err() {
            tracing::debug!(url = %self.controller.url(), "remote message handler is gone");
        }
    }

    async fn run_heartbeat(self: Arc<Self>, session: u64) {
        let period = self.controller.heartbeat_interval();
        let window = period.saturating_mul(2);
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let last = {
                let inner = self.inner.lock().await;
                if inner.session != session || inner.state != LinkState::Connected {
                    return;
                }
                inner.last_heartbeat
            };
            if last.is_none_or(|at| at.elapsed() > window) {
                self.on_link_failure(session, "no heartbeat from peer").await;
                return;
            }
            if self.send_raw(&WsMessage::heartbeat()).await.is_err() {
                return;
            }
        }
    }

    /// Health snapshot.
    pub async fn health(&self) -> LinkHealth {
        let (state, reconnect_attempts, last_backoff, last_heartbeat) = {
            let inner = self.inner.lock().await;
            (inner.state, inner.reconnect_attempts, inner.last_backoff, inner.last_heartbeat)
        };
        LinkHealth {
            controller_id: self.controller.controller_id(),
            telescope_id: self.controller.telescope_id.clone(),
            url: self.controller.url(),
            state,
            reconnect_attempts,
            last_backoff_ms: last_backoff.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            last_heartbeat_age_secs: last_heartbeat.map(|at| at.elapsed().as_secs_f64()),
            pending_requests: self.pending.len().await,
            subscriptions: self.subscriptions.lock().await.iter().copied().collect(),
        }
    }
}
