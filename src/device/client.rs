//! Device protocol client.
//!
//! A [`DeviceClient`] owns one [`Connection`] to a telescope and a
//! supervised group of background tasks running against it:
//!
//! - **reader**: decodes every inbound line; events update the
//!   [`DeviceStatus`] and are republished on the [`EventBus`], responses
//!   resolve their pending request.
//! - **heartbeat**: a lightweight `test_connection` probe while connected.
//! - **refresh**: merges aggregate device and view state into the status.
//! - **monitor** (optional): polls a [`ConditionMonitor`].
//!
//! [`DeviceClient::disconnect`] aborts the whole group, waits for it to
//! finish, closes the connection and fails every in-flight request.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, sleep};

use super::connection::{Connection, ConnectionConfig};
use super::frame::{self, DeviceRequest, DeviceResponse, EventFrame, InboundFrame};
use super::monitor::ConditionMonitor;
use crate::domain::{
    DeviceEvent, DeviceStateSnapshot, DeviceStatus, EventBus, StatusChanges, TelescopeId, ViewState,
};
use crate::error::GatewayError;
use crate::pending::PendingRequests;

/// First id handed out by [`DeviceClient::next_request_id`]; lower ids are
/// left to callers that pick their own.
pub const FIRST_REQUEST_ID: u64 = 10_000;

/// Timing parameters for a [`DeviceClient`].
#[derive(Debug, Clone)]
pub struct DeviceClientConfig {
    /// Transport parameters.
    pub connection: ConnectionConfig,
    /// Deadline for a correlated response.
    pub request_timeout: Duration,
    /// Period of the heartbeat probe.
    pub heartbeat_interval: Duration,
    /// Period of the aggregate state refresh.
    pub refresh_interval: Duration,
}

impl DeviceClientConfig {
    /// Creates a config with default timings for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            connection: ConnectionConfig::new(host, port),
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

type MonitorSlot = (Arc<dyn ConditionMonitor>, Duration);

/// Client for one device speaking the line-delimited JSON protocol.
pub struct DeviceClient {
    telescope_id: TelescopeId,
    config: DeviceClientConfig,
    connection: RwLock<Option<Arc<Connection>>>,
    pending: PendingRequests<u64, DeviceResponse>,
    next_id: AtomicU64,
    status: RwLock<DeviceStatus>,
    event_bus: EventBus,
    tasks: Mutex<JoinSet<()>>,
    monitor: Option<MonitorSlot>,
}

impl fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClient")
            .field("telescope_id", &self.telescope_id)
            .field("address", &self.config.connection.address())
            .field("monitor", &self.monitor.as_ref().map(|(m, _)| m.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl DeviceClient {
    /// Creates a disconnected client publishing onto `event_bus`.
    #[must_use]
    pub fn new(telescope_id: TelescopeId, config: DeviceClientConfig, event_bus: EventBus) -> Self {
        Self {
            telescope_id,
            config,
            connection: RwLock::new(None),
            pending: PendingRequests::new(),
            next_id: AtomicU64::new(FIRST_REQUEST_ID),
            status: RwLock::new(DeviceStatus::default()),
            event_bus,
            tasks: Mutex::new(JoinSet::new()),
            monitor: None,
        }
    }

    /// Attaches a condition monitor polled every `every` while connected.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn ConditionMonitor>, every: Duration) -> Self {
        self.monitor = Some((monitor, every));
        self
    }

    /// The telescope this client controls.
    #[must_use]
    pub fn telescope_id(&self) -> &TelescopeId {
        &self.telescope_id
    }

    /// `host:port` of the device.
    #[must_use]
    pub fn address(&self) -> String {
        self.config.connection.address()
    }

    /// Opens the connection, resets the status and starts the task group.
    ///
    /// Connecting an already-online client is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] or [`GatewayError::Timeout`]
    /// when the device cannot be reached.
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.is_online().await {
            return Ok(());
        }
        self.stop_tasks().await;
        if let Some(stale) = self.connection.write().await.take() {
            stale.close().await;
        }

        let conn = Arc::new(Connection::open(self.config.connection.clone()).await?);
        *self.status.write().await = DeviceStatus::default();
        *self.connection.write().await = Some(Arc::clone(&conn));

        let mut tasks = self.tasks.lock().await;
        tasks.spawn(Arc::clone(self).run_reader(conn));
        tasks.spawn(Arc::clone(self).run_heartbeat());
        tasks.spawn(Arc::clone(self).run_refresh());
        if let Some((monitor, every)) = &self.monitor {
            tasks.spawn(Arc::clone(self).run_monitor(Arc::clone(monitor), *every));
        }
        drop(tasks);

        tracing::info!(telescope_id = %self.telescope_id, address = %self.address(), "device client connected");
        Ok(())
    }

    /// Like [`connect`](Self::connect), but retries with the connection's
    /// reconnect policy until the device answers or the policy gives up.
    /// Giving up publishes [`DeviceEvent::ConnectionLost`].
    ///
    /// # Errors
    ///
    /// Returns the last connect error once attempts are exhausted.
    pub async fn connect_with_retry(self: &Arc<Self>) -> Result<(), GatewayError> {
        let policy = &self.config.connection.reconnect;
        let mut attempt = 0_u32;
        loop {
            let err = match self.connect().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            attempt += 1;
            if !policy.allows(attempt) {
                tracing::error!(
                    telescope_id = %self.telescope_id,
                    address = %self.address(),
                    attempts = attempt - 1,
                    error = %err,
                    "device connect attempts exhausted"
                );
                self.event_bus.publish(DeviceEvent::ConnectionLost {
                    telescope_id: self.telescope_id.clone(),
                    reason: err.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(err);
            }
            let delay = policy.delay(attempt);
            tracing::info!(
                telescope_id = %self.telescope_id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying device connect"
            );
            sleep(delay).await;
        }
    }

    /// Cancels the task group, closes the connection and fails every
    /// in-flight request with [`GatewayError::Connection`].
    pub async fn disconnect(&self) {
        self.stop_tasks().await;
        if let Some(conn) = self.connection.write().await.take() {
            conn.close().await;
        }
        let failed = self.pending.fail_all("device disconnected").await;
        tracing::info!(telescope_id = %self.telescope_id, failed_requests = failed, "device client disconnected");
    }

    async fn stop_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    /// Returns `true` while the connection is established.
    pub async fn is_online(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_connected())
    }

    /// Snapshot of the current device status.
    pub async fn status(&self) -> DeviceStatus {
        self.status.read().await.clone()
    }

    /// Number of requests awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.pending.len().await
    }

    /// Allocates the next request id. Ids increase monotonically.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn connection(&self) -> Result<Arc<Connection>, GatewayError> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| GatewayError::Connection(format!("telescope {} is not connected", self.telescope_id)))
    }

    async fn write_request(&self, request: &DeviceRequest) -> Result<(), GatewayError> {
        let conn = self.connection().await?;
        let line = serde_json::to_string(request)?;
        tracing::debug!(telescope_id = %self.telescope_id, id = request.id, method = %request.method, "device request");
        conn.write_line(&line).await
    }

    /// Sends `method` without waiting for its response. Returns the id used.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] if the frame cannot be written.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<u64, GatewayError> {
        let id = self.next_request_id();
        self.write_request(&DeviceRequest {
            id,
            method: method.to_string(),
            params,
        })
        .await?;
        Ok(id)
    }

    /// Sends `method` and waits for the correlated response.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Timeout`] if no response arrives within the
    /// request timeout, or [`GatewayError::Connection`] if the frame cannot
    /// be written or the client disconnects while waiting.
    pub async fn send_and_recv(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<DeviceResponse, GatewayError> {
        let id = self.next_request_id();
        self.send_and_recv_with_id(id, method, params).await
    }

    /// Like [`send_and_recv`](Self::send_and_recv) with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// As [`send_and_recv`](Self::send_and_recv), plus
    /// [`GatewayError::InvalidRequest`] if `id` is already outstanding.
    pub async fn send_and_recv_with_id(
        &self,
        id: u64,
        method: &str,
        params: Option<Value>,
    ) -> Result<DeviceResponse, GatewayError> {
        let rx = self.pending.register(id).await?;
        let request = DeviceRequest {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(err) = self.write_request(&request).await {
            self.pending.remove(&id).await;
            return Err(err);
        }
        self.pending
            .wait(&id, rx, self.config.request_timeout, method)
            .await
    }

    /// Sends `method` and returns its result value.
    ///
    /// # Errors
    ///
    /// As [`send_and_recv`](Self::send_and_recv), plus
    /// [`GatewayError::Command`] when the device answers with a non-zero code.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        self.send_and_recv(method, params).await?.into_result()
    }

    /// Pulls aggregate device state, view state and coordinates and merges
    /// them into the status.
    ///
    /// # Errors
    ///
    /// Propagates the first failing request.
    pub async fn refresh_state(&self) -> Result<(), GatewayError> {
        let device_state: DeviceStateSnapshot =
            serde_json::from_value(self.call("get_device_state", None).await?)?;
        let changes = self.status.write().await.apply_device_state(&device_state);
        self.publish_status(changes).await;

        let view = self.call("get_view_state", None).await?;
        let view: ViewState = serde_json::from_value(view.get("View").cloned().unwrap_or(view))?;
        self.merge_view_state(&view).await;

        let coords = self.call("scope_get_equ_coord", None).await?;
        if let (Some(ra), Some(dec)) = (
            coords.get("ra").and_then(Value::as_f64),
            coords.get("dec").and_then(Value::as_f64),
        ) {
            let changes = self.status.write().await.apply_coordinates(ra, dec);
            self.publish_status(changes).await;
        }
        Ok(())
    }

    async fn run_reader(self: Arc<Self>, conn: Arc<Connection>) {
        loop {
            match conn.read_line().await {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => {}
                Err(GatewayError::Parse(reason)) => {
                    tracing::warn!(telescope_id = %self.telescope_id, %reason, "dropping undecodable device input");
                }
                Err(err) => {
                    tracing::error!(telescope_id = %self.telescope_id, error = %err, "device link lost");
                    self.pending.fail_all(&err.to_string()).await;
                    self.event_bus.publish(DeviceEvent::ConnectionLost {
                        telescope_id: self.telescope_id.clone(),
                        reason: err.to_string(),
                        timestamp: Utc::now(),
                    });
                    break;
                }
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let period = self.config.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.is_online().await {
                continue;
            }
            if let Err(err) = self.send("test_connection", None).await {
                tracing::debug!(telescope_id = %self.telescope_id, error = %err, "heartbeat probe failed");
            }
        }
    }

    async fn run_refresh(self: Arc<Self>) {
        let mut ticker = interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !self.is_online().await {
                continue;
            }
            if let Err(err) = self.refresh_state().await {
                tracing::warn!(telescope_id = %self.telescope_id, error = %err, "state refresh failed");
            }
        }
    }

    async fn run_monitor(self: Arc<Self>, monitor: Arc<dyn ConditionMonitor>, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last: Option<bool> = None;
        loop {
            ticker.tick().await;
            match monitor.check().await {
                Ok(active) if last != Some(active) => {
                    last = Some(active);
                    tracing::info!(telescope_id = %self.telescope_id, condition = monitor.name(), active, "condition changed");
                    self.event_bus.publish(DeviceEvent::ConditionChanged {
                        telescope_id: self.telescope_id.clone(),
                        condition: monitor.name().to_string(),
                        active,
                        timestamp: Utc::now(),
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(telescope_id = %self.telescope_id, condition = monitor.name(), error = %err, "monitor check failed");
                }
            }
        }
    }

    /// Decodes one inbound line and dispatches it. Malformed input is
    /// logged and dropped.
    pub(crate) async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match frame::parse_frame(line) {
            Ok(InboundFrame::Event(event)) => self.handle_event(event).await,
            Ok(InboundFrame::Response(response)) => {
                let id = response.id;
                if !self.pending.resolve(&id, response).await {
                    tracing::debug!(telescope_id = %self.telescope_id, id, "dropping uncorrelated response");
                }
            }
            Ok(InboundFrame::Other) => {
                tracing::trace!(telescope_id = %self.telescope_id, "ignoring unrecognized frame");
            }
            Err(err) => {
                tracing::warn!(telescope_id = %self.telescope_id, error = %err, "dropping malformed device frame");
            }
        }
    }

    async fn handle_event(&self, event: EventFrame) {
        let telescope_id = self.telescope_id.clone();
        match event {
            EventFrame::PiStatus(update) => {
                let changes = self.status.write().await.apply_pi_status(&update);
                self.publish_status(changes).await;
            }
            EventFrame::Stack(stack) => {
                let (changes, stacked_frames, dropped_frames) = {
                    let mut status = self.status.write().await;
                    let changes = status.apply_stack(stack.stacked_frame, stack.dropped_frame);
                    (changes, status.stacked_frames, status.dropped_frames)
                };
                self.event_bus.publish(DeviceEvent::StackProgress {
                    telescope_id,
                    stacked_frames,
                    dropped_frames,
                    state: stack.state,
                    timestamp: Utc::now(),
                });
                self.publish_status(changes).await;
            }
            EventFrame::FocuserMove(focuser) => {
                let changes = self.status.write().await.apply_focuser_position(focuser.position);
                self.event_bus.publish(DeviceEvent::FocuserMove {
                    telescope_id,
                    position: focuser.position,
                    timestamp: Utc::now(),
                });
                self.publish_status(changes).await;
            }
            EventFrame::WheelMove(wheel) => {
                let changes = self
                    .status
                    .write()
                    .await
                    .apply_wheel_move(wheel.state.as_deref(), wheel.position);
                self.event_bus.publish(DeviceEvent::WheelMove {
                    telescope_id,
                    state: wheel.state,
                    position: wheel.position,
                    timestamp: Utc::now(),
                });
                self.publish_status(changes).await;
            }
            EventFrame::View(view) => self.merge_view_state(&view).await,
            EventFrame::Annotate(annotate) => {
                self.event_bus.publish(DeviceEvent::Annotation {
                    telescope_id,
                    result: annotate.result,
                    timestamp: Utc::now(),
                });
            }
            EventFrame::Unknown => {
                tracing::trace!(telescope_id = %self.telescope_id, "ignoring untracked event");
            }
        }
    }

    /// Shared by `View` events and the periodic refresh.
    async fn merge_view_state(&self, view: &ViewState) {
        let (changes, transition) = self.status.write().await.apply_view_state(view);
        if !changes.is_empty() {
            self.event_bus.publish(DeviceEvent::ViewState {
                telescope_id: self.telescope_id.clone(),
                stage: view.stage.clone(),
                state: view.state.clone(),
                timestamp: Utc::now(),
            });
        }
        if let Some(transition) = transition {
            tracing::info!(
                telescope_id = %self.telescope_id,
                old = ?transition.old,
                new = ?transition.new,
                "client mode changed"
            );
            self.event_bus.publish(DeviceEvent::ClientModeChanged {
                telescope_id: self.telescope_id.clone(),
                old_mode: transition.old,
                new_mode: transition.new,
                timestamp: Utc::now(),
            });
        }
        self.publish_status(changes).await;
    }

    async fn publish_status(&self, changes: StatusChanges) {
        if changes.is_empty() {
            return;
        }
        let status = self.status.read().await.clone();
        self.event_bus.publish(DeviceEvent::Status {
            telescope_id: self.telescope_id.clone(),
            status,
            changes,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::domain::{ClientMode, EventKind};
    use crate::reconnect::ReconnectPolicy;

    /// In-process device speaking the line protocol.
    pub(crate) struct FakeDevice {
        pub(crate) port: u16,
        pub(crate) inject: mpsc::Sender<String>,
        pub(crate) received: mpsc::Receiver<Value>,
    }

    impl FakeDevice {
        /// Waits for the next request with `method`, skipping others.
        pub(crate) async fn expect_method(&mut self, method: &str) -> Value {
            loop {
                let Ok(Some(frame)) =
                    tokio::time::timeout(Duration::from_secs(5), self.received.recv()).await
                else {
                    panic!("device never received {method}");
                };
                if frame.get("method").and_then(Value::as_str) == Some(method) {
                    return frame;
                }
            }
        }
    }

    enum Replies {
        Silent,
        Echo,
        Scripted(HashMap<String, Value>),
    }

    impl Replies {
        fn result_for(&self, method: &Value) -> Option<Value> {
            match self {
                Self::Silent => None,
                Self::Echo => Some(json!({"echo": method})),
                Self::Scripted(results) => Some(
                    method
                        .as_str()
                        .and_then(|name| results.get(name).cloned())
                        .unwrap_or_else(|| json!({"echo": method})),
                ),
            }
        }
    }

    /// Spawns a fake device. With `respond`, every request with an id is
    /// answered with `{"echo": method}`.
    pub(crate) async fn spawn_fake_device(respond: bool) -> FakeDevice {
        let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        serve_fake_device(listener, if respond { Replies::Echo } else { Replies::Silent })
    }

    /// Fake device answering the listed methods with fixed results and
    /// echoing everything else.
    async fn spawn_scripted_device(results: &[(&str, Value)]) -> FakeDevice {
        let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let results = results
            .iter()
            .map(|(method, result)| ((*method).to_string(), result.clone()))
            .collect();
        serve_fake_device(listener, Replies::Scripted(results))
    }

    fn serve_fake_device(listener: TcpListener, replies: Replies) -> FakeDevice {
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        let (inject, mut inject_rx) = mpsc::channel::<String>(16);
        let (received_tx, received) = mpsc::channel::<Value>(64);

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { break };
                        let Ok(frame) = serde_json::from_str::<Value>(&line) else { continue };
                        let method = frame.get("method").cloned().unwrap_or(Value::Null);
                        if let Some(id) = frame.get("id").and_then(Value::as_u64)
                            && let Some(result) = replies.result_for(&method)
                        {
                            let reply = json!({
                                "id": id,
                                "jsonrpc": "2.0",
                                "method": method,
                                "code": 0,
                                "result": result,
                            });
                            let _ = write_half.write_all(format!("{reply}\r\n").as_bytes()).await;
                        }
                        let _ = received_tx.send(frame).await;
                    }
                    Some(line) = inject_rx.recv() => {
                        let _ = write_half.write_all(format!("{line}\r\n").as_bytes()).await;
                    }
                }
            }
        });

        FakeDevice {
            port: addr.port(),
            inject,
            received,
        }
    }

    pub(crate) fn test_config(port: u16, request_timeout: Duration) -> DeviceClientConfig {
        let mut config = DeviceClientConfig::new("127.0.0.1", port);
        config.request_timeout = request_timeout;
        config.heartbeat_interval = Duration::from_secs(3600);
        config.refresh_interval = Duration::from_secs(3600);
        config.connection.reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_jitter: Duration::ZERO,
            max_attempts: Some(1),
        };
        config
    }

    fn offline_client(bus: &EventBus) -> DeviceClient {
        DeviceClient::new(TelescopeId::from("T1"), test_config(1, Duration::from_secs(1)), bus.clone())
    }

    #[tokio::test]
    async fn send_and_recv_resolves_matching_response() {
        let device = spawn_fake_device(true).await;
        let client = Arc::new(DeviceClient::new(
            TelescopeId::from("T1"),
            test_config(device.port, Duration::from_secs(5)),
            EventBus::new(16),
        ));
        let Ok(()) = client.connect().await else {
            panic!("connect failed");
        };
        assert!(client.is_online().await);

        let Ok(result) = client.call("get_control_value", Some(json!(["gain"]))).await else {
            panic!("call failed");
        };
        assert_eq!(result.get("echo"), Some(&json!("get_control_value")));
        assert_eq!(client.pending_requests().await, 0);
        client.disconnect().await;
        assert!(!client.is_online().await);
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_is_removed() {
        let mut device = spawn_fake_device(false).await;
        let client = Arc::new(DeviceClient::new(
            TelescopeId::from("T1"),
            test_config(device.port, Duration::from_millis(200)),
            EventBus::new(16),
        ));
        let Ok(()) = client.connect().await else {
            panic!("connect failed");
        };

        let result = client.send_and_recv("scope_park", None).await;
        let Err(GatewayError::Timeout { operation, .. }) = result else {
            panic!("expected a timeout");
        };
        assert_eq!(operation, "scope_park");

        let frame = device.expect_method("scope_park").await;
        assert!(frame.get("id").and_then(Value::as_u64).is_some_and(|id| id >= FIRST_REQUEST_ID));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_requests() {
        let mut device = spawn_fake_device(false).await;
        let client = Arc::new(DeviceClient::new(
            TelescopeId::from("T1"),
            test_config(device.port, Duration::from_secs(30)),
            EventBus::new(16),
        ));
        let Ok(()) = client.connect().await else {
            panic!("connect failed");
        };

        let caller = Arc::clone(&client);
        let in_flight = tokio::spawn(async move { caller.send_and_recv("scope_park", None).await });
        device.expect_method("scope_park").await;

        client.disconnect().await;
        let Ok(Err(GatewayError::Connection(reason))) = in_flight.await else {
            panic!("expected an eager connection error");
        };
        assert!(reason.contains("disconnected"));
    }

    #[tokio::test]
    async fn duplicate_caller_id_is_rejected() {
        let device = spawn_fake_device(false).await;
        let client = Arc::new(DeviceClient::new(
            TelescopeId::from("T1"),
            test_config(device.port, Duration::from_millis(500)),
            EventBus::new(16),
        ));
        let Ok(()) = client.connect().await else {
            panic!("connect failed");
        };
        let first = Arc::clone(&client);
        let waiting = tokio::spawn(async move { first.send_and_recv_with_id(7, "get_setting", None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = client.send_and_recv_with_id(7, "get_setting", None).await;
        assert!(matches!(second, Err(GatewayError::InvalidRequest(_))));
        let _ = waiting.await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn partial_pi_status_keeps_other_fields() {
        let bus = EventBus::new(16);
        let client = offline_client(&bus);
        client
            .handle_line(r#"{"Event":"PiStatus","Timestamp":"1.0","temp":31.5,"charger_status":"Full","battery_capacity":90}"#)
            .await;
        client.handle_line(r#"{"Event":"PiStatus","Timestamp":"2.0","temp":10.0}"#).await;

        let status = client.status().await;
        assert_eq!(status.temperature, Some(10.0));
        assert_eq!(status.charger_status.as_deref(), Some("Full"));
        assert_eq!(status.battery_capacity, Some(90));
    }

    #[tokio::test]
    async fn stack_event_updates_counters_and_republishes() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_kind(EventKind::StackProgress);
        let client = offline_client(&bus);
        client
            .handle_line(r#"{"Event":"Stack","state":"frame_complete","stacked_frame":12,"dropped_frame":3}"#)
            .await;

        let Ok(DeviceEvent::StackProgress { stacked_frames, dropped_frames, .. }) = rx.recv().await else {
            panic!("expected stack progress");
        };
        assert_eq!((stacked_frames, dropped_frames), (12, 3));
        assert_eq!(client.status().await.stacked_frames, 12);
    }

    #[tokio::test]
    async fn view_event_raises_client_mode_change() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_kind(EventKind::ClientModeChanged);
        let client = offline_client(&bus);

        client.handle_line(r#"{"Event":"View","state":"working","stage":"RTSP"}"#).await;
        client.handle_line(r#"{"Event":"View","state":"cancel","stage":"RTSP"}"#).await;

        let Ok(DeviceEvent::ClientModeChanged { old_mode, new_mode, .. }) = rx.recv().await else {
            panic!("expected a mode change");
        };
        assert_eq!((old_mode, new_mode), (None, Some(ClientMode::Streaming)));
        let Ok(DeviceEvent::ClientModeChanged { old_mode, new_mode, .. }) = rx.recv().await else {
            panic!("expected a second mode change");
        };
        assert_eq!((old_mode, new_mode), (Some(ClientMode::Streaming), None));
    }

    #[tokio::test]
    async fn wheel_and_focuser_events_update_status() {
        let bus = EventBus::new(16);
        let client = offline_client(&bus);
        client.handle_line(r#"{"Event":"FocuserMove","state":"complete","position":1605}"#).await;
        client.handle_line(r#"{"Event":"WheelMove","state":"complete","position":2}"#).await;

        let status = client.status().await;
        assert_eq!(status.focuser_position, Some(1605));
        assert!(status.lp_filter);
    }

    #[tokio::test]
    async fn malformed_and_uncorrelated_frames_are_dropped() {
        let bus = EventBus::new(16);
        let client = offline_client(&bus);
        client.handle_line("{not json").await;
        client.handle_line(r#"{"id":99,"jsonrpc":"2.0","code":0,"result":0}"#).await;
        client.handle_line("").await;
        assert_eq!(client.pending_requests().await, 0);
        assert_eq!(client.status().await, DeviceStatus::default());
    }

    #[tokio::test]
    async fn injected_event_reaches_bus_through_reader() {
        let device = spawn_fake_device(true).await;
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_kind(EventKind::Annotation);
        let client = Arc::new(DeviceClient::new(
            TelescopeId::from("T1"),
            test_config(device.port, Duration::from_secs(5)),
            bus.clone(),
        ));
        let Ok(()) = client.connect().await else {
            panic!("connect failed");
        };
        let _ = device
            .inject
            .send(r#"{"Event":"Annotate","result":{"annotations":[{"names":["M 31"]}]}}"#.to_string())
            .await;

        let Ok(Ok(DeviceEvent::Annotation { result, .. })) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        else {
            panic!("expected an annotation");
        };
        assert!(result.get("annotations").is_some());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn refresh_merges_device_view_and_coordinates() {
        let mut device = spawn_scripted_device(&[
            (
                "get_device_state",
                json!({"pi_status": {"temp": 21.5, "battery_capacity": 64}, "focuser": {"step": 1720}}),
            ),
            (
                "get_view_state",
                json!({"View": {"state": "working", "stage": "Stack", "mode": "star", "target_name": "M 42"}}),
            ),
            ("scope_get_equ_coord", json!({"ra": 5.59, "dec": -5.39})),
        ])
        .await;
        let bus = EventBus::new(64);
        let mut status_rx = bus.subscribe_kind(EventKind::Status);
        let mut mode_rx = bus.subscribe_kind(EventKind::ClientModeChanged);
        let client = Arc::new(DeviceClient::new(
            TelescopeId::from("T1"),
            test_config(device.port, Duration::from_secs(5)),
            bus.clone(),
        ));
        let Ok(()) = client.connect().await else {
            panic!("connect failed");
        };
        let Ok(()) = client.refresh_state().await else {
            panic!("refresh failed");
        };
        // the refresh task also runs once on connect
        device.expect_method("scope_get_equ_coord").await;
        device.expect_method("scope_get_equ_coord").await;

        let status = client.status().await;
        assert_eq!(status.temperature, Some(21.5));
        assert_eq!(status.battery_capacity, Some(64));
        assert_eq!(status.focuser_position, Some(1720));
        assert_eq!(status.view_state.as_deref(), Some("working"));
        assert_eq!(status.stage.as_deref(), Some("Stack"));
        assert_eq!(status.mode.as_deref(), Some("star"));
        assert_eq!(status.target_name.as_deref(), Some("M 42"));
        assert_eq!((status.ra, status.dec), (Some(5.59), Some(-5.39)));
        assert_eq!(status.client_mode, Some(ClientMode::Stacking));

        let Ok(Ok(DeviceEvent::Status { telescope_id, changes, .. })) =
            tokio::time::timeout(Duration::from_secs(5), status_rx.recv()).await
        else {
            panic!("expected a status event");
        };
        assert_eq!(telescope_id.as_str(), "T1");
        assert!(!changes.is_empty());

        let Ok(Ok(DeviceEvent::ClientModeChanged { old_mode, new_mode, .. })) =
            tokio::time::timeout(Duration::from_secs(5), mode_rx.recv()).await
        else {
            panic!("expected the refresh to set the mode");
        };
        assert_eq!((old_mode, new_mode), (None, Some(ClientMode::Stacking)));

        let _ = device
            .inject
            .send(r#"{"Event":"View","state":"cancel","stage":"Stack"}"#.to_string())
            .await;
        let Ok(Ok(DeviceEvent::ClientModeChanged { old_mode, new_mode, .. })) =
            tokio::time::timeout(Duration::from_secs(5), mode_rx.recv()).await
        else {
            panic!("expected the view event to clear the mode");
        };
        assert_eq!((old_mode, new_mode), (Some(ClientMode::Stacking), None));
        let status = client.status().await;
        assert_eq!(status.view_state.as_deref(), Some("cancel"));
        assert_eq!(status.client_mode, None);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn connect_with_retry_waits_for_a_late_device() {
        let Ok(placeholder) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = placeholder.local_addr() else {
            panic!("no local addr");
        };
        drop(placeholder);

        let mut config = test_config(addr.port(), Duration::from_secs(5));
        config.connection.reconnect.max_attempts = Some(100);
        let client = Arc::new(DeviceClient::new(TelescopeId::from("T1"), config, EventBus::new(16)));
        let connecting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.connect_with_retry().await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!client.is_online().await);
        let Ok(listener) = TcpListener::bind(addr).await else {
            panic!("rebind failed");
        };
        let _device = serve_fake_device(listener, Replies::Echo);

        let Ok(Ok(Ok(()))) = tokio::time::timeout(Duration::from_secs(5), connecting).await else {
            panic!("expected a connection once the device listens");
        };
        assert!(client.is_online().await);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn connect_with_retry_gives_up_and_reports_loss() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_kind(EventKind::ConnectionLost);
        let Ok(placeholder) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = placeholder.local_addr() else {
            panic!("no local addr");
        };
        drop(placeholder);

        let client = Arc::new(DeviceClient::new(
            TelescopeId::from("T1"),
            test_config(addr.port(), Duration::from_secs(1)),
            bus.clone(),
        ));
        assert!(matches!(
            client.connect_with_retry().await,
            Err(GatewayError::Connection(_))
        ));
        let Ok(DeviceEvent::ConnectionLost { telescope_id, .. }) = rx.recv().await else {
            panic!("expected a connection-lost event");
        };
        assert_eq!(telescope_id.as_str(), "T1");
        assert!(!client.is_online().await);
    }

    struct FlagMonitor(AtomicBool);

    #[async_trait]
    impl ConditionMonitor for FlagMonitor {
        fn name(&self) -> &str {
            "dew_heater"
        }

        async fn check(&self) -> Result<bool, GatewayError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn monitor_publishes_transitions() {
        let device = spawn_fake_device(true).await;
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe_kind(EventKind::ConditionChanged);
        let flag = Arc::new(FlagMonitor(AtomicBool::new(false)));
        let client = Arc::new(
            DeviceClient::new(
                TelescopeId::from("T1"),
                test_config(device.port, Duration::from_secs(5)),
                bus.clone(),
            )
            .with_monitor(Arc::clone(&flag) as Arc<dyn ConditionMonitor>, Duration::from_millis(20)),
        );
        let Ok(()) = client.connect().await else {
            panic!("connect failed");
        };

        let Ok(Ok(DeviceEvent::ConditionChanged { active, .. })) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        else {
            panic!("expected the initial observation");
        };
        assert!(!active);

        flag.0.store(true, Ordering::SeqCst);
        let Ok(Ok(DeviceEvent::ConditionChanged { active, condition, .. })) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        else {
            panic!("expected a transition");
        };
        assert!(active);
        assert_eq!(condition, "dew_heater");
        client.disconnect().await;
    }
}
