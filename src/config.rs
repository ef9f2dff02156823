//! Gateway configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Interval settings are clamped to at
//! least one second.

use std::net::SocketAddr;
use std::time::Duration;

use crate::device::DeviceClientConfig;
use crate::domain::TelescopeId;
use crate::error::GatewayError;
use crate::federation::RemoteController;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// A locally attached telescope from `TELESCOPES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelescopeEndpoint {
    /// Telescope identifier.
    pub telescope_id: TelescopeId,
    /// Device host.
    pub host: String,
    /// Device port.
    pub port: u16,
}

/// Top-level gateway configuration.
///
/// Loaded once at startup via [`GatewayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:8765`).
    pub listen_addr: SocketAddr,

    /// Heartbeat period for inbound WebSocket sessions.
    pub ws_heartbeat_interval: Duration,

    /// Capacity of the EventBus broadcast channel.
    pub event_bus_capacity: usize,

    /// Device TCP open timeout.
    pub device_connect_timeout: Duration,

    /// Device read timeout; silence longer than this is a dead link.
    pub device_read_timeout: Duration,

    /// Device write timeout.
    pub device_write_timeout: Duration,

    /// Reconnect attempts before a device is reported lost.
    pub device_max_reconnect_attempts: u32,

    /// Deadline for a correlated device response.
    pub device_request_timeout: Duration,

    /// Device heartbeat probe period.
    pub device_heartbeat_interval: Duration,

    /// Device aggregate state refresh period.
    pub device_refresh_interval: Duration,

    /// Local devices to connect at startup.
    pub telescopes: Vec<TelescopeEndpoint>,

    /// Peer gateways to link at startup.
    pub remote_controllers: Vec<RemoteController>,

    /// Subscriber output format.
    pub log_format: LogFormat,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8765)),
            ws_heartbeat_interval: Duration::from_secs(30),
            event_bus_capacity: 1024,
            device_connect_timeout: Duration::from_secs(10),
            device_read_timeout: Duration::from_secs(30),
            device_write_timeout: Duration::from_secs(10),
            device_max_reconnect_attempts: 5,
            device_request_timeout: Duration::from_secs(10),
            device_heartbeat_interval: Duration::from_secs(5),
            device_refresh_interval: Duration::from_secs(30),
            telescopes: Vec::new(),
            remote_controllers: Vec::new(),
            log_format: LogFormat::Text,
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if `LISTEN_ADDR`,
    /// `TELESCOPES` or `REMOTE_CONTROLLERS` is set but malformed.
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let listen_addr: SocketAddr = match std::env::var("LISTEN_ADDR") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| GatewayError::InvalidRequest(format!("LISTEN_ADDR: {e}")))?,
            Err(_) => defaults.listen_addr,
        };

        let telescopes = parse_telescopes(&std::env::var("TELESCOPES").unwrap_or_default())?;
        let remote_controllers = parse_remote_controllers(&std::env::var("REMOTE_CONTROLLERS").unwrap_or_default())?;

        let log_format = match std::env::var("LOG_FORMAT").ok().as_deref() {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            listen_addr,
            ws_heartbeat_interval: parse_env_secs("WS_HEARTBEAT_INTERVAL_SECS", defaults.ws_heartbeat_interval),
            event_bus_capacity: parse_env("EVENT_BUS_CAPACITY", defaults.event_bus_capacity).max(1),
            device_connect_timeout: parse_env_secs("DEVICE_CONNECT_TIMEOUT_SECS", defaults.device_connect_timeout),
            device_read_timeout: parse_env_secs("DEVICE_READ_TIMEOUT_SECS", defaults.device_read_timeout),
            device_write_timeout: parse_env_secs("DEVICE_WRITE_TIMEOUT_SECS", defaults.device_write_timeout),
            device_max_reconnect_attempts: parse_env(
                "DEVICE_MAX_RECONNECT_ATTEMPTS",
                defaults.device_max_reconnect_attempts,
            ),
            device_request_timeout: parse_env_secs("DEVICE_REQUEST_TIMEOUT_SECS", defaults.device_request_timeout),
            device_heartbeat_interval: parse_env_secs(
                "DEVICE_HEARTBEAT_INTERVAL_SECS",
                defaults.device_heartbeat_interval,
            ),
            device_refresh_interval: parse_env_secs("DEVICE_REFRESH_INTERVAL_SECS", defaults.device_refresh_interval),
            telescopes,
            remote_controllers,
            log_format,
        })
    }

    /// Device client settings for `endpoint`.
    #[must_use]
    pub fn device_client_config(&self, endpoint: &TelescopeEndpoint) -> DeviceClientConfig {
        let mut config = DeviceClientConfig::new(endpoint.host.clone(), endpoint.port);
        config.connection.connect_timeout = self.device_connect_timeout;
        config.connection.read_timeout = self.device_read_timeout;
        config.connection.write_timeout = self.device_write_timeout;
        config.connection.reconnect.max_attempts = Some(self.device_max_reconnect_attempts);
        config.request_timeout = self.device_request_timeout;
        config.heartbeat_interval = self.device_heartbeat_interval;
        config.refresh_interval = self.device_refresh_interval;
        config
    }
}

/// Parses `id=host:port,...`. Blank input yields an empty list.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] naming the first malformed entry.
pub fn parse_telescopes(raw: &str) -> Result<Vec<TelescopeEndpoint>, GatewayError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || GatewayError::InvalidRequest(format!("TELESCOPES entry '{entry}' must be id=host:port"));
            let (id, address) = entry.split_once('=').ok_or_else(invalid)?;
            let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
            let port: u16 = port.parse().map_err(|_| invalid())?;
            if id.trim().is_empty() || host.trim().is_empty() {
                return Err(invalid());
            }
            Ok(TelescopeEndpoint {
                telescope_id: TelescopeId::new(id.trim()),
                host: host.trim().to_string(),
                port,
            })
        })
        .collect()
}

/// Parses `host:port/telescope_id,...`. Blank input yields an empty list.
///
/// # Errors
///
/// Returns the error of [`RemoteController::parse`] for the first
/// malformed entry.
pub fn parse_remote_controllers(raw: &str) -> Result<Vec<RemoteController>, GatewayError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(RemoteController::parse)
        .collect()
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses a whole-second interval, never below one second.
fn parse_env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_env(key, default.as_secs()).max(1))
}
