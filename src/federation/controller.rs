//! Federation peer descriptor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::TelescopeId;
use crate::error::GatewayError;
use crate::reconnect::ReconnectPolicy;

/// Upper bound of the pre-jitter reconnect delay for remote links.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

fn default_max_reconnect_attempts() -> i32 {
    -1
}

fn default_reconnect_delay() -> f64 {
    5.0
}

fn default_heartbeat_interval() -> f64 {
    30.0
}

fn default_message_timeout() -> f64 {
    10.0
}

/// Shortest timing a link accepts; zero periods would stall the tickers.
pub const MIN_TIMING: Duration = Duration::from_millis(1);

/// Positive finite seconds, else `fallback`, never below [`MIN_TIMING`].
fn secs(value: f64, fallback: f64) -> Duration {
    let chosen = if value.is_finite() && value > 0.0 { value } else { fallback };
    Duration::try_from_secs_f64(chosen)
        .unwrap_or(Duration::ZERO)
        .max(MIN_TIMING)
}

/// A peer gateway that owns one telescope. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RemoteController {
    /// Peer host.
    pub host: String,
    /// Peer HTTP/WebSocket port.
    pub port: u16,
    /// Telescope reachable through the peer.
    #[schema(value_type = String)]
    pub telescope_id: TelescopeId,
    /// Explicit identity; defaults to `host:port/telescope_id`.
    #[serde(default)]
    pub controller_id: Option<String>,
    /// Reconnect bound; `-1` retries forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i32,
    /// Base reconnect delay in seconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: f64,
    /// Heartbeat period in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: f64,
    /// Deadline for correlated responses in seconds.
    #[serde(default = "default_message_timeout")]
    pub message_timeout_secs: f64,
}

impl RemoteController {
    /// Creates a descriptor with default timings.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, telescope_id: TelescopeId) -> Self {
        Self {
            host: host.into(),
            port,
            telescope_id,
            controller_id: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            message_timeout_secs: default_message_timeout(),
        }
    }

    /// Parses a `host:port/telescope_id` entry.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if any part is missing or
    /// the port is not a number.
    pub fn parse(entry: &str) -> Result<Self, GatewayError> {
        let invalid = || GatewayError::InvalidRequest(format!("invalid remote controller '{entry}', expected host:port/telescope_id"));
        let (address, telescope_id) = entry.trim().split_once('/').ok_or_else(invalid)?;
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || telescope_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(host, port, TelescopeId::from(telescope_id)))
    }

    /// Identity used as the manager key.
    #[must_use]
    pub fn controller_id(&self) -> String {
        self.controller_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}/{}", self.host, self.port, self.telescope_id))
    }

    /// Federation endpoint of the peer for this telescope.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}/ws/{}", self.host, self.port, self.telescope_id)
    }

    /// Backoff for this link: attempt `n` waits `reconnect_delay · 2ⁿ`
    /// capped at [`MAX_RECONNECT_DELAY`], plus jitter below
    /// `min(reconnect_delay, 1s)`.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let base = secs(self.reconnect_delay_secs, default_reconnect_delay());
        ReconnectPolicy {
            initial_delay: base.saturating_mul(2),
            max_delay: MAX_RECONNECT_DELAY,
            max_jitter: base.min(Duration::from_secs(1)),
            max_attempts: u32::try_from(self.max_reconnect_attempts).ok(),
        }
    }

    /// Heartbeat period.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval_secs, default_heartbeat_interval())
    }

    /// Response deadline.
    #[must_use]
    pub fn message_timeout(&self) -> Duration {
        secs(self.message_timeout_secs, default_message_timeout())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_entry_and_derives_identity() {
        let Ok(controller) = RemoteController::parse("peer.local:8765/T9") else {
            panic!("entry should parse");
        };
        assert_eq!(controller.telescope_id.as_str(), "T9");
        assert_eq!(controller.controller_id(), "peer.local:8765/T9");
        assert_eq!(controller.url(), "ws://peer.local:8765/ws/T9");
        assert_eq!(controller.reconnect_policy().max_attempts, None);
    }

    #[test]
    fn rejects_malformed_entries() {
        for entry in ["peer.local/T9", "peer.local:notaport/T9", ":8765/T9", "peer:8765/"] {
            assert!(RemoteController::parse(entry).is_err(), "{entry}");
        }
    }

    #[test]
    fn backoff_doubles_from_twice_the_delay() {
        let mut controller = RemoteController::new("h", 1, TelescopeId::from("T1"));
        controller.reconnect_delay_secs = 1.0;
        controller.max_reconnect_attempts = 3;
        let policy = controller.reconnect_policy();
        let delays: Vec<u64> = (1..=3).map(|n| policy.base_delay(n).as_secs()).collect();
        assert_eq!(delays, [2, 4, 8]);
        assert_eq!(policy.base_delay(10), MAX_RECONNECT_DELAY);
        assert_eq!(policy.max_attempts, Some(3));
        assert!(policy.max_jitter <= Duration::from_secs(1));
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{"host":"10.0.0.2","port":8765,"telescope_id":"T2"}"#;
        let Ok(controller) = serde_json::from_str::<RemoteController>(json) else {
            panic!("should deserialize");
        };
        assert_eq!(controller.max_reconnect_attempts, -1);
        assert_eq!(controller.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(controller.message_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn negative_timings_fall_back_to_defaults() {
        let mut controller = RemoteController::new("h", 1, TelescopeId::from("T1"));
        controller.message_timeout_secs = -3.0;
        assert_eq!(controller.message_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn zero_and_tiny_timings_never_yield_a_zero_period() {
        let mut controller = RemoteController::new("h", 1, TelescopeId::from("T1"));
        controller.heartbeat_interval_secs = 0.0;
        controller.message_timeout_secs = f64::NAN;
        controller.reconnect_delay_secs = 0.0;
        assert_eq!(controller.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(controller.message_timeout(), Duration::from_secs(10));
        assert_eq!(controller.reconnect_policy().initial_delay, Duration::from_secs(10));

        controller.heartbeat_interval_secs = 1e-12;
        assert_eq!(controller.heartbeat_interval(), MIN_TIMING);
        controller.heartbeat_interval_secs = 0.25;
        assert_eq!(controller.heartbeat_interval(), Duration::from_millis(250));
    }
}
