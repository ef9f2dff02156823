//! WebSocket message types: envelope, type discriminator and payloads.
//!
//! The same envelope is spoken by UI sessions and by federated peer
//! gateways:
//!
//! ```json
//! {"id": "…", "type": "control_command", "telescope_id": "T1",
//!  "timestamp": 1718000000.25, "payload": {"action": "park"}}
//! ```

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::subscription::SubscriptionTopic;
use crate::domain::TelescopeId;
use crate::error::GatewayError;

/// Seconds since the Unix epoch, with microsecond resolution.
#[must_use]
pub fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Top-level WebSocket message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    /// Client-provided id for requests; server-generated otherwise.
    #[serde(default = "new_message_id")]
    pub id: String,
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: WsMessageType,
    /// Telescope the message concerns, if any.
    #[serde(default)]
    pub telescope_id: Option<TelescopeId>,
    /// Epoch seconds.
    #[serde(default = "epoch_now")]
    pub timestamp: f64,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
}

/// Discriminator for WebSocket message types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WsMessageType {
    /// Telemetry or device event for a telescope.
    StatusUpdate,
    /// A telescope became reachable through this gateway.
    TelescopeDiscovered,
    /// A telescope is no longer reachable.
    TelescopeLost,
    /// Plate annotation result.
    AnnotationEvent,
    /// Action request for a telescope.
    ControlCommand,
    /// Outcome of a control command.
    CommandResponse,
    /// Liveness probe in either direction.
    Heartbeat,
    /// Server-side error notice.
    Error,
    /// Add topics to the connection's subscriptions.
    Subscribe,
    /// Remove topics from the connection's subscriptions.
    Unsubscribe,
}

/// Payload of a `control_command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommandPayload {
    /// Action name from the action table.
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Whether the sender waits for a `command_response`.
    #[serde(default)]
    pub response_expected: bool,
}

/// Payload of a `command_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponsePayload {
    /// Id of the `control_command` being answered.
    pub command_id: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Action result on success.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error text on failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload of `subscribe` and `unsubscribe`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    /// Topic names; unknown names are ignored.
    #[serde(default)]
    pub subscription_types: Vec<String>,
    /// Apply to every currently registered telescope.
    #[serde(default)]
    pub all_telescopes: bool,
}

impl SubscriptionPayload {
    /// Creates a payload for `topics`.
    #[must_use]
    pub fn new(topics: &[SubscriptionTopic], all_telescopes: bool) -> Self {
        Self {
            subscription_types: topics.iter().map(|t| t.as_str().to_string()).collect(),
            all_telescopes,
        }
    }

    /// Recognized topics, in request order.
    #[must_use]
    pub fn topics(&self) -> Vec<SubscriptionTopic> {
        self.subscription_types
            .iter()
            .filter_map(|name| {
                let topic = SubscriptionTopic::parse(name);
                if topic.is_none() {
                    tracing::debug!(topic = %name, "ignoring unknown subscription topic");
                }
                topic
            })
            .collect()
    }
}

impl WsMessage {
    /// Creates a message with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(msg_type: WsMessageType, telescope_id: Option<TelescopeId>, payload: Value) -> Self {
        Self {
            id: new_message_id(),
            msg_type,
            telescope_id,
            timestamp: epoch_now(),
            payload,
        }
    }

    /// Heartbeat carrying no payload.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(WsMessageType::Heartbeat, None, json!({}))
    }

    /// Error notice.
    #[must_use]
    pub fn error(telescope_id: Option<TelescopeId>, message: &str) -> Self {
        Self::new(WsMessageType::Error, telescope_id, json!({ "message": message }))
    }

    /// Action request.
    #[must_use]
    pub fn control_command(
        telescope_id: TelescopeId,
        action: &str,
        parameters: Map<String, Value>,
        response_expected: bool,
    ) -> Self {
        let payload = ControlCommandPayload {
            action: action.to_string(),
            parameters,
            response_expected,
        };
        Self::new(
            WsMessageType::ControlCommand,
            Some(telescope_id),
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    /// Response to the command with id `command_id`.
    #[must_use]
    pub fn command_response(
        command_id: &str,
        telescope_id: Option<TelescopeId>,
        outcome: &Result<Value, GatewayError>,
    ) -> Self {
        let payload = match outcome {
            Ok(result) => CommandResponsePayload {
                command_id: command_id.to_string(),
                success: true,
                result: Some(result.clone()),
                error: None,
            },
            Err(err) => CommandResponsePayload {
                command_id: command_id.to_string(),
                success: false,
                result: None,
                error: Some(err.to_string()),
            },
        };
        Self::new(
            WsMessageType::CommandResponse,
            telescope_id,
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    /// Subscribe (or unsubscribe) request for `telescope_id`.
    #[must_use]
    pub fn subscription(
        msg_type: WsMessageType,
        telescope_id: Option<TelescopeId>,
        topics: &[SubscriptionTopic],
        all_telescopes: bool,
    ) -> Self {
        let payload = SubscriptionPayload::new(topics, all_telescopes);
        Self::new(msg_type, telescope_id, serde_json::to_value(payload).unwrap_or_default())
    }

    /// Status update tagged with the topic it is delivered under.
    #[must_use]
    pub fn status_update(telescope_id: TelescopeId, topic: SubscriptionTopic, mut payload: Value) -> Self {
        if let Some(object) = payload.as_object_mut() {
            object.insert("topic".to_string(), Value::from(topic.as_str()));
        }
        Self::new(WsMessageType::StatusUpdate, Some(telescope_id), payload)
    }

    /// A telescope became reachable.
    #[must_use]
    pub fn telescope_discovered(telescope_id: TelescopeId, route: &str, address: &str) -> Self {
        let payload = json!({ "telescope_id": telescope_id, "route": route, "address": address });
        Self::new(WsMessageType::TelescopeDiscovered, Some(telescope_id), payload)
    }

    /// A telescope is gone.
    #[must_use]
    pub fn telescope_lost(telescope_id: TelescopeId, reason: &str) -> Self {
        let payload = json!({ "telescope_id": telescope_id, "reason": reason });
        Self::new(WsMessageType::TelescopeLost, Some(telescope_id), payload)
    }

    /// Decodes the payload as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Parse`] if the payload does not match.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Serializes the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Parse`] if serialization fails.
    pub fn to_json(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_control_command() {
        let raw = r#"{"type":"control_command","telescope_id":"T1","payload":{"action":"park"}}"#;
        let Ok(msg) = serde_json::from_str::<WsMessage>(raw) else {
            panic!("envelope should parse");
        };
        assert_eq!(msg.msg_type, WsMessageType::ControlCommand);
        assert!(!msg.id.is_empty());
        assert!(msg.timestamp > 0.0);

        let Ok(cmd) = msg.payload_as::<ControlCommandPayload>() else {
            panic!("payload should parse");
        };
        assert_eq!(cmd.action, "park");
        assert!(cmd.parameters.is_empty());
        assert!(!cmd.response_expected);
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"id":"1","type":"launch_rocket","payload":{}}"#;
        assert!(serde_json::from_str::<WsMessage>(raw).is_err());
    }

    #[test]
    fn failed_command_response_carries_error_text() {
        let outcome = Err(GatewayError::timeout("scope_park", std::time::Duration::from_secs(10)));
        let msg = WsMessage::command_response("cmd-1", Some(TelescopeId::from("T1")), &outcome);
        let Ok(payload) = msg.payload_as::<CommandResponsePayload>() else {
            panic!("payload should parse");
        };
        assert!(!payload.success);
        assert_eq!(payload.command_id, "cmd-1");
        assert!(payload.result.is_none());
        assert!(payload.error.is_some_and(|e| e.contains("timeout")));
    }

    #[test]
    fn command_response_serializes_null_fields() {
        let msg = WsMessage::command_response("c", None, &Ok(json!({"parked": true})));
        let Ok(text) = msg.to_json() else {
            panic!("serialization failed");
        };
        assert!(text.contains(r#""error":null"#));
        assert!(text.contains(r#""telescope_id":null"#));
    }

    #[test]
    fn subscription_payload_skips_unknown_topics() {
        let payload = SubscriptionPayload {
            subscription_types: vec!["status".into(), "weather".into(), "ALL".into()],
            all_telescopes: false,
        };
        assert_eq!(
            payload.topics(),
            vec![SubscriptionTopic::Status, SubscriptionTopic::All]
        );
    }

    #[test]
    fn status_update_is_tagged_with_topic() {
        let msg = WsMessage::status_update(
            TelescopeId::from("T1"),
            SubscriptionTopic::Focus,
            json!({"position": 1500}),
        );
        assert_eq!(msg.payload.get("topic"), Some(&json!("focus")));
        assert_eq!(msg.telescope_id.as_ref().map(TelescopeId::as_str), Some("T1"));
    }
}
