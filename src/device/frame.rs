//! Device wire protocol frames.
//!
//! One JSON object per line. Requests carry a numeric `id`; responses echo
//! it next to a `"jsonrpc"` key; asynchronous events carry an `"Event"` key
//! naming their kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{PiStatusUpdate, ViewState};
use crate::error::GatewayError;

/// Outgoing request frame.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRequest {
    /// Correlation id.
    pub id: u64,
    /// Device method name.
    pub method: String,
    /// Method parameters, omitted when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Response frame correlated to a request by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResponse {
    /// Id of the request being answered.
    pub id: u64,
    /// Protocol marker, always `"2.0"`.
    pub jsonrpc: String,
    /// Device-side timestamp.
    #[serde(rename = "Timestamp", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Echo of the request method.
    #[serde(default)]
    pub method: Option<String>,
    /// Zero on success.
    #[serde(default)]
    pub code: i64,
    /// Method result (object or scalar).
    #[serde(default)]
    pub result: Value,
    /// Error text accompanying a non-zero code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceResponse {
    /// Returns `true` when the device reported success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Converts the response into its result, mapping a non-zero code to
    /// [`GatewayError::Command`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Command`] when `code != 0`.
    pub fn into_result(self) -> Result<Value, GatewayError> {
        if self.is_success() {
            return Ok(self.result);
        }
        let method = self.method.as_deref().unwrap_or("request");
        let detail = self.error.as_deref().unwrap_or("device reported an error");
        Err(GatewayError::Command(format!("{method} failed with code {}: {detail}", self.code)))
    }
}

/// Stacking progress payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StackFrame {
    /// Stack state label.
    #[serde(default)]
    pub state: Option<String>,
    /// Frames stacked so far.
    #[serde(default)]
    pub stacked_frame: Option<u64>,
    /// Frames dropped so far.
    #[serde(default)]
    pub dropped_frame: Option<u64>,
}

/// Focuser move payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FocuserMoveFrame {
    /// Move state label.
    #[serde(default)]
    pub state: Option<String>,
    /// Absolute position.
    #[serde(default)]
    pub position: Option<i64>,
}

/// Filter wheel move payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WheelMoveFrame {
    /// Move state label; `"complete"` when the wheel has settled.
    #[serde(default)]
    pub state: Option<String>,
    /// Wheel slot.
    #[serde(default)]
    pub position: Option<i64>,
}

/// Annotation payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnotateFrame {
    /// Raw annotation result.
    #[serde(default)]
    pub result: Value,
}

/// Asynchronous event frame, tagged by its `"Event"` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Event")]
pub enum EventFrame {
    /// Power/thermal telemetry (partial).
    PiStatus(PiStatusUpdate),
    /// Stacking progress.
    Stack(StackFrame),
    /// Focuser moved.
    FocuserMove(FocuserMoveFrame),
    /// Filter wheel moved.
    WheelMove(WheelMoveFrame),
    /// View state changed.
    View(ViewState),
    /// Annotation result.
    Annotate(AnnotateFrame),
    /// Any event kind the gateway does not track.
    #[serde(other)]
    Unknown,
}

/// A decoded inbound line.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Asynchronous event.
    Event(EventFrame),
    /// Response to a request.
    Response(DeviceResponse),
    /// Valid JSON that is neither.
    Other,
}

/// Decodes one inbound line.
///
/// # Errors
///
/// Returns [`GatewayError::Parse`] for malformed JSON or a known frame
/// shape with mistyped fields.
pub fn parse_frame(line: &str) -> Result<InboundFrame, GatewayError> {
    let value: Value = serde_json::from_str(line)?;
    if value.get("Event").is_some() {
        return Ok(InboundFrame::Event(serde_json::from_value(value)?));
    }
    if value.get("jsonrpc").is_some() {
        return Ok(InboundFrame::Response(serde_json::from_value(value)?));
    }
    Ok(InboundFrame::Other)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_missing_params() {
        let req = DeviceRequest {
            id: 10_001,
            method: "scope_park".to_string(),
            params: None,
        };
        let Ok(json) = serde_json::to_string(&req) else {
            panic!("serialization failed");
        };
        assert_eq!(json, r#"{"id":10001,"method":"scope_park"}"#);
    }

    #[test]
    fn parses_response() {
        let line = r#"{"id":10002,"jsonrpc":"2.0","Timestamp":"9507.2","method":"get_control_value","code":0,"result":{"value":80}}"#;
        let Ok(InboundFrame::Response(resp)) = parse_frame(line) else {
            panic!("expected a response");
        };
        assert_eq!(resp.id, 10_002);
        assert!(resp.is_success());
        assert_eq!(resp.result.get("value"), Some(&serde_json::json!(80)));
    }

    #[test]
    fn error_code_becomes_command_error() {
        let line = r#"{"id":7,"jsonrpc":"2.0","method":"scope_goto","code":207,"error":"fail to operate"}"#;
        let Ok(InboundFrame::Response(resp)) = parse_frame(line) else {
            panic!("expected a response");
        };
        let Err(GatewayError::Command(msg)) = resp.into_result() else {
            panic!("expected a command error");
        };
        assert!(msg.contains("fail to operate"));
        assert!(msg.contains("207"));
    }

    #[test]
    fn parses_partial_pi_status() {
        let line = r#"{"Event":"PiStatus","Timestamp":"9507.2","temp":10.0}"#;
        let Ok(InboundFrame::Event(EventFrame::PiStatus(update))) = parse_frame(line) else {
            panic!("expected a PiStatus event");
        };
        assert_eq!(update.temp, Some(10.0));
        assert!(update.battery_capacity.is_none());
    }

    #[test]
    fn unknown_event_kind_is_tolerated() {
        let line = r#"{"Event":"AutoGoto","state":"working"}"#;
        let Ok(InboundFrame::Event(EventFrame::Unknown)) = parse_frame(line) else {
            panic!("expected an unknown event");
        };
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(parse_frame("{\"Event\":"), Err(GatewayError::Parse(_))));
        assert!(matches!(
            parse_frame(r#"{"Event":"PiStatus","temp":"hot"}"#),
            Err(GatewayError::Parse(_))
        ));
    }

    #[test]
    fn other_json_is_neither() {
        assert!(matches!(parse_frame(r#"{"hello":1}"#), Ok(InboundFrame::Other)));
    }
}
