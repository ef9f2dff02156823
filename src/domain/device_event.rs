//! Internal events raised by device protocol clients.
//!
//! Every asynchronous device frame that changes state is turned into a
//! [`DeviceEvent`] and published on the [`super::EventBus`]. The WebSocket
//! layer fans them out to subscribed UI connections.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::device_status::{ClientMode, DeviceStatus, StatusChanges};
use super::TelescopeId;

/// Discriminator for [`DeviceEvent`], used to subscribe to one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Power/thermal telemetry or any other status snapshot change.
    Status,
    /// Stacking progress.
    StackProgress,
    /// Plate annotation result.
    Annotation,
    /// Focuser moved.
    FocuserMove,
    /// Filter wheel moved.
    WheelMove,
    /// View state changed.
    ViewState,
    /// Derived client mode changed.
    ClientModeChanged,
    /// An attached condition monitor flipped.
    ConditionChanged,
    /// The device connection was permanently lost.
    ConnectionLost,
}

/// Event published by a device client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Status telemetry changed.
    Status {
        /// Source telescope.
        telescope_id: TelescopeId,
        /// Full snapshot after the change.
        status: DeviceStatus,
        /// Only the fields that changed.
        changes: StatusChanges,
        /// When the change was applied.
        timestamp: DateTime<Utc>,
    },

    /// A frame was stacked or dropped.
    StackProgress {
        /// Source telescope.
        telescope_id: TelescopeId,
        /// Stacked frame count.
        stacked_frames: u64,
        /// Dropped frame count.
        dropped_frames: u64,
        /// Stack state label from the device.
        state: Option<String>,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Objects annotated on the latest frame.
    Annotation {
        /// Source telescope.
        telescope_id: TelescopeId,
        /// Raw annotation result as reported by the device.
        result: Value,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Focuser reached a new position.
    FocuserMove {
        /// Source telescope.
        telescope_id: TelescopeId,
        /// New absolute position, if reported.
        position: Option<i64>,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Filter wheel moved.
    WheelMove {
        /// Source telescope.
        telescope_id: TelescopeId,
        /// Move state (`"complete"` when done).
        state: Option<String>,
        /// Wheel slot.
        position: Option<i64>,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// View stage/state changed.
    ViewState {
        /// Source telescope.
        telescope_id: TelescopeId,
        /// Current stage.
        stage: Option<String>,
        /// Current state.
        state: Option<String>,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Derived client mode changed.
    ClientModeChanged {
        /// Source telescope.
        telescope_id: TelescopeId,
        /// Mode before the change.
        old_mode: Option<ClientMode>,
        /// Mode after the change.
        new_mode: Option<ClientMode>,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A condition monitor attached to the client changed state.
    ConditionChanged {
        /// Source telescope.
        telescope_id: TelescopeId,
        /// Monitor name.
        condition: String,
        /// New value of the condition.
        active: bool,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Reconnection was exhausted; the device is offline until reconnected.
    ConnectionLost {
        /// Source telescope.
        telescope_id: TelescopeId,
        /// Why the link was given up.
        reason: String,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl DeviceEvent {
    /// Returns the telescope this event originated from.
    #[must_use]
    pub fn telescope_id(&self) -> &TelescopeId {
        match self {
            Self::Status { telescope_id, .. }
            | Self::StackProgress { telescope_id, .. }
            | Self::Annotation { telescope_id, .. }
            | Self::FocuserMove { telescope_id, .. }
            | Self::WheelMove { telescope_id, .. }
            | Self::ViewState { telescope_id, .. }
            | Self::ClientModeChanged { telescope_id, .. }
            | Self::ConditionChanged { telescope_id, .. }
            | Self::ConnectionLost { telescope_id, .. } => telescope_id,
        }
    }

    /// Returns the kind discriminator.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Status { .. } => EventKind::Status,
            Self::StackProgress { .. } => EventKind::StackProgress,
            Self::Annotation { .. } => EventKind::Annotation,
            Self::FocuserMove { .. } => EventKind::FocuserMove,
            Self::WheelMove { .. } => EventKind::WheelMove,
            Self::ViewState { .. } => EventKind::ViewState,
            Self::ClientModeChanged { .. } => EventKind::ClientModeChanged,
            Self::ConditionChanged { .. } => EventKind::ConditionChanged,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_id_accessors() {
        let event = DeviceEvent::FocuserMove {
            telescope_id: TelescopeId::from("T1"),
            position: Some(1500),
            timestamp: Utc::now(),
        };
        assert_eq!(event.kind(), EventKind::FocuserMove);
        assert_eq!(event.telescope_id().as_str(), "T1");
    }

    #[test]
    fn client_mode_change_serializes_with_tag() {
        let event = DeviceEvent::ClientModeChanged {
            telescope_id: TelescopeId::from("T1"),
            old_mode: None,
            new_mode: Some(ClientMode::Stacking),
            timestamp: Utc::now(),
        };
        let Ok(json) = serde_json::to_value(&event) else {
            panic!("serialization failed");
        };
        assert_eq!(json["event_type"], "client_mode_changed");
        assert_eq!(json["new_mode"], "stacking");
        assert!(json["old_mode"].is_null());
    }
}
