//! Mutable telemetry snapshot for one device.
//!
//! [`DeviceStatus`] is only mutated by the owning
//! [`DeviceClient`](crate::device::DeviceClient) handlers. Every `apply_*`
//! method returns the fields that actually changed so callers can publish a
//! compact `changes` object next to the full snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Object of changed field names to their new values.
pub type StatusChanges = Map<String, Value>;

/// What the device is currently doing, as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    /// Live preview exposures.
    ContinuousExposure,
    /// RTSP video streaming.
    Streaming,
    /// Deep-sky stacking.
    Stacking,
}

impl ClientMode {
    /// Derives the client mode from a view `(stage, state)` pair.
    ///
    /// `state == "cancel"` always clears the mode. Stages outside the known
    /// set leave `current` untouched.
    #[must_use]
    pub fn derive(stage: Option<&str>, state: Option<&str>, current: Option<Self>) -> Option<Self> {
        if state == Some("cancel") {
            return None;
        }
        match stage {
            Some("ContinuousExposure") => Some(Self::ContinuousExposure),
            Some("RTSP") => Some(Self::Streaming),
            Some("Stack") => Some(Self::Stacking),
            _ => current,
        }
    }
}

/// Partial power/thermal telemetry. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PiStatusUpdate {
    /// Board temperature in °C.
    #[serde(default)]
    pub temp: Option<f64>,
    /// Charger state label (e.g. `"Charging"`, `"Full"`).
    #[serde(default)]
    pub charger_status: Option<String>,
    /// Whether external power is present.
    #[serde(default)]
    pub charge_online: Option<bool>,
    /// Battery percentage.
    #[serde(default)]
    pub battery_capacity: Option<i64>,
}

/// View state reported by the device, from a `View` event or `get_view_state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    /// View lifecycle state (`"working"`, `"complete"`, `"cancel"`, ...).
    #[serde(default)]
    pub state: Option<String>,
    /// Active stage (`"ContinuousExposure"`, `"RTSP"`, `"Stack"`, `"AutoGoto"`, ...).
    #[serde(default)]
    pub stage: Option<String>,
    /// Observation mode (`"star"`, `"moon"`, ...).
    #[serde(default)]
    pub mode: Option<String>,
    /// Name of the current target.
    #[serde(default)]
    pub target_name: Option<String>,
    /// Light-pollution filter flag when the view carries one.
    #[serde(default)]
    pub lp_filter: Option<bool>,
}

/// Focuser part of the aggregate device state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocuserState {
    /// Absolute focuser step.
    #[serde(default)]
    pub step: Option<i64>,
}

/// Aggregate device state as returned by `get_device_state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateSnapshot {
    /// Power and thermal telemetry.
    #[serde(default)]
    pub pi_status: Option<PiStatusUpdate>,
    /// Focuser position.
    #[serde(default)]
    pub focuser: Option<FocuserState>,
}

/// A client-mode transition produced by a view-state merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientModeChange {
    /// Mode before the merge.
    pub old: Option<ClientMode>,
    /// Mode after the merge.
    pub new: Option<ClientMode>,
}

/// Telemetry snapshot for one device. Reset on every connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Board temperature in °C.
    pub temperature: Option<f64>,
    /// Charger state label.
    pub charger_status: Option<String>,
    /// Whether external power is present.
    pub charge_online: Option<bool>,
    /// Battery percentage.
    pub battery_capacity: Option<i64>,
    /// Active view stage.
    pub stage: Option<String>,
    /// View lifecycle state.
    pub view_state: Option<String>,
    /// Observation mode.
    pub mode: Option<String>,
    /// Current target name.
    pub target_name: Option<String>,
    /// Absolute focuser position.
    pub focuser_position: Option<i64>,
    /// Right ascension in hours.
    pub ra: Option<f64>,
    /// Declination in degrees.
    pub dec: Option<f64>,
    /// Frames accepted into the current stack.
    pub stacked_frames: u64,
    /// Frames rejected from the current stack.
    pub dropped_frames: u64,
    /// Light-pollution filter in the optical path.
    pub lp_filter: bool,
    /// Derived client mode; `None` when idle.
    pub client_mode: Option<ClientMode>,
    /// When any field last changed.
    pub last_update: Option<DateTime<Utc>>,
}

/// Assigns `new` to `slot` when different and records the change.
fn set_field<T>(slot: &mut T, new: T, key: &str, changes: &mut StatusChanges)
where
    T: PartialEq + Serialize,
{
    if *slot != new {
        changes.insert(key.to_string(), serde_json::to_value(&new).unwrap_or(Value::Null));
        *slot = new;
    }
}

impl DeviceStatus {
    /// Applies a partial power/thermal update; absent fields are untouched.
    pub fn apply_pi_status(&mut self, update: &PiStatusUpdate) -> StatusChanges {
        let mut changes = StatusChanges::new();
        if let Some(temp) = update.temp {
            set_field(&mut self.temperature, Some(temp), "temperature", &mut changes);
        }
        if let Some(status) = &update.charger_status {
            set_field(
                &mut self.charger_status,
                Some(status.clone()),
                "charger_status",
                &mut changes,
            );
        }
        if let Some(online) = update.charge_online {
            set_field(&mut self.charge_online, Some(online), "charge_online", &mut changes);
        }
        if let Some(capacity) = update.battery_capacity {
            set_field(
                &mut self.battery_capacity,
                Some(capacity),
                "battery_capacity",
                &mut changes,
            );
        }
        self.touch(&changes);
        changes
    }

    /// Updates stack counters from a `Stack` event.
    pub fn apply_stack(&mut self, stacked: Option<u64>, dropped: Option<u64>) -> StatusChanges {
        let mut changes = StatusChanges::new();
        if let Some(stacked) = stacked {
            set_field(&mut self.stacked_frames, stacked, "stacked_frames", &mut changes);
        }
        if let Some(dropped) = dropped {
            set_field(&mut self.dropped_frames, dropped, "dropped_frames", &mut changes);
        }
        self.touch(&changes);
        changes
    }

    /// Updates the focuser position when one is reported.
    pub fn apply_focuser_position(&mut self, position: Option<i64>) -> StatusChanges {
        let mut changes = StatusChanges::new();
        if let Some(position) = position {
            set_field(
                &mut self.focuser_position,
                Some(position),
                "focuser_position",
                &mut changes,
            );
        }
        self.touch(&changes);
        changes
    }

    /// Applies a filter-wheel move. Only a completed move changes the
    /// filter flag; position 2 is the light-pollution filter.
    pub fn apply_wheel_move(&mut self, state: Option<&str>, position: Option<i64>) -> StatusChanges {
        let mut changes = StatusChanges::new();
        if state == Some("complete") {
            set_field(&mut self.lp_filter, position == Some(2), "lp_filter", &mut changes);
        }
        self.touch(&changes);
        changes
    }

    /// Sets the mount's equatorial coordinates.
    pub fn apply_coordinates(&mut self, ra: f64, dec: f64) -> StatusChanges {
        let mut changes = StatusChanges::new();
        set_field(&mut self.ra, Some(ra), "ra", &mut changes);
        set_field(&mut self.dec, Some(dec), "dec", &mut changes);
        self.touch(&changes);
        changes
    }

    /// Merges the aggregate device state from a periodic refresh.
    pub fn apply_device_state(&mut self, snapshot: &DeviceStateSnapshot) -> StatusChanges {
        let mut changes = match &snapshot.pi_status {
            Some(pi) => self.apply_pi_status(pi),
            None => StatusChanges::new(),
        };
        if let Some(focuser) = &snapshot.focuser {
            changes.extend(self.apply_focuser_position(focuser.step));
        }
        changes
    }

    /// Merges a view state and re-derives the client mode.
    ///
    /// This is the single code path for both `View` events and the periodic
    /// refresh. Returns the changed fields and, when the mode moved, the
    /// transition.
    pub fn apply_view_state(&mut self, view: &ViewState) -> (StatusChanges, Option<ClientModeChange>) {
        let mut changes = StatusChanges::new();
        if let Some(state) = &view.state {
            set_field(&mut self.view_state, Some(state.clone()), "view_state", &mut changes);
        }
        if let Some(stage) = &view.stage {
            set_field(&mut self.stage, Some(stage.clone()), "stage", &mut changes);
        }
        if let Some(mode) = &view.mode {
            set_field(&mut self.mode, Some(mode.clone()), "mode", &mut changes);
        }
        if let Some(target) = &view.target_name {
            set_field(&mut self.target_name, Some(target.clone()), "target_name", &mut changes);
        }
        if let Some(lp) = view.lp_filter {
            set_field(&mut self.lp_filter, lp, "lp_filter", &mut changes);
        }

        let old = self.client_mode;
        let new = ClientMode::derive(view.stage.as_deref(), view.state.as_deref(), old);
        let transition = (old != new).then_some(ClientModeChange { old, new });
        set_field(&mut self.client_mode, new, "client_mode", &mut changes);

        self.touch(&changes);
        (changes, transition)
    }

    fn touch(&mut self, changes: &StatusChanges) {
        if !changes.is_empty() {
            self.last_update = Some(Utc::now());
        }
    }
}
