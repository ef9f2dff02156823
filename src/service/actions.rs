//! Telescope action table.
//!
//! UI `control_command`s name an action and carry loose JSON parameters.
//! [`TelescopeAction::parse`] validates both into a closed enum so every
//! action maps to exactly one device method at compile time.

use serde_json::{Map, Value, json};

use crate::error::GatewayError;

/// Filter wheel slot holding the light-pollution filter.
pub const LP_FILTER_SLOT: i64 = 2;

/// Filter wheel slot left open.
pub const OPEN_FILTER_SLOT: i64 = 1;

/// A validated telescope action.
#[derive(Debug, Clone, PartialEq)]
pub enum TelescopeAction {
    /// Slew at `speed` towards `angle` (degrees) for `duration_secs`.
    Move {
        /// Direction in degrees.
        angle: i64,
        /// Slew speed.
        speed: i64,
        /// Duration in seconds.
        duration_secs: i64,
    },
    /// Park the mount.
    Park,
    /// Move the focuser by `increment` steps relative to its position.
    FocusIncrement {
        /// Signed step delta.
        increment: i64,
    },
    /// Slew to equatorial coordinates and start viewing.
    Goto {
        /// Right ascension in hours.
        ra: f64,
        /// Declination in degrees.
        dec: f64,
        /// Display name of the target.
        target_name: String,
    },
    /// Stop an in-progress goto.
    AbortGoto,
    /// Start stacking.
    StartImaging,
    /// Stop stacking.
    StopImaging,
    /// Set sensor gain.
    SetGain {
        /// Gain value.
        gain: i64,
    },
    /// Read sensor gain.
    GetGain,
    /// Set exposure for stacking and preview.
    SetExposure {
        /// Exposure in milliseconds.
        exposure_ms: u64,
    },
    /// Read exposure settings.
    GetExposure,
    /// Put the light-pollution filter in or out of the optical path.
    SetFilter {
        /// `true` inserts the filter.
        enabled: bool,
    },
    /// Return the cached status.
    GetStatus,
}

fn required<'a>(parameters: &'a Map<String, Value>, key: &str, action: &str) -> Result<&'a Value, GatewayError> {
    parameters
        .get(key)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("{action} requires parameter '{key}'")))
}

fn int_param(parameters: &Map<String, Value>, key: &str, action: &str) -> Result<i64, GatewayError> {
    let value = required(parameters, key, action)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
        .ok_or_else(|| GatewayError::InvalidRequest(format!("{action}: '{key}' must be a number")))
}

fn int_param_or(parameters: &Map<String, Value>, key: &str, action: &str, default: i64) -> Result<i64, GatewayError> {
    if parameters.contains_key(key) {
        int_param(parameters, key, action)
    } else {
        Ok(default)
    }
}

fn float_param(parameters: &Map<String, Value>, key: &str, action: &str) -> Result<f64, GatewayError> {
    required(parameters, key, action)?
        .as_f64()
        .ok_or_else(|| GatewayError::InvalidRequest(format!("{action}: '{key}' must be a number")))
}

impl TelescopeAction {
    /// Validates `action` and its `parameters`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for unknown actions and for
    /// missing or mistyped parameters.
    pub fn parse(action: &str, parameters: &Map<String, Value>) -> Result<Self, GatewayError> {
        let parsed = match action {
            "move" => Self::Move {
                angle: int_param(parameters, "angle", action)?,
                speed: int_param_or(parameters, "speed", action, 1000)?,
                duration_secs: int_param_or(parameters, "duration", action, 3)?,
            },
            "park" => Self::Park,
            "focus_increment" => Self::FocusIncrement {
                increment: int_param(parameters, "increment", action)?,
            },
            "goto" => Self::Goto {
                ra: float_param(parameters, "ra", action)?,
                dec: float_param(parameters, "dec", action)?,
                target_name: parameters
                    .get("target_name")
                    .and_then(Value::as_str)
                    .unwrap_or("Target")
                    .to_string(),
            },
            "abort_goto" => Self::AbortGoto,
            "start_imaging" => Self::StartImaging,
            "stop_imaging" => Self::StopImaging,
            "set_gain" => Self::SetGain {
                gain: int_param(parameters, "gain", action)?,
            },
            "get_gain" => Self::GetGain,
            "set_exposure" => {
                let exposure_ms = int_param(parameters, "exposure_ms", action)?;
                let exposure_ms = u64::try_from(exposure_ms).map_err(|_| {
                    GatewayError::InvalidRequest(format!("{action}: 'exposure_ms' must not be negative"))
                })?;
                Self::SetExposure { exposure_ms }
            }
            "get_exposure" => Self::GetExposure,
            "set_filter" => Self::SetFilter {
                enabled: required(parameters, "enabled", action)?
                    .as_bool()
                    .ok_or_else(|| GatewayError::InvalidRequest(format!("{action}: 'enabled' must be a boolean")))?,
            },
            "get_status" => Self::GetStatus,
            other => return Err(GatewayError::InvalidRequest(format!("unknown action '{other}'"))),
        };
        Ok(parsed)
    }

    /// Wire name of the action.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Park => "park",
            Self::FocusIncrement { .. } => "focus_increment",
            Self::Goto { .. } => "goto",
            Self::AbortGoto => "abort_goto",
            Self::StartImaging => "start_imaging",
            Self::StopImaging => "stop_imaging",
            Self::SetGain { .. } => "set_gain",
            Self::GetGain => "get_gain",
            Self::SetExposure { .. } => "set_exposure",
            Self::GetExposure => "get_exposure",
            Self::SetFilter { .. } => "set_filter",
            Self::GetStatus => "get_status",
        }
    }

    /// Device method and parameters for actions that map to a single
    /// request. `None` for actions that need local state first.
    #[must_use]
    pub fn device_request(&self) -> Option<(&'static str, Option<Value>)> {
        let request = match self {
            Self::Move {
                angle,
                speed,
                duration_secs,
            } => (
                "scope_speed_move",
                Some(json!({ "angle": angle, "speed": speed, "dur_sec": duration_secs })),
            ),
            Self::Park => ("scope_park", None),
            Self::Goto { ra, dec, target_name } => (
                "iscope_start_view",
                Some(json!({
                    "mode": "star",
                    "target_ra_dec": [ra, dec],
                    "target_name": target_name,
                })),
            ),
            Self::AbortGoto => ("iscope_stop_view", Some(json!({ "stage": "AutoGoto" }))),
            Self::StartImaging => ("iscope_start_stack", Some(json!({ "restart": true }))),
            Self::StopImaging => ("iscope_stop_view", Some(json!({ "stage": "Stack" }))),
            Self::SetGain { gain } => ("set_control_value", Some(json!(["gain", gain]))),
            Self::GetGain => ("get_control_value", Some(json!(["gain"]))),
            Self::SetExposure { exposure_ms } => (
                "set_setting",
                Some(json!({ "exp_ms": { "stack_l": exposure_ms, "continuous": exposure_ms } })),
            ),
            Self::GetExposure => ("get_setting", None),
            Self::SetFilter { enabled } => {
                let slot = if *enabled { LP_FILTER_SLOT } else { OPEN_FILTER_SLOT };
                ("set_wheel_position", Some(json!([slot])))
            }
            Self::FocusIncrement { .. } | Self::GetStatus => return None,
        };
        Some(request)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("parameters must be an object"),
        }
    }

    #[test]
    fn parses_every_parameterless_action() {
        for name in [
            "park",
            "abort_goto",
            "start_imaging",
            "stop_imaging",
            "get_gain",
            "get_exposure",
            "get_status",
        ] {
            let Ok(action) = TelescopeAction::parse(name, &Map::new()) else {
                panic!("{name} should parse");
            };
            assert_eq!(action.name(), name);
        }
    }

    #[test]
    fn move_applies_defaults() {
        let Ok(action) = TelescopeAction::parse("move", &params(json!({"angle": 90}))) else {
            panic!("move should parse");
        };
        assert_eq!(
            action.device_request(),
            Some((
                "scope_speed_move",
                Some(json!({"angle": 90, "speed": 1000, "dur_sec": 3}))
            ))
        );
    }

    #[test]
    fn goto_maps_to_start_view() {
        let raw = params(json!({"ra": 10.68, "dec": 41.27, "target_name": "M31"}));
        let Ok(action) = TelescopeAction::parse("goto", &raw) else {
            panic!("goto should parse");
        };
        let Some(("iscope_start_view", Some(p))) = action.device_request() else {
            panic!("goto should map to iscope_start_view");
        };
        assert_eq!(p.get("target_ra_dec"), Some(&json!([10.68, 41.27])));
        assert_eq!(p.get("target_name"), Some(&json!("M31")));
    }

    #[test]
    fn filter_selects_wheel_slot() {
        let Ok(action) = TelescopeAction::parse("set_filter", &params(json!({"enabled": true}))) else {
            panic!("set_filter should parse");
        };
        assert_eq!(
            action.device_request(),
            Some(("set_wheel_position", Some(json!([LP_FILTER_SLOT]))))
        );
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let cases = [
            ("teleport", json!({})),
            ("move", json!({})),
            ("set_gain", json!({"gain": "high"})),
            ("set_exposure", json!({"exposure_ms": -5})),
            ("set_filter", json!({"enabled": "yes"})),
            ("goto", json!({"ra": 1.0})),
        ];
        for (name, raw) in cases {
            assert!(
                matches!(TelescopeAction::parse(name, &params(raw)), Err(GatewayError::InvalidRequest(_))),
                "{name}"
            );
        }
    }

    #[test]
    fn stateful_actions_have_no_direct_request() {
        let Ok(focus) = TelescopeAction::parse("focus_increment", &params(json!({"increment": -20}))) else {
            panic!("focus_increment should parse");
        };
        assert!(focus.device_request().is_none());
        assert!(TelescopeAction::GetStatus.device_request().is_none());
    }
}
