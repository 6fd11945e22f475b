//! Per-vehicle charging demand shared by the built-in controllers.
//!
//! A vehicle asks for the power that delivers its missing energy by its
//! departure time, capped at its charger limit. Without enough
//! information to compute that, it gets the full limit.

use serde_json::Value;
use spm_types::{ChargingEvent, Tick};

use super::ControllerError;

/// Current battery energy (J).
pub(super) const FUEL_LEVEL_FIELD: &str = "primaryFuelLevelInJoules";
/// Target battery energy at departure (J).
pub(super) const DESIRED_FUEL_LEVEL_FIELD: &str = "desiredFuelLevelInJoules";
/// Departure time (simulated seconds).
pub(super) const DEPARTURE_TIME_FIELD: &str = "departureTime";
/// Charger power limit for this vehicle (kW).
pub(super) const MAX_POWER_FIELD: &str = "maxPowerInKW";

const JOULES_PER_KJ: f64 = 1000.0;

/// Power (kW) the vehicle in `event` needs at `tick`.
///
/// # Errors
///
/// Returns [`ControllerError::InvalidEvent`] if a numeric field is present
/// but is not a finite, non-negative number.
#[allow(clippy::arithmetic_side_effects, clippy::cast_precision_loss)]
pub(super) fn requested_power_kw(
    event: &ChargingEvent,
    tick: Tick,
    default_max_power_kw: f64,
) -> Result<f64, ControllerError> {
    let max_kw = number_field(event, MAX_POWER_FIELD)?.unwrap_or(default_max_power_kw);

    let current = number_field(event, FUEL_LEVEL_FIELD)?;
    let desired = number_field(event, DESIRED_FUEL_LEVEL_FIELD)?;
    let departure = number_field(event, DEPARTURE_TIME_FIELD)?;

    let (Some(current), Some(desired), Some(departure)) = (current, desired, departure) else {
        return Ok(max_kw);
    };

    let missing_joules = (desired - current).max(0.0);
    if missing_joules <= 0.0 {
        return Ok(0.0);
    }
    // Simulated seconds stay far below 2^52.
    let remaining_secs = departure - tick as f64;
    if remaining_secs <= 0.0 {
        return Ok(max_kw);
    }
    let needed_kw = missing_joules / remaining_secs / JOULES_PER_KJ;
    Ok(needed_kw.min(max_kw))
}

/// Read an optional non-negative number; `null` counts as absent.
fn number_field(event: &ChargingEvent, key: &str) -> Result<Option<f64>, ControllerError> {
    let invalid = |reason: String| ControllerError::InvalidEvent {
        vehicle_id: event.vehicle_id.clone(),
        reason,
    };
    match event.field(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() && v >= 0.0 => Ok(Some(v)),
            _ => Err(invalid(format!("{key} must be a non-negative number, got {n}"))),
        },
        Some(other) => Err(invalid(format!("{key} must be a number, got {other}"))),
    }
}
