//! Controller for ride-hail depots.
//!
//! A depot has a single grid connection shared by every stall. When the
//! vehicles together ask for more than the connection allows, each
//! allocation is scaled down by the same factor. The controller also keeps
//! a running total of energy delivered to each vehicle present at the
//! depot. An allocation is credited for the time until the next run, but
//! never for more than one step; a vehicle that is absent from a run is
//! forgotten and starts from zero if it returns.

use std::collections::HashMap;

use spm_types::{ChargingEvent, CommandRecord, ControllerVariant, SiteId, Tick, VehicleId};

use super::demand::requested_power_kw;
use super::{ControllerError, SiteController};

/// Extra command field reporting cumulative energy per vehicle.
pub(crate) const ENERGY_DELIVERED_FIELD: &str = "energyDeliveredInKWh";

const SECONDS_PER_HOUR: f64 = 3600.0;

const DEFAULT_STEP_SECS: Tick = 60;

/// Capacity-sharing controller for depot sites.
#[derive(Debug, Clone)]
pub struct RideHailSiteController {
    site_id: SiteId,
    capacity_kw: f64,
    default_max_power_kw: f64,
    step_secs: Tick,
    delivered_kwh: HashMap<VehicleId, f64>,
    last_tick: Option<Tick>,
    latest: Vec<CommandRecord>,
}

impl RideHailSiteController {
    /// Create a depot controller with the given grid capacity.
    pub fn new(site_id: SiteId, capacity_kw: f64, default_max_power_kw: f64) -> Self {
        Self {
            site_id,
            capacity_kw,
            default_max_power_kw,
            step_secs: DEFAULT_STEP_SECS,
            delivered_kwh: HashMap::new(),
            last_tick: None,
            latest: Vec::new(),
        }
    }

    /// Set how long one allocation stays in force (simulated seconds).
    #[must_use]
    pub const fn with_step_secs(mut self, step_secs: Tick) -> Self {
        self.step_secs = step_secs;
        self
    }

    /// Energy delivered to `vehicle_id` so far (kWh).
    pub fn delivered_kwh(&self, vehicle_id: &VehicleId) -> f64 {
        self.delivered_kwh.get(vehicle_id).copied().unwrap_or(0.0)
    }

    /// Credit the previous allocation for the time since it was issued,
    /// capped at one step.
    #[allow(clippy::arithmetic_side_effects, clippy::cast_precision_loss)]
    fn credit_previous_allocation(&mut self, tick: Tick) {
        let Some(previous) = self.last_tick else {
            return;
        };
        let held = tick.saturating_sub(previous).min(self.step_secs);
        let hours = held as f64 / SECONDS_PER_HOUR;
        for cmd in &self.latest {
            *self
                .delivered_kwh
                .entry(cmd.vehicle_id.clone())
                .or_insert(0.0) += cmd.power_in_kw * hours;
        }
    }

    #[allow(clippy::arithmetic_side_effects)]
    fn allocate(
        &self,
        tick: Tick,
        events: &[ChargingEvent],
    ) -> Result<Vec<CommandRecord>, ControllerError> {
        let requests = events
            .iter()
            .map(|event| requested_power_kw(event, tick, self.default_max_power_kw))
            .collect::<Result<Vec<f64>, _>>()?;

        let total: f64 = requests.iter().sum();
        let scale = if total > self.capacity_kw {
            self.capacity_kw / total
        } else {
            1.0
        };

        Ok(events
            .iter()
            .zip(requests)
            .map(|(event, requested)| {
                CommandRecord::new(
                    self.site_id.clone(),
                    event.vehicle_id.clone(),
                    requested * scale,
                )
                .with_extra(
                    ENERGY_DELIVERED_FIELD,
                    self.delivered_kwh(&event.vehicle_id),
                )
            })
            .collect())
    }
}

impl SiteController for RideHailSiteController {
    fn variant(&self) -> ControllerVariant {
        ControllerVariant::RideHail
    }

    fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    fn run(&mut self, tick: Tick, events: &[ChargingEvent]) -> Result<(), ControllerError> {
        self.credit_previous_allocation(tick);
        self.delivered_kwh
            .retain(|vehicle, _| events.iter().any(|e| &e.vehicle_id == vehicle));
        self.last_tick = Some(tick);
        self.latest.clear();
        self.latest = self.allocate(tick, events)?;
        Ok(())
    }

    fn output_from_latest_run(&self) -> Vec<CommandRecord> {
        self.latest.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::controller::demand::MAX_POWER_FIELD;

    fn depot(capacity_kw: f64) -> RideHailSiteController {
        RideHailSiteController::new(SiteId::new("depot-1"), capacity_kw, 7.2)
    }

    fn total_power(out: &[CommandRecord]) -> f64 {
        out.iter().map(|c| c.power_in_kw).sum()
    }

    #[test]
    fn under_capacity_grants_requests() {
        let mut controller = depot(100.0);
        let events = vec![
            ChargingEvent::new("depot-1", "V1").with_field(MAX_POWER_FIELD, 50.0),
            ChargingEvent::new("depot-1", "V2").with_field(MAX_POWER_FIELD, 20.0),
        ];
        controller.run(0, &events).unwrap();
        let out = controller.output_from_latest_run();
        assert!((total_power(&out) - 70.0).abs() < 1e-9);
    }

    #[test]
    fn over_capacity_scales_proportionally() {
        let mut controller = depot(60.0);
        let events = vec![
            ChargingEvent::new("depot-1", "V1").with_field(MAX_POWER_FIELD, 100.0),
            ChargingEvent::new("depot-1", "V2").with_field(MAX_POWER_FIELD, 50.0),
        ];
        controller.run(0, &events).unwrap();
        let out = controller.output_from_latest_run();
        assert!((total_power(&out) - 60.0).abs() < 1e-9);
        assert!((out.first().unwrap().power_in_kw - 40.0).abs() < 1e-9);
        assert!((out.get(1).unwrap().power_in_kw - 20.0).abs() < 1e-9);
    }

    #[test]
    fn energy_accumulates_across_ticks() {
        let mut controller = depot(1000.0);
        let event = ChargingEvent::new("depot-1", "V1").with_field(MAX_POWER_FIELD, 60.0);
        controller.run(0, std::slice::from_ref(&event)).unwrap();
        // 60 kW held for 60 s = 1 kWh.
        controller.run(60, std::slice::from_ref(&event)).unwrap();

        let vehicle = VehicleId::new("V1");
        assert!((controller.delivered_kwh(&vehicle) - 1.0).abs() < 1e-9);
        let reported = controller
            .output_from_latest_run()
            .first()
            .and_then(|c| c.extra.get(ENERGY_DELIVERED_FIELD))
            .and_then(serde_json::Value::as_f64)
            .unwrap();
        assert!((reported - 1.0).abs() < 1e-9);
    }

    #[test]
    fn idle_gap_credits_at_most_one_step() {
        let mut controller = depot(1000.0);
        let event = ChargingEvent::new("depot-1", "V1").with_field(MAX_POWER_FIELD, 60.0);
        controller.run(0, std::slice::from_ref(&event)).unwrap();
        // The depot is not seen again for an hour; only one minute counts.
        controller.run(3600, std::slice::from_ref(&event)).unwrap();

        let vehicle = VehicleId::new("V1");
        assert!((controller.delivered_kwh(&vehicle) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn custom_step_bounds_the_credit() {
        let mut controller = depot(1000.0).with_step_secs(30);
        let event = ChargingEvent::new("depot-1", "V1").with_field(MAX_POWER_FIELD, 60.0);
        controller.run(0, std::slice::from_ref(&event)).unwrap();
        controller.run(60, std::slice::from_ref(&event)).unwrap();

        let vehicle = VehicleId::new("V1");
        assert!((controller.delivered_kwh(&vehicle) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn departed_vehicle_is_forgotten() {
        let mut controller = depot(1000.0);
        let v1 = ChargingEvent::new("depot-1", "V1").with_field(MAX_POWER_FIELD, 60.0);
        let v2 = ChargingEvent::new("depot-1", "V2").with_field(MAX_POWER_FIELD, 60.0);
        controller.run(0, &[v1.clone(), v2.clone()]).unwrap();
        controller.run(60, std::slice::from_ref(&v2)).unwrap();

        let gone = VehicleId::new("V1");
        assert!(controller.delivered_kwh(&gone).abs() < 1e-9);
        assert!((controller.delivered_kwh(&VehicleId::new("V2")) - 1.0).abs() < 1e-9);

        // Back again: a new session starting from zero.
        controller.run(120, std::slice::from_ref(&v1)).unwrap();
        let reported = controller
            .output_from_latest_run()
            .first()
            .and_then(|c| c.extra.get(ENERGY_DELIVERED_FIELD))
            .and_then(serde_json::Value::as_f64)
            .unwrap();
        assert!(reported.abs() < 1e-9);
    }

    #[test]
    fn failed_run_clears_output() {
        let mut controller = depot(100.0);
        controller.run(0, &[ChargingEvent::new("depot-1", "V1")]).unwrap();
        let bad = ChargingEvent::new("depot-1", "V2").with_field(MAX_POWER_FIELD, -3);
        assert!(controller.run(60, &[bad]).is_err());
        assert!(controller.output_from_latest_run().is_empty());
    }
}
