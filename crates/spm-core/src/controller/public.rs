//! Controller for public (non-depot) charging sites.

use spm_types::{ChargingEvent, CommandRecord, ControllerVariant, SiteId, Tick};

use super::demand::requested_power_kw;
use super::{ControllerError, SiteController};

/// Grants every plugged-in vehicle the power it needs, independently.
///
/// Public sites have no shared capacity limit in this model; each
/// vehicle is bounded only by its own charger.
#[derive(Debug, Clone)]
pub struct DefaultSiteController {
    site_id: SiteId,
    default_max_power_kw: f64,
    latest: Vec<CommandRecord>,
}

impl DefaultSiteController {
    /// Create a controller for `site_id`.
    pub const fn new(site_id: SiteId, default_max_power_kw: f64) -> Self {
        Self {
            site_id,
            default_max_power_kw,
            latest: Vec::new(),
        }
    }

    fn allocate(
        &self,
        tick: Tick,
        events: &[ChargingEvent],
    ) -> Result<Vec<CommandRecord>, ControllerError> {
        events
            .iter()
            .map(|event| {
                let power = requested_power_kw(event, tick, self.default_max_power_kw)?;
                Ok(CommandRecord::new(
                    self.site_id.clone(),
                    event.vehicle_id.clone(),
                    power,
                ))
            })
            .collect()
    }
}

impl SiteController for DefaultSiteController {
    fn variant(&self) -> ControllerVariant {
        ControllerVariant::Default
    }

    fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    fn run(&mut self, tick: Tick, events: &[ChargingEvent]) -> Result<(), ControllerError> {
        self.latest.clear();
        self.latest = self.allocate(tick, events)?;
        Ok(())
    }

    fn output_from_latest_run(&self) -> Vec<CommandRecord> {
        self.latest.clone()
    }
}
