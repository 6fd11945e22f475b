//! Site controllers: the pluggable strategy that turns a site's charging
//! events into power commands.
//!
//! A controller is stateful and lives for the whole run. Each tick the
//! dispatcher calls [`SiteController::run`] with that tick's events for
//! the site, then reads [`SiteController::output_from_latest_run`].
//!
//! Concrete controllers are built by a [`ControllerFactory`] keyed by the
//! [`ControllerVariant`] of the site. [`BuiltinControllerFactory`] ships the
//! two variants used by the federate binary.

mod demand;
mod public;
mod ride_hail;

use spm_types::{ChargingEvent, CommandRecord, ControllerVariant, SiteId, Tick, VehicleId};

use crate::config::{ControllerConfig, default_step_secs};

pub use public::DefaultSiteController;
pub use ride_hail::RideHailSiteController;

/// Errors a controller can report from a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    /// An event carries a field the controller cannot use.
    #[error("invalid event for vehicle {vehicle_id}: {reason}")]
    InvalidEvent {
        /// The vehicle whose event is invalid.
        vehicle_id: VehicleId,
        /// What is wrong with it.
        reason: String,
    },

    /// The controller failed for another reason.
    #[error("controller failed: {message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },
}

/// A stateful per-site power controller.
///
/// Implementations must be [`Send`]: in concurrent dispatch mode a
/// controller is moved onto a worker thread for the duration of its run.
pub trait SiteController: Send {
    /// The variant this controller implements.
    fn variant(&self) -> ControllerVariant;

    /// The site this controller serves.
    fn site_id(&self) -> &SiteId;

    /// Process one tick's events for this site.
    ///
    /// On error the controller must leave its latest output empty, so a
    /// failed run never republishes stale commands.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if the events cannot be processed.
    fn run(&mut self, tick: Tick, events: &[ChargingEvent]) -> Result<(), ControllerError>;

    /// The commands produced by the most recent run.
    fn output_from_latest_run(&self) -> Vec<CommandRecord>;
}

/// Builds controller instances for newly seen sites.
pub trait ControllerFactory: Send + Sync {
    /// Create a controller of `variant` for `site_id`.
    fn create(&self, variant: ControllerVariant, site_id: &SiteId) -> Box<dyn SiteController>;
}

/// Factory for the built-in default and ride-hail controllers.
#[derive(Debug, Clone)]
pub struct BuiltinControllerFactory {
    config: ControllerConfig,
    step_secs: Tick,
}

impl BuiltinControllerFactory {
    /// Create a factory using the given controller parameters.
    pub const fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            step_secs: default_step_secs(),
        }
    }

    /// Set the simulated seconds one allocation stays in force.
    #[must_use]
    pub const fn with_step_secs(mut self, step_secs: Tick) -> Self {
        self.step_secs = step_secs;
        self
    }
}

impl Default for BuiltinControllerFactory {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

impl ControllerFactory for BuiltinControllerFactory {
    fn create(&self, variant: ControllerVariant, site_id: &SiteId) -> Box<dyn SiteController> {
        match variant {
            ControllerVariant::Default => Box::new(DefaultSiteController::new(
                site_id.clone(),
                self.config.default_max_power_kw,
            )),
            ControllerVariant::RideHail => Box::new(
                RideHailSiteController::new(
                    site_id.clone(),
                    self.config.depot_capacity_kw,
                    self.config.default_max_power_kw,
                )
                .with_step_secs(self.step_secs),
            ),
        }
    }
}
