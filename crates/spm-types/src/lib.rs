//! Shared type definitions for the site power management (SPM) federate.
//!
//! These types describe what travels over the co-simulation bus: the
//! charging events published by the upstream simulator and the power
//! commands the federate publishes back each tick.
//!
//! # Modules
//!
//! - [`ids`] -- String-backed identifiers for sites and vehicles
//! - [`variant`] -- Controller variant selection by site naming convention
//! - [`events`] -- Inbound charging-demand records
//! - [`commands`] -- Outbound power-allocation commands

pub mod commands;
pub mod events;
pub mod ids;
pub mod variant;

pub use commands::{CommandBatch, CommandRecord};
pub use events::{ChargingEvent, InboundRecord};
pub use ids::{SiteId, VehicleId};
pub use variant::{ControllerVariant, DEPOT_PREFIX};

/// One discrete step of simulated time, as an offset in simulated seconds.
pub type Tick = u64;
