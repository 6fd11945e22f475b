//! Controller variant selection.
//!
//! Every site is served by exactly one controller variant. The variant is
//! a pure function of the site name: names whose lowercase form starts
//! with [`DEPOT_PREFIX`] are ride-hail depots, everything else is a
//! default (public) charging site. A name that merely contains the prefix
//! somewhere else (`"my-depot"`) is a default site.

use serde::{Deserialize, Serialize};

use crate::ids::SiteId;

/// Reserved site-name prefix marking ride-hail depots.
pub const DEPOT_PREFIX: &str = "depot";

/// The closed set of controller variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerVariant {
    /// Public charging site controller.
    Default,
    /// Ride-hail depot controller.
    RideHail,
}

impl ControllerVariant {
    /// Classify a site by its name.
    pub fn classify(site_id: &SiteId) -> Self {
        if site_id.as_str().to_lowercase().starts_with(DEPOT_PREFIX) {
            Self::RideHail
        } else {
            Self::Default
        }
    }

    /// Stable lowercase name, used in log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::RideHail => "ride_hail",
        }
    }
}

impl core::fmt::Display for ControllerVariant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
