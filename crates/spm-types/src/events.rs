//! Inbound charging-demand records.
//!
//! The upstream simulator publishes one JSON array per tick. Each element
//! is expected to be an object carrying at least `siteId` and `vehicleId`;
//! every other key is payload the federate passes to the site controller
//! untouched.
//!
//! Decoding happens in two steps. [`InboundRecord`] is whatever an array
//! element turned out to be, with both identifiers optional. Only a record
//! that carries both becomes a [`ChargingEvent`], which is the only type a
//! controller ever sees.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{SiteId, VehicleId};

/// Wire key of the site identifier.
pub const SITE_ID_FIELD: &str = "siteId";

/// Wire key of the vehicle identifier.
pub const VEHICLE_ID_FIELD: &str = "vehicleId";

/// One element of the inbound array, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    site_id: Option<SiteId>,
    vehicle_id: Option<VehicleId>,
    payload: Map<String, Value>,
}

impl InboundRecord {
    /// Build a record from one array element.
    ///
    /// Returns `None` when the element is not a JSON object. Identifiers may
    /// be strings or numbers; `null` or any other type counts as absent.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut payload) = value else {
            return None;
        };
        let site_id = payload
            .remove(SITE_ID_FIELD)
            .and_then(id_string)
            .map(SiteId::from);
        let vehicle_id = payload
            .remove(VEHICLE_ID_FIELD)
            .and_then(id_string)
            .map(VehicleId::from);
        Some(Self {
            site_id,
            vehicle_id,
            payload,
        })
    }

    /// The site this record is addressed to, if any.
    pub const fn site_id(&self) -> Option<&SiteId> {
        self.site_id.as_ref()
    }

    /// The vehicle this record describes, if any.
    pub const fn vehicle_id(&self) -> Option<&VehicleId> {
        self.vehicle_id.as_ref()
    }

    /// Convert into a [`ChargingEvent`] if both identifiers are present.
    pub fn into_charging_event(self) -> Option<ChargingEvent> {
        Some(ChargingEvent {
            site_id: self.site_id?,
            vehicle_id: self.vehicle_id?,
            payload: self.payload,
        })
    }
}

/// Extract an identifier from a JSON value.
///
/// Strings are taken as-is and numbers by their JSON text. A key that is
/// present but holds `null`, a boolean, an array or an object yields no
/// identifier, so such a record is filtered like one without the key.
fn id_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A validated charging-demand event for one vehicle at one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargingEvent {
    /// The site the vehicle is plugged in at.
    #[serde(rename = "siteId")]
    pub site_id: SiteId,
    /// The vehicle requesting charge.
    #[serde(rename = "vehicleId")]
    pub vehicle_id: VehicleId,
    /// Remaining fields, passed through to the controller.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ChargingEvent {
    /// Create an event with an empty payload.
    pub fn new(site_id: impl Into<SiteId>, vehicle_id: impl Into<VehicleId>) -> Self {
        Self {
            site_id: site_id.into(),
            vehicle_id: vehicle_id.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field (builder style).
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }

    /// Look up a payload field by its wire key.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}
