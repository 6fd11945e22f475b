//! Outbound power-allocation commands.
//!
//! Controllers produce one [`CommandRecord`] per vehicle they allocate
//! power to. All records produced in a tick are concatenated, in site
//! order, into a [`CommandBatch`] and published as a single JSON array.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{SiteId, VehicleId};

/// A power command for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Site the command applies to.
    #[serde(rename = "siteId")]
    pub site_id: SiteId,
    /// Vehicle the power is allocated to.
    #[serde(rename = "vehicleId")]
    pub vehicle_id: VehicleId,
    /// Allocated charging power in kilowatts.
    #[serde(rename = "powerInKW")]
    pub power_in_kw: f64,
    /// Controller-specific extra fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandRecord {
    /// Create a command with no extra fields.
    pub fn new(site_id: SiteId, vehicle_id: VehicleId, power_in_kw: f64) -> Self {
        Self {
            site_id,
            vehicle_id,
            power_in_kw,
            extra: Map::new(),
        }
    }

    /// Attach an extra field (builder style).
    #[must_use]
    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_owned(), value.into());
        self
    }
}

/// The ordered commands published for one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandBatch(Vec<CommandRecord>);

impl CommandBatch {
    /// Create an empty batch.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Append one site's output, keeping its internal order.
    pub fn extend_from_site(&mut self, records: Vec<CommandRecord>) {
        self.0.extend(records);
    }

    /// Number of commands in the batch.
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the batch holds no commands.
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the commands in publish order.
    pub fn records(&self) -> &[CommandRecord] {
        &self.0
    }
}

impl From<Vec<CommandRecord>> for CommandBatch {
    fn from(records: Vec<CommandRecord>) -> Self {
        Self(records)
    }
}

impl IntoIterator for CommandBatch {
    type Item = CommandRecord;
    type IntoIter = std::vec::IntoIter<CommandRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
