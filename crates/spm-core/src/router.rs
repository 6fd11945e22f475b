//! Event routing: partition one tick's records by site.
//!
//! The upstream simulator sends records in no particular order and the
//! same site may appear several times, scattered across the batch. The
//! router merges every record for a site into one group, keeps sites in
//! the order they were first seen, and keeps records in arrival order
//! within a site. Only records with a vehicle identifier survive; a site
//! left with no events is dropped from the tick entirely.
//!
//! The site order captured here is the order in which outputs are later
//! concatenated, so it is stored explicitly as a `Vec` rather than left to
//! the iteration order of a map.

use std::collections::HashMap;

use serde_json::Value;
use spm_types::{ChargingEvent, InboundRecord, SiteId, Tick};
use tracing::{debug, error, warn};

use crate::codec::{self, CodecError};

/// The events addressed to one site in one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteEvents {
    /// The site.
    pub site_id: SiteId,
    /// Its events, in arrival order.
    pub events: Vec<ChargingEvent>,
}

/// One tick's routed work, in first-seen site order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutedTick {
    sites: Vec<SiteEvents>,
}

impl RoutedTick {
    /// A tick with no work.
    pub const fn empty() -> Self {
        Self { sites: Vec::new() }
    }

    /// Whether no site has work this tick.
    pub const fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Number of sites with work.
    pub const fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Total number of events across all sites.
    pub fn event_count(&self) -> usize {
        self.sites.iter().map(|s| s.events.len()).sum()
    }

    /// Site identifiers in dispatch order.
    pub fn site_ids(&self) -> impl Iterator<Item = &SiteId> {
        self.sites.iter().map(|s| &s.site_id)
    }

    /// Events for one site, if it has work this tick.
    pub fn events_for(&self, site_id: &SiteId) -> Option<&[ChargingEvent]> {
        self.sites
            .iter()
            .find(|s| &s.site_id == site_id)
            .map(|s| s.events.as_slice())
    }

    /// Borrow the per-site groups in dispatch order.
    pub fn sites(&self) -> &[SiteEvents] {
        &self.sites
    }

    /// Consume into the per-site groups in dispatch order.
    pub fn into_sites(self) -> Vec<SiteEvents> {
        self.sites
    }
}

/// Counters describing what routing discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStats {
    /// Array elements that were not JSON objects.
    pub not_objects: usize,
    /// Records without a site identifier.
    pub missing_site: usize,
    /// Records without a vehicle identifier.
    pub missing_vehicle: usize,
    /// Sites seen this tick that ended with no events.
    pub empty_sites: usize,
}

/// Result of routing one raw bus message.
#[derive(Debug, Default)]
pub struct RouteOutcome {
    /// The routed work (empty if the message failed to parse).
    pub routed: RoutedTick,
    /// What was discarded while routing.
    pub stats: RouteStats,
    /// Set when the message was not a valid JSON array.
    pub parse_error: Option<CodecError>,
}

/// Group already-decoded records by site.
pub fn route(records: impl IntoIterator<Item = InboundRecord>) -> (RoutedTick, RouteStats) {
    let mut stats = RouteStats::default();
    let mut sites: Vec<SiteEvents> = Vec::new();
    let mut index: HashMap<SiteId, usize> = HashMap::new();

    for record in records {
        let Some(site_id) = record.site_id().cloned() else {
            stats.missing_site = stats.missing_site.saturating_add(1);
            continue;
        };
        let slot = *index.entry(site_id.clone()).or_insert_with(|| {
            sites.push(SiteEvents {
                site_id,
                events: Vec::new(),
            });
            sites.len().saturating_sub(1)
        });
        match record.into_charging_event() {
            Some(event) => {
                if let Some(group) = sites.get_mut(slot) {
                    group.events.push(event);
                }
            }
            None => stats.missing_vehicle = stats.missing_vehicle.saturating_add(1),
        }
    }

    let seen = sites.len();
    sites.retain(|s| !s.events.is_empty());
    stats.empty_sites = seen.saturating_sub(sites.len());

    (RoutedTick { sites }, stats)
}

/// Group decoded JSON array elements by site.
pub fn route_values(values: Vec<Value>) -> (RoutedTick, RouteStats) {
    let mut not_objects = 0_usize;
    let records = values.into_iter().filter_map(|value| {
        let record = InboundRecord::from_value(value);
        if record.is_none() {
            not_objects = not_objects.saturating_add(1);
        }
        record
    });
    let (routed, mut stats) = route(records);
    stats.not_objects = not_objects;
    (routed, stats)
}

/// Decode and route one raw bus message.
///
/// Never fails: a blank message is an empty tick, and a malformed one is
/// logged and also yields an empty tick, with the error returned in the
/// outcome for accounting.
pub fn route_message(raw: &str, tick: Tick) -> RouteOutcome {
    let values = match codec::decode(raw) {
        Ok(values) => values,
        Err(e) => {
            error!(tick, error = %e, "inbound message is not a JSON array of events");
            return RouteOutcome {
                parse_error: Some(e),
                ..RouteOutcome::default()
            };
        }
    };

    let (routed, stats) = route_values(values);

    if stats.not_objects > 0 || stats.missing_site > 0 {
        warn!(
            tick,
            not_objects = stats.not_objects,
            missing_site = stats.missing_site,
            "dropped records that cannot be routed to a site"
        );
    }
    if stats.missing_vehicle > 0 {
        debug!(
            tick,
            missing_vehicle = stats.missing_vehicle,
            empty_sites = stats.empty_sites,
            "dropped records without a vehicle id"
        );
    }

    RouteOutcome {
        routed,
        stats,
        parse_error: None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use spm_types::VehicleId;

    use super::*;

    fn vehicles(routed: &RoutedTick, site: &str) -> Vec<String> {
        routed
            .events_for(&SiteId::new(site))
            .unwrap_or_default()
            .iter()
            .map(|e| e.vehicle_id.to_string())
            .collect()
    }

    #[test]
    fn groups_scattered_records_in_first_seen_order() {
        let raw = r#"[
            {"siteId":"S1","vehicleId":"V1"},
            {"siteId":"depot-1","vehicleId":"V2"},
            {"siteId":"S1","vehicleId":"V3"}
        ]"#;
        let outcome = route_message(raw, 60);
        assert!(outcome.parse_error.is_none());
        let routed = outcome.routed;
        let order: Vec<&str> = routed.site_ids().map(SiteId::as_str).collect();
        assert_eq!(order, vec!["S1", "depot-1"]);
        assert_eq!(vehicles(&routed, "S1"), vec!["V1", "V3"]);
        assert_eq!(vehicles(&routed, "depot-1"), vec!["V2"]);
        assert_eq!(routed.event_count(), 3);
    }

    #[test]
    fn records_without_vehicle_are_filtered() {
        let raw = r#"[
            {"siteId":"S1","vehicleId":"V1"},
            {"siteId":"S1","power":3},
            {"siteId":"S1","vehicleId":"V2"}
        ]"#;
        let outcome = route_message(raw, 0);
        assert_eq!(vehicles(&outcome.routed, "S1"), vec!["V1", "V2"]);
        assert_eq!(outcome.stats.missing_vehicle, 1);
    }

    #[test]
    fn site_with_no_valid_events_is_dropped() {
        let raw = r#"[
            {"siteId":"S0"},
            {"siteId":"S1","vehicleId":"V1"},
            {"siteId":"S0","vehicleId":null}
        ]"#;
        let outcome = route_message(raw, 0);
        let order: Vec<&str> = outcome.routed.site_ids().map(SiteId::as_str).collect();
        assert_eq!(order, vec!["S1"]);
        assert_eq!(outcome.stats.empty_sites, 1);
    }

    #[test]
    fn site_order_follows_first_sighting_even_if_invalid() {
        let raw = r#"[
            {"siteId":"B"},
            {"siteId":"A","vehicleId":"V1"},
            {"siteId":"B","vehicleId":"V2"}
        ]"#;
        let routed = route_message(raw, 0).routed;
        let order: Vec<&str> = routed.site_ids().map(SiteId::as_str).collect();
        assert_eq!(order, vec!["B", "A"]);
    }

    #[test]
    fn records_without_site_or_not_objects_are_counted() {
        let raw = r#"[{"vehicleId":"V1"}, 5, "x", {"siteId":"S1","vehicleId":"V2"}]"#;
        let outcome = route_message(raw, 0);
        assert_eq!(outcome.stats.missing_site, 1);
        assert_eq!(outcome.stats.not_objects, 2);
        assert_eq!(outcome.routed.site_count(), 1);
    }

    #[test]
    fn blank_message_is_empty_without_error() {
        for raw in ["", "  ", "\n"] {
            let outcome = route_message(raw, 120);
            assert!(outcome.routed.is_empty());
            assert!(outcome.parse_error.is_none());
        }
    }

    #[test]
    fn malformed_message_is_empty_with_error() {
        let outcome = route_message("{not valid", 120);
        assert!(outcome.routed.is_empty());
        assert!(outcome.parse_error.is_some());
    }

    #[test]
    fn payload_passes_through() {
        let values = vec![json!({
            "siteId": "S1",
            "vehicleId": "V1",
            "arrivalTime": 10,
            "nested": {"a": 1}
        })];
        let (routed, _) = route_values(values);
        let event = routed.sites().first().unwrap().events.first().unwrap();
        assert_eq!(event.vehicle_id, VehicleId::new("V1"));
        assert_eq!(event.field("arrivalTime"), Some(&json!(10)));
        assert_eq!(event.field("nested"), Some(&json!({"a":1})));
    }
}
