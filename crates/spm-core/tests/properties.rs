//! Property-based tests for routing, dispatch, and codec invariants.
//!
//! Inputs are generated JSON event batches over a small pool of site
//! names (both public and depot) so that sites repeat and interleave.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use serde_json::{Value, json};
use spm_core::codec;
use spm_core::controller::{
    BuiltinControllerFactory, ControllerError, ControllerFactory, SiteController,
};
use spm_core::dispatch::{DispatchMode, Dispatcher};
use spm_core::registry::ControllerRegistry;
use spm_core::router::{self, route_message};
use spm_types::{
    ChargingEvent, CommandBatch, CommandRecord, ControllerVariant, DEPOT_PREFIX, SiteId, Tick,
    VehicleId,
};

fn arb_site() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["S1", "S2", "S3", "depot-1", "Depot-7", "my-depot"])
        .prop_map(String::from)
}

fn arb_record() -> impl Strategy<Value = Value> {
    (
        arb_site(),
        prop::option::of("V[0-9]{1,3}"),
        prop::option::of(0.0f64..50.0),
    )
        .prop_map(|(site, vehicle, max_power)| {
            let mut record = json!({ "siteId": site });
            if let Some(vehicle) = vehicle {
                record["vehicleId"] = json!(vehicle);
            }
            if let Some(max_power) = max_power {
                record["maxPowerInKW"] = json!(max_power);
            }
            record
        })
}

fn arb_message() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_record(), 0..40)
        .prop_map(|records| Value::Array(records).to_string())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn dispatch_encoded(mode: DispatchMode, raw: &str, tick: Tick) -> String {
    let mut registry = ControllerRegistry::new(Arc::new(BuiltinControllerFactory::default()));
    let routed = route_message(raw, tick).routed;
    let report = runtime().block_on(Dispatcher::new(mode).run_tick(&mut registry, routed, tick));
    codec::encode(&report.batch).unwrap()
}

/// Records every event any controller receives.
struct RecordingFactory {
    seen: Arc<Mutex<Vec<ChargingEvent>>>,
}

struct RecordingController {
    site_id: SiteId,
    seen: Arc<Mutex<Vec<ChargingEvent>>>,
}

impl SiteController for RecordingController {
    fn variant(&self) -> ControllerVariant {
        ControllerVariant::classify(&self.site_id)
    }

    fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    fn run(&mut self, _tick: Tick, events: &[ChargingEvent]) -> Result<(), ControllerError> {
        self.seen.lock().unwrap().extend_from_slice(events);
        Ok(())
    }

    fn output_from_latest_run(&self) -> Vec<CommandRecord> {
        Vec::new()
    }
}

impl ControllerFactory for RecordingFactory {
    fn create(&self, _variant: ControllerVariant, site_id: &SiteId) -> Box<dyn SiteController> {
        Box::new(RecordingController {
            site_id: site_id.clone(),
            seen: Arc::clone(&self.seen),
        })
    }
}

proptest! {
    #[test]
    fn sequential_and_concurrent_publish_identical_bytes(
        raw in arb_message(),
        tick in 0u64..100_000,
    ) {
        let sequential = dispatch_encoded(DispatchMode::Sequential, &raw, tick);
        let concurrent = dispatch_encoded(DispatchMode::Concurrent, &raw, tick);
        prop_assert_eq!(sequential, concurrent);
    }

    #[test]
    fn events_without_vehicle_never_reach_a_controller(raw in arb_message()) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = RecordingFactory { seen: Arc::clone(&seen) };
        let mut registry = ControllerRegistry::new(Arc::new(factory));
        let routed = route_message(&raw, 0).routed;
        let dispatcher = Dispatcher::new(DispatchMode::Concurrent);
        runtime().block_on(dispatcher.run_tick(&mut registry, routed, 0));

        let inbound: Vec<Value> = serde_json::from_str(&raw).unwrap();
        let with_vehicle = inbound.iter().filter(|r| r.get("vehicleId").is_some()).count();
        let seen = seen.lock().unwrap();
        prop_assert_eq!(seen.len(), with_vehicle);
        prop_assert!(seen.iter().all(|e| !e.vehicle_id.as_str().is_empty()));
    }

    #[test]
    fn classification_matches_lowercase_prefix(name in ".*") {
        let expected = if name.to_lowercase().starts_with(DEPOT_PREFIX) {
            ControllerVariant::RideHail
        } else {
            ControllerVariant::Default
        };
        let variant = ControllerVariant::classify(&SiteId::new(name.as_str()));
        prop_assert_eq!(variant, expected);
    }

    #[test]
    fn any_casing_of_the_prefix_is_a_depot(name in "[dD][eE][pP][oO][tT][a-zA-Z0-9_-]{0,12}") {
        let variant = ControllerVariant::classify(&SiteId::new(name.as_str()));
        prop_assert_eq!(variant, ControllerVariant::RideHail);
    }

    #[test]
    fn reordering_within_a_site_keeps_the_same_survivors(
        (records, shuffled) in prop::collection::vec(prop::option::of("V[0-9]{1,3}"), 0..20)
            .prop_flat_map(|vehicles| {
                let records: Vec<Value> = vehicles
                    .into_iter()
                    .map(|v| match v {
                        Some(v) => json!({ "siteId": "S1", "vehicleId": v }),
                        None => json!({ "siteId": "S1" }),
                    })
                    .collect();
                (Just(records.clone()), Just(records).prop_shuffle())
            })
    ) {
        let survivors = |values: Vec<Value>| {
            let (routed, _) = router::route_values(values);
            let mut ids: Vec<String> = routed
                .events_for(&SiteId::new("S1"))
                .unwrap_or_default()
                .iter()
                .map(|e| e.vehicle_id.to_string())
                .collect();
            ids.sort();
            ids
        };
        prop_assert_eq!(survivors(records), survivors(shuffled));
    }

    #[test]
    fn encode_then_decode_keeps_every_field(
        commands in prop::collection::vec(
            (arb_site(), "V[0-9]{1,3}", 0.0f64..1000.0, prop::option::of(0u32..500)),
            0..30,
        )
    ) {
        let batch: CommandBatch = commands
            .iter()
            .map(|(site, vehicle, power, energy)| {
                let record = CommandRecord::new(
                    SiteId::new(site.as_str()),
                    VehicleId::new(vehicle.as_str()),
                    *power,
                );
                match energy {
                    Some(energy) => record.with_extra("energyDeliveredInKWh", *energy),
                    None => record,
                }
            })
            .collect::<Vec<_>>()
            .into();

        let decoded = codec::decode(&codec::encode(&batch).unwrap()).unwrap();
        prop_assert_eq!(decoded.len(), batch.len());
        for (value, (site, vehicle, power, energy)) in decoded.iter().zip(&commands) {
            prop_assert_eq!(value["siteId"].as_str(), Some(site.as_str()));
            prop_assert_eq!(value["vehicleId"].as_str(), Some(vehicle.as_str()));
            let decoded_power = value["powerInKW"].as_f64().unwrap();
            prop_assert!((decoded_power - power).abs() <= 1e-9 * power.abs().max(1.0));
            prop_assert_eq!(
                value.get("energyDeliveredInKWh").and_then(Value::as_u64),
                energy.map(u64::from)
            );
        }
    }
}

#[test]
fn empty_batch_encodes_to_empty_array() {
    let encoded = codec::encode(&CommandBatch::new()).unwrap();
    assert_eq!(encoded, codec::EMPTY_BATCH);
    assert!(codec::decode(codec::EMPTY_BATCH).unwrap().is_empty());
}
