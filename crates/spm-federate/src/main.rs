//! Site power management federate binary.
//!
//! Launches one lock-step coordinator per configured federate, each with
//! its own NATS connection, controller registry, and CSV sink, and runs
//! them side by side until the simulated timeline is exhausted.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `spm-config.yaml` (or `$SPM_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Wire Ctrl-C to the shared shutdown signal
//! 4. Spawn one coordinator task per federate
//! 5. Join every federate and report the outcome

mod error;
mod nats_bus;

use std::path::PathBuf;
use std::sync::Arc;

use spm_core::Coordinator;
use spm_core::config::{FederationConfig, LogFormat, LoggingConfig};
use spm_core::controller::{BuiltinControllerFactory, ControllerFactory};
use spm_core::coordinator::RunSummary;
use spm_core::registry::ControllerRegistry;
use spm_core::sink::{CommandSink, CsvCommandSink, NullSink};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::FederateError;
use crate::nats_bus::NatsBus;

/// Config file used when `SPM_CONFIG` is not set.
const DEFAULT_CONFIG_PATH: &str = "spm-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration is invalid or any federate fails.
#[tokio::main]
async fn main() -> Result<(), FederateError> {
    let config = load_config()?;
    init_logging(&config.logging);

    info!(
        federates = config.federation.federate_count,
        simulated_duration_secs = config.federation.simulated_duration_secs,
        step_secs = config.federation.step_secs,
        dispatch_mode = ?config.federation.dispatch_mode,
        nats_url = config.bus.nats_url,
        "spm-federate starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping federates after the current tick");
            shutdown_tx.send_replace(true);
        }
    });

    let factory: Arc<dyn ControllerFactory> = Arc::new(
        BuiltinControllerFactory::new(config.controllers.clone())
            .with_step_secs(config.federation.step_secs),
    );
    let total = config.federation.federate_count;
    let config = Arc::new(config);

    let mut federates = JoinSet::new();
    for federate in 0..total {
        let config = Arc::clone(&config);
        let factory = Arc::clone(&factory);
        let shutdown = shutdown_rx.clone();
        federates.spawn(async move {
            let outcome = run_federate(federate, &config, factory, shutdown).await;
            (federate, outcome)
        });
    }

    let mut failed: u32 = 0;
    while let Some(joined) = federates.join_next().await {
        match joined {
            Ok((federate, Ok(summary))) => {
                info!(
                    federate,
                    ticks = summary.ticks_executed,
                    commands = summary.commands_published,
                    parse_errors = summary.parse_errors,
                    controller_failures = summary.controller_failures,
                    stopped_early = summary.stopped_early,
                    "Federate finalized"
                );
            }
            Ok((federate, Err(e))) => {
                error!(federate, error = %e, "Federate failed");
                failed = failed.saturating_add(1);
            }
            Err(e) => {
                error!(error = %e, "Federate task aborted");
                failed = failed.saturating_add(1);
            }
        }
    }

    if failed > 0 {
        return Err(FederateError::FederatesFailed { failed, total });
    }
    info!(federates = total, "spm-federate shutdown complete");
    Ok(())
}

/// Connect, build, and run one federate to completion.
async fn run_federate(
    federate: u32,
    config: &FederationConfig,
    factory: Arc<dyn ControllerFactory>,
    shutdown: watch::Receiver<bool>,
) -> Result<RunSummary, FederateError> {
    let bus = NatsBus::connect(&config.bus, federate).await?;
    let sink: Box<dyn CommandSink> = if config.output.enabled {
        Box::new(CsvCommandSink::new(config.output.path_for(federate)))
    } else {
        Box::new(NullSink)
    };
    let registry = ControllerRegistry::new(factory);
    let summary = Coordinator::new(federate, &config.federation, bus, registry)?
        .with_sink(sink)
        .with_shutdown(shutdown)
        .run()
        .await?;
    Ok(summary)
}

/// Load configuration from `$SPM_CONFIG` or `spm-config.yaml`.
///
/// A missing file means defaults (still subject to env overrides).
fn load_config() -> Result<FederationConfig, FederateError> {
    let path = std::env::var_os("SPM_CONFIG")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = if path.exists() {
        FederationConfig::from_file(&path)?
    } else {
        FederationConfig::parse("")?
    };
    Ok(config)
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
