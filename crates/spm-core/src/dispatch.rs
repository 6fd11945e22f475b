//! Dispatch strategy: run one tick's controllers and collect their output.
//!
//! Two interchangeable modes share one contract:
//!
//! - [`DispatchMode::Sequential`] runs each site's controller in turn on
//!   the coordinator task.
//! - [`DispatchMode::Concurrent`] starts one blocking worker per site and
//!   waits for every worker before reading any output.
//!
//! In both modes outputs are read in the routed site order, so the
//! published batch is identical whichever mode is used and whatever order
//! the workers finish in.
//!
//! A controller that returns an error or panics contributes nothing for
//! the tick. The failure is logged and reported; other sites are
//! unaffected. A controller that returned an error keeps its state. One
//! that panicked, or whose worker was lost, is dropped along with that
//! state, and the registry builds a fresh one on the site's next sighting.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use serde::Deserialize;
use spm_types::{ChargingEvent, CommandBatch, SiteId, Tick};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::controller::{ControllerError, SiteController};
use crate::registry::ControllerRegistry;
use crate::router::{RoutedTick, SiteEvents};

/// How site controllers are executed within a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One site after another on the calling task.
    #[default]
    Sequential,
    /// One worker per site, joined before aggregation.
    Concurrent,
}

/// Why a site produced no output this tick.
#[derive(Debug, thiserror::Error)]
pub enum SiteFailure {
    /// The controller reported an error.
    #[error("controller for site {site_id} failed: {source}")]
    Controller {
        /// The failing site.
        site_id: SiteId,
        /// The controller's error.
        source: ControllerError,
    },

    /// The controller panicked; its instance was discarded.
    #[error("controller for site {site_id} panicked: {message}")]
    Panicked {
        /// The failing site.
        site_id: SiteId,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// The worker running the controller never reported back.
    ///
    /// The controller moved onto that worker is gone with it, so the site
    /// restarts from a fresh controller, as after a panic.
    #[error("worker for site {site_id} did not complete: {message}")]
    Lost {
        /// The failing site.
        site_id: SiteId,
        /// Why the worker was lost.
        message: String,
    },
}

impl SiteFailure {
    /// The site that failed.
    pub const fn site_id(&self) -> &SiteId {
        match self {
            Self::Controller { site_id, .. }
            | Self::Panicked { site_id, .. }
            | Self::Lost { site_id, .. } => site_id,
        }
    }
}

/// Aggregated output of one tick.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Commands from all sites, concatenated in routed site order.
    pub batch: CommandBatch,
    /// Sites that ran successfully.
    pub sites_run: usize,
    /// Sites that contributed nothing because their controller failed.
    pub failures: Vec<SiteFailure>,
}

/// Result of running one controller, before its output is read.
struct SiteRun {
    /// The controller, unless it panicked.
    controller: Option<Box<dyn SiteController>>,
    result: Result<(), SiteFailure>,
}

/// Executes a tick's routed work against a registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher {
    mode: DispatchMode,
}

impl Dispatcher {
    /// Create a dispatcher using `mode`.
    pub const fn new(mode: DispatchMode) -> Self {
        Self { mode }
    }

    /// The configured mode.
    pub const fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Run every routed site's controller for `tick` and aggregate outputs.
    pub async fn run_tick(
        &self,
        registry: &mut ControllerRegistry,
        routed: RoutedTick,
        tick: Tick,
    ) -> DispatchReport {
        if routed.is_empty() {
            return DispatchReport::default();
        }
        let sites = routed.into_sites();
        debug!(tick, sites = sites.len(), mode = ?self.mode, "dispatching tick");
        match self.mode {
            DispatchMode::Sequential => run_sequential(registry, sites, tick),
            DispatchMode::Concurrent => run_concurrent(registry, sites, tick).await,
        }
    }
}

fn run_sequential(
    registry: &mut ControllerRegistry,
    sites: Vec<SiteEvents>,
    tick: Tick,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for SiteEvents { site_id, events } in sites {
        let controller = registry.check_out(&site_id);
        let run = run_site(controller, &site_id, tick, &events);
        collect(registry, &mut report, site_id, Some(run), tick);
    }
    report
}

async fn run_concurrent(
    registry: &mut ControllerRegistry,
    sites: Vec<SiteEvents>,
    tick: Tick,
) -> DispatchReport {
    let mut order: Vec<SiteId> = Vec::with_capacity(sites.len());
    let mut workers: JoinSet<(usize, SiteRun)> = JoinSet::new();

    for (slot, SiteEvents { site_id, events }) in sites.into_iter().enumerate() {
        let controller = registry.check_out(&site_id);
        let worker_site = site_id.clone();
        order.push(site_id);
        let run = move || (slot, run_site(controller, &worker_site, tick, &events));
        workers.spawn_blocking(run);
    }

    // Barrier: nothing is read until every worker has finished.
    let mut runs: Vec<Option<SiteRun>> = order.iter().map(|_| None).collect();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((slot, run)) => {
                if let Some(entry) = runs.get_mut(slot) {
                    *entry = Some(run);
                }
            }
            Err(e) => error!(tick, error = %e, "site worker did not complete"),
        }
    }

    let mut report = DispatchReport::default();
    for (site_id, run) in order.into_iter().zip(runs) {
        collect(registry, &mut report, site_id, run, tick);
    }
    report
}

/// Run one controller, containing any panic.
fn run_site(
    mut controller: Box<dyn SiteController>,
    site_id: &SiteId,
    tick: Tick,
    events: &[ChargingEvent],
) -> SiteRun {
    match panic::catch_unwind(AssertUnwindSafe(|| controller.run(tick, events))) {
        Ok(Ok(())) => SiteRun {
            controller: Some(controller),
            result: Ok(()),
        },
        Ok(Err(source)) => SiteRun {
            controller: Some(controller),
            result: Err(SiteFailure::Controller {
                site_id: site_id.clone(),
                source,
            }),
        },
        Err(payload) => SiteRun {
            controller: None,
            result: Err(SiteFailure::Panicked {
                site_id: site_id.clone(),
                message: panic_message(payload.as_ref()),
            }),
        },
    }
}

/// Read a finished site's output into the report and return its
/// controller to the registry.
fn collect(
    registry: &mut ControllerRegistry,
    report: &mut DispatchReport,
    site_id: SiteId,
    run: Option<SiteRun>,
    tick: Tick,
) {
    let Some(SiteRun { controller, result }) = run else {
        let failure = SiteFailure::Lost {
            site_id,
            message: "worker was cancelled or panicked outside the controller".to_owned(),
        };
        error!(tick, site_id = %failure.site_id(), error = %failure, "site contributes no output");
        report.failures.push(failure);
        return;
    };

    match result {
        Ok(()) => {
            if let Some(controller) = controller.as_ref() {
                let output = controller.output_from_latest_run();
                debug!(tick, site_id = %site_id, commands = output.len(), "site controller ran");
                report.batch.extend_from_site(output);
                report.sites_run = report.sites_run.saturating_add(1);
            }
        }
        Err(failure) => {
            error!(tick, site_id = %site_id, error = %failure, "site contributes no output");
            report.failures.push(failure);
        }
    }

    if let Some(controller) = controller {
        registry.check_in(controller);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
