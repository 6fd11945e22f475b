//! Tick coordinator: the lock-step loop that drives one federate.
//!
//! Each tick runs through these phases:
//!
//! 1. **`AwaitGrant`** -- request the tick from the bus, re-requesting
//!    until the granted time reaches it.
//! 2. **Receive** -- read exactly one inbound message.
//! 3. **Route** -- decode and group events by site.
//! 4. **Dispatch** -- run each active site's controller.
//! 5. **Aggregate** -- concatenate outputs in site order and append the
//!    batch to the sink.
//! 6. **Publish** -- send the encoded batch, `[]` when there was no work.
//! 7. **`AdvanceGrant`** -- request `tick + 1` with the same handshake.
//!
//! The loop covers ticks `0, step, 2*step, ...` strictly below
//! `simulated_duration - step`, then enters **Shutdown**, which
//! disconnects the bus. Shutdown is terminal: `run` consumes the
//! coordinator.
//!
//! Only bus failures end a run early. Malformed input, controller
//! failures and sink errors are logged and the tick still publishes.

use spm_types::{CommandBatch, Tick};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bus::{BusError, FederateBus};
use crate::codec;
use crate::config::RunConfig;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::registry::ControllerRegistry;
use crate::router::{self, RoutedTick};
use crate::sink::{CommandSink, NullSink};

/// Errors that end a coordinator's run.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The bus failed or violated the lock-step protocol.
    #[error("bus failure during {phase} at tick {tick}: {source}")]
    Bus {
        /// Phase the failure happened in.
        phase: Phase,
        /// Tick being processed.
        tick: Tick,
        /// The underlying bus error.
        source: BusError,
    },

    /// The run configuration cannot produce a tick schedule.
    #[error("invalid tick schedule: {reason}")]
    InvalidSchedule {
        /// What is wrong with the schedule.
        reason: String,
    },
}

/// Phases of the per-tick state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the bus to grant the current tick.
    AwaitGrant,
    /// Reading the inbound message.
    Receive,
    /// Grouping events by site.
    Route,
    /// Running site controllers.
    Dispatch,
    /// Collecting outputs and recording them.
    Aggregate,
    /// Publishing the batch.
    Publish,
    /// Requesting the time just past the current tick.
    AdvanceGrant,
    /// Releasing the bus.
    Shutdown,
}

impl Phase {
    /// Stable name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitGrant => "await_grant",
            Self::Receive => "receive",
            Self::Route => "route",
            Self::Dispatch => "dispatch",
            Self::Aggregate => "aggregate",
            Self::Publish => "publish",
            Self::AdvanceGrant => "advance_grant",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Totals for one federate's run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Federate index.
    pub federate: u32,
    /// Ticks that completed the publish phase.
    pub ticks_executed: u64,
    /// Ticks where at least one site had events.
    pub ticks_with_work: u64,
    /// Commands published across all ticks.
    pub commands_published: u64,
    /// Ticks whose inbound message was malformed.
    pub parse_errors: u64,
    /// Site runs that failed or panicked.
    pub controller_failures: u64,
    /// Last tick that was published.
    pub final_tick: Option<Tick>,
    /// Whether a shutdown signal ended the run before the schedule did.
    pub stopped_early: bool,
}

/// Machine state, carrying what the next phase needs.
enum State {
    AwaitGrant { tick: Tick },
    Receive { tick: Tick },
    Route { tick: Tick, raw: String },
    Dispatch { tick: Tick, routed: RoutedTick },
    Aggregate { tick: Tick, report: DispatchReport },
    Publish { tick: Tick, batch: CommandBatch },
    AdvanceGrant { tick: Tick },
    Shutdown,
}

impl State {
    const fn phase(&self) -> Phase {
        match self {
            Self::AwaitGrant { .. } => Phase::AwaitGrant,
            Self::Receive { .. } => Phase::Receive,
            Self::Route { .. } => Phase::Route,
            Self::Dispatch { .. } => Phase::Dispatch,
            Self::Aggregate { .. } => Phase::Aggregate,
            Self::Publish { .. } => Phase::Publish,
            Self::AdvanceGrant { .. } => Phase::AdvanceGrant,
            Self::Shutdown => Phase::Shutdown,
        }
    }
}

/// Drives one federate through the whole simulated timeline.
pub struct Coordinator<B> {
    federate: u32,
    step: Tick,
    end: Tick,
    max_grant_attempts: u32,
    progress_interval: Tick,
    bus: B,
    registry: ControllerRegistry,
    dispatcher: Dispatcher,
    sink: Box<dyn CommandSink>,
    shutdown: Option<watch::Receiver<bool>>,
    summary: RunSummary,
}

impl<B: FederateBus> Coordinator<B> {
    /// Build a coordinator for federate `federate`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidSchedule`] if `step_secs` is zero.
    pub fn new(
        federate: u32,
        config: &RunConfig,
        bus: B,
        registry: ControllerRegistry,
    ) -> Result<Self, CoordinatorError> {
        if config.step_secs == 0 {
            return Err(CoordinatorError::InvalidSchedule {
                reason: "step_secs must be greater than zero".to_owned(),
            });
        }
        Ok(Self {
            federate,
            step: config.step_secs,
            end: config
                .simulated_duration_secs
                .saturating_sub(config.step_secs),
            max_grant_attempts: config.max_grant_attempts,
            progress_interval: config.progress_interval_secs,
            bus,
            registry,
            dispatcher: Dispatcher::new(config.dispatch_mode),
            sink: Box::new(NullSink),
            shutdown: None,
            summary: RunSummary {
                federate,
                ..RunSummary::default()
            },
        })
    }

    /// Record every non-empty batch to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn CommandSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Stop between ticks once `shutdown` turns `true`.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run every tick of the schedule, then disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Bus`] if the bus fails or never grants a
    /// requested time. The bus is still released on a best-effort basis.
    pub async fn run(self) -> Result<RunSummary, CoordinatorError> {
        let span = info_span!("federate", federate = self.federate);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) -> Result<RunSummary, CoordinatorError> {
        info!(
            step_secs = self.step,
            end_tick = self.end,
            dispatch_mode = ?self.dispatcher.mode(),
            "Federate starting"
        );

        let mut state = self.first_state(0);
        loop {
            let phase = state.phase();
            state = match self.step_state(state).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    error!(phase = %phase, error = %e, "Federate failed, releasing bus");
                    if let Err(disconnect_err) = self.bus.disconnect().await {
                        warn!(error = %disconnect_err, "disconnect after failure also failed");
                    }
                    return Err(e);
                }
            };
        }

        info!(
            ticks = self.summary.ticks_executed,
            ticks_with_work = self.summary.ticks_with_work,
            commands = self.summary.commands_published,
            parse_errors = self.summary.parse_errors,
            controller_failures = self.summary.controller_failures,
            sites = self.registry.len(),
            "Federate finished"
        );
        Ok(self.summary)
    }

    /// Advance the machine by one phase. `None` means the run is over.
    async fn step_state(&mut self, state: State) -> Result<Option<State>, CoordinatorError> {
        let next = match state {
            State::AwaitGrant { tick } => {
                self.sync_time(tick, tick, Phase::AwaitGrant).await?;
                State::Receive { tick }
            }

            State::Receive { tick } => {
                let raw = self.bus.receive().await.map_err(|source| CoordinatorError::Bus {
                    phase: Phase::Receive,
                    tick,
                    source,
                })?;
                State::Route { tick, raw }
            }

            State::Route { tick, raw } => {
                let outcome = router::route_message(&raw, tick);
                if outcome.parse_error.is_some() {
                    self.summary.parse_errors = self.summary.parse_errors.saturating_add(1);
                }
                State::Dispatch {
                    tick,
                    routed: outcome.routed,
                }
            }

            State::Dispatch { tick, routed } => {
                if !routed.is_empty() {
                    self.summary.ticks_with_work = self.summary.ticks_with_work.saturating_add(1);
                    debug!(
                        tick,
                        sites = routed.site_count(),
                        events = routed.event_count(),
                        "routed tick"
                    );
                }
                let report = self
                    .dispatcher
                    .run_tick(&mut self.registry, routed, tick)
                    .await;
                State::Aggregate { tick, report }
            }

            State::Aggregate { tick, report } => {
                let failures = u64::try_from(report.failures.len()).unwrap_or(u64::MAX);
                self.summary.controller_failures =
                    self.summary.controller_failures.saturating_add(failures);
                if let Err(e) = self.sink.append(tick, &report.batch) {
                    warn!(tick, error = %e, "failed to record command batch");
                }
                State::Publish {
                    tick,
                    batch: report.batch,
                }
            }

            State::Publish { tick, batch } => {
                let payload = codec::encode(&batch).unwrap_or_else(|e| {
                    error!(tick, error = %e, "failed to encode command batch, publishing empty");
                    codec::EMPTY_BATCH.to_owned()
                });
                self.bus
                    .publish(&payload)
                    .await
                    .map_err(|source| CoordinatorError::Bus {
                        phase: Phase::Publish,
                        tick,
                        source,
                    })?;
                debug!(tick, commands = batch.len(), bytes = payload.len(), "published");
                let published = u64::try_from(batch.len()).unwrap_or(u64::MAX);
                self.summary.commands_published =
                    self.summary.commands_published.saturating_add(published);
                self.summary.ticks_executed = self.summary.ticks_executed.saturating_add(1);
                self.summary.final_tick = Some(tick);
                State::AdvanceGrant { tick }
            }

            State::AdvanceGrant { tick } => {
                let requested = tick.saturating_add(1);
                self.sync_time(requested, tick, Phase::AdvanceGrant).await?;
                self.log_progress(tick);
                let next = tick.checked_add(self.step).filter(|next| *next < self.end);
                next.map_or(State::Shutdown, |next| self.first_state(next))
            }

            State::Shutdown => {
                self.bus
                    .disconnect()
                    .await
                    .map_err(|source| CoordinatorError::Bus {
                        phase: Phase::Shutdown,
                        tick: self.summary.final_tick.unwrap_or_default(),
                        source,
                    })?;
                info!("Federate disconnected");
                return Ok(None);
            }
        };
        Ok(Some(next))
    }

    /// State for the start of `tick`: `AwaitGrant`, or `Shutdown` when the
    /// schedule is exhausted or a stop was requested.
    fn first_state(&mut self, tick: Tick) -> State {
        if tick >= self.end {
            return State::Shutdown;
        }
        if self.stop_requested() {
            info!(tick, "Shutdown requested, stopping before tick");
            self.summary.stopped_early = true;
            return State::Shutdown;
        }
        State::AwaitGrant { tick }
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Request `requested` until the bus grants at least that much.
    ///
    /// The bus may legitimately grant an earlier time; proceeding before
    /// the grant reaches the request would desynchronize the external
    /// simulator. `max_grant_attempts` (0 = unbounded) turns a bus that
    /// never catches up into [`BusError::GrantStalled`].
    async fn sync_time(
        &mut self,
        requested: Tick,
        tick: Tick,
        phase: Phase,
    ) -> Result<Tick, CoordinatorError> {
        let mut attempts: u32 = 0;
        loop {
            let granted = self
                .bus
                .request_time(requested)
                .await
                .map_err(|source| CoordinatorError::Bus {
                    phase,
                    tick,
                    source,
                })?;
            attempts = attempts.saturating_add(1);
            if granted >= requested {
                return Ok(granted);
            }
            debug!(
                requested,
                granted,
                attempts,
                phase = %phase,
                "grant below request, re-requesting"
            );
            if self.max_grant_attempts != 0 && attempts >= self.max_grant_attempts {
                return Err(CoordinatorError::Bus {
                    phase,
                    tick,
                    source: BusError::GrantStalled {
                        requested,
                        last_granted: granted,
                        attempts,
                    },
                });
            }
        }
    }

    fn log_progress(&self, tick: Tick) {
        if tick.checked_rem(self.progress_interval) == Some(0) {
            #[allow(clippy::arithmetic_side_effects, clippy::cast_precision_loss)]
            let hour = tick as f64 / 3600.0;
            info!(tick, hour, sites = self.registry.len(), "Hour {hour} completed");
        }
    }
}

impl<B> std::fmt::Debug for Coordinator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("federate", &self.federate)
            .field("step", &self.step)
            .field("end", &self.end)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
