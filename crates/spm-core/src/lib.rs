//! Tick coordinator, event routing, and controller dispatch for the site
//! power management (SPM) federate.
//!
//! A federate runs in lock-step with an external simulator. Every tick it
//! receives a batch of charging events, groups them by site, runs one
//! stateful controller per active site, and publishes the concatenated
//! power commands back on the bus.
//!
//! # Modules
//!
//! - [`bus`] -- [`FederateBus`] trait and the in-memory [`MemoryBus`].
//! - [`codec`] -- JSON decoding of inbound and encoding of outbound messages.
//! - [`config`] -- Configuration loading from `spm-config.yaml`.
//! - [`controller`] -- [`SiteController`] trait and the built-in variants.
//! - [`coordinator`] -- The per-tick state machine.
//! - [`dispatch`] -- Sequential and concurrent execution of a tick's sites.
//! - [`registry`] -- Per-site controller instances, created lazily.
//! - [`router`] -- Grouping of inbound events by site.
//! - [`sink`] -- Append-only CSV record of published batches.
//!
//! [`FederateBus`]: bus::FederateBus
//! [`MemoryBus`]: bus::MemoryBus
//! [`SiteController`]: controller::SiteController

pub mod bus;
pub mod codec;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod dispatch;
pub mod registry;
pub mod router;
pub mod sink;

pub use coordinator::{Coordinator, CoordinatorError, Phase, RunSummary};
