//! Error types for the federate binary.
//!
//! [`FederateError`] wraps every failure that can end a federate or the
//! process: configuration, bus connectivity, and the coordinator loop.

use spm_core::bus::BusError;
use spm_core::config::ConfigError;
use spm_core::coordinator::CoordinatorError;

/// Top-level error for the federate binary.
#[derive(Debug, thiserror::Error)]
pub enum FederateError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// Connecting to the bus failed.
    #[error("bus error: {source}")]
    Bus {
        /// The underlying bus error.
        #[from]
        source: BusError,
    },

    /// A coordinator stopped on a fatal error.
    #[error("coordinator error: {source}")]
    Coordinator {
        /// The underlying coordinator error.
        #[from]
        source: CoordinatorError,
    },

    /// One or more sibling federates did not finish cleanly.
    #[error("{failed} of {total} federates failed")]
    FederatesFailed {
        /// Number of federates that failed.
        failed: u32,
        /// Number of federates launched.
        total: u32,
    },
}
