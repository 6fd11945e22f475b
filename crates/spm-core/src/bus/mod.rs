//! The time-synchronized bus a federate talks to.
//!
//! The coordinator treats the bus as four opaque operations: a blocking
//! time-advance handshake, one inbound string read per tick, one outbound
//! string publish per tick, and a final disconnect. Any failure here is a
//! protocol violation and ends the federate's run.
//!
//! [`MemoryBus`] is the in-process implementation used by tests; the
//! federate binary provides a NATS-backed one.

mod memory;

use std::future::Future;

use spm_types::Tick;

pub use memory::MemoryBus;

/// Errors raised by a bus implementation. All of them are fatal to the
/// federate that hit them.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The connection could not be established or was lost.
    #[error("bus connection error: {0}")]
    Connection(String),

    /// A time-advance request failed outright.
    #[error("time grant failed: {0}")]
    Grant(String),

    /// The bus kept granting a time below the requested one.
    #[error(
        "time grant stalled: requested {requested}, last granted {last_granted} after {attempts} attempts"
    )]
    GrantStalled {
        /// The tick that was requested.
        requested: Tick,
        /// The last time the bus granted.
        last_granted: Tick,
        /// How many requests were issued.
        attempts: u32,
    },

    /// Reading the inbound message failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// Publishing the outbound message failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The bus was used after it was disconnected.
    #[error("bus is disconnected")]
    Disconnected,
}

/// One federate's view of the co-simulation bus.
///
/// Implementations may write these methods as `async fn`; the returned
/// futures must be `Send` so a coordinator can run on a spawned task.
pub trait FederateBus: Send {
    /// Ask the bus to advance to `requested` and return the granted time.
    ///
    /// The granted time may be lower than requested; callers re-request
    /// until it is not.
    fn request_time(
        &mut self,
        requested: Tick,
    ) -> impl Future<Output = Result<Tick, BusError>> + Send;

    /// Read this tick's inbound message. An empty string means no input.
    fn receive(&mut self) -> impl Future<Output = Result<String, BusError>> + Send;

    /// Publish this tick's outbound message.
    fn publish(&mut self, payload: &str) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Release the bus. Later calls fail with [`BusError::Disconnected`].
    fn disconnect(&mut self) -> impl Future<Output = Result<(), BusError>> + Send;
}

impl<B: FederateBus> FederateBus for &mut B {
    fn request_time(
        &mut self,
        requested: Tick,
    ) -> impl Future<Output = Result<Tick, BusError>> + Send {
        (**self).request_time(requested)
    }

    fn receive(&mut self) -> impl Future<Output = Result<String, BusError>> + Send {
        (**self).receive()
    }

    fn publish(&mut self, payload: &str) -> impl Future<Output = Result<(), BusError>> + Send {
        (**self).publish(payload)
    }

    fn disconnect(&mut self) -> impl Future<Output = Result<(), BusError>> + Send {
        (**self).disconnect()
    }
}
