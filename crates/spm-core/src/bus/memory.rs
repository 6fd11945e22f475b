use std::collections::HashMap;

use spm_types::Tick;

use super::{BusError, FederateBus};

/// In-process bus with scripted input and captured output.
///
/// Inbound messages are keyed by the tick they should be delivered at; a
/// tick without a scripted message reads as the empty string. The bus
/// grants exactly the requested time unless grant lag or stall mode is
/// configured.
#[derive(Debug, Default)]
pub struct MemoryBus {
    inbound: HashMap<Tick, String>,
    grant_lag: Tick,
    lagged_requests: u32,
    stalled: bool,
    granted: Tick,
    requests: Vec<Tick>,
    published: Vec<(Tick, String)>,
    disconnected: bool,
}

impl MemoryBus {
    /// An empty bus that grants every request immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the inbound message delivered at `tick`.
    #[must_use]
    pub fn with_message(mut self, tick: Tick, raw: impl Into<String>) -> Self {
        self.inbound.insert(tick, raw.into());
        self
    }

    /// Grant `requested - lag` for the first `requests` time requests.
    #[must_use]
    pub const fn with_grant_lag(mut self, lag: Tick, requests: u32) -> Self {
        self.grant_lag = lag;
        self.lagged_requests = requests;
        self
    }

    /// Never advance past the last granted time.
    #[must_use]
    pub const fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Every time request issued, in order.
    pub fn requests(&self) -> &[Tick] {
        &self.requests
    }

    /// Every published payload with the granted time it was published at.
    pub fn published(&self) -> &[(Tick, String)] {
        &self.published
    }

    /// Published payloads only.
    pub fn payloads(&self) -> Vec<&str> {
        self.published.iter().map(|(_, p)| p.as_str()).collect()
    }

    /// The most recently granted time.
    pub const fn granted(&self) -> Tick {
        self.granted
    }

    /// Whether [`FederateBus::disconnect`] has been called.
    pub const fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    const fn ensure_connected(&self) -> Result<(), BusError> {
        if self.disconnected {
            Err(BusError::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl FederateBus for MemoryBus {
    async fn request_time(&mut self, requested: Tick) -> Result<Tick, BusError> {
        self.ensure_connected()?;
        self.requests.push(requested);
        if self.stalled {
            return Ok(self.granted);
        }
        if self.lagged_requests > 0 {
            self.lagged_requests = self.lagged_requests.saturating_sub(1);
            self.granted = requested.saturating_sub(self.grant_lag);
        } else {
            self.granted = requested;
        }
        Ok(self.granted)
    }

    async fn receive(&mut self) -> Result<String, BusError> {
        self.ensure_connected()?;
        Ok(self.inbound.remove(&self.granted).unwrap_or_default())
    }

    async fn publish(&mut self, payload: &str) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.published.push((self.granted, payload.to_owned()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.disconnected = true;
        Ok(())
    }
}
