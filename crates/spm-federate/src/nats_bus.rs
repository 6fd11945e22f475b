//! NATS implementation of the federate bus.
//!
//! Subjects for federate `N` (see [`BusConfig`]):
//!
//! - **Time grant:** request/reply on `{federate_prefix}{N}.TIME_REQUEST`.
//!   The request payload is the requested time in seconds; the reply is
//!   the granted time.
//! - **Inbound events:** `{upstream_prefix}{N}.{upstream_publication}`.
//! - **Outbound commands:** `{federate_prefix}{N}.{federate_publication}`.
//!
//! Inbound reads have value semantics: a tick sees the most recent message
//! received so far, and a tick with nothing received within the timeout
//! reads as empty.
//!
//! Time requests carry no client-side timeout. A grant blocks until the
//! broker replies, however long the slowest peer takes.

use std::time::Duration;

use futures::{FutureExt as _, StreamExt as _};
use spm_core::bus::{BusError, FederateBus};
use spm_core::config::BusConfig;
use spm_types::Tick;
use tracing::{debug, info, warn};

/// A federate's NATS connection and inbound subscription.
pub struct NatsBus {
    client: async_nats::Client,
    inbound: Option<async_nats::Subscriber>,
    time_subject: String,
    outbound_subject: String,
    receive_timeout: Duration,
}

impl NatsBus {
    /// Connect federate `federate` and subscribe to its inbound subject.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] if the server is unreachable or the
    /// subscription fails.
    pub async fn connect(config: &BusConfig, federate: u32) -> Result<Self, BusError> {
        info!(url = config.nats_url, federate, "connecting to NATS server");
        let client = connect_options(config, federate)
            .connect(config.nats_url.as_str())
            .await
            .map_err(|e| {
                BusError::Connection(format!("failed to connect to {}: {e}", config.nats_url))
            })?;

        let inbound_subject = config.inbound_subject(federate);
        let inbound = client
            .subscribe(inbound_subject.clone())
            .await
            .map_err(|e| {
                BusError::Connection(format!("failed to subscribe to {inbound_subject}: {e}"))
            })?;
        info!(
            federate = config.federate_name(federate),
            inbound = inbound_subject,
            "NATS federate connected"
        );

        Ok(Self {
            client,
            inbound: Some(inbound),
            time_subject: config.time_subject(federate),
            outbound_subject: config.outbound_subject(federate),
            receive_timeout: Duration::from_millis(config.receive_timeout_ms),
        })
    }

    const fn ensure_connected(&self) -> Result<(), BusError> {
        if self.inbound.is_some() {
            Ok(())
        } else {
            Err(BusError::Disconnected)
        }
    }
}

impl FederateBus for NatsBus {
    async fn request_time(&mut self, requested: Tick) -> Result<Tick, BusError> {
        self.ensure_connected()?;
        let reply = self
            .client
            .request(self.time_subject.clone(), requested.to_string().into())
            .await
            .map_err(|e| {
                BusError::Grant(format!("time request to {} failed: {e}", self.time_subject))
            })?;
        let granted = parse_grant(&reply.payload)?;
        debug!(requested, granted, "time granted");
        Ok(granted)
    }

    async fn receive(&mut self) -> Result<String, BusError> {
        let inbound = self.inbound.as_mut().ok_or(BusError::Disconnected)?;
        let mut latest = match tokio::time::timeout(self.receive_timeout, inbound.next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                return Err(BusError::Receive("inbound subscription closed".to_owned()));
            }
            Err(_) => return Ok(String::new()),
        };
        // Anything already queued is newer; keep only the last.
        let mut skipped: u32 = 0;
        while let Some(Some(msg)) = inbound.next().now_or_never() {
            latest = msg;
            skipped = skipped.saturating_add(1);
        }
        if skipped > 0 {
            debug!(skipped, "superseded inbound messages dropped");
        }
        Ok(String::from_utf8_lossy(&latest.payload).into_owned())
    }

    async fn publish(&mut self, payload: &str) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.client
            .publish(self.outbound_subject.clone(), payload.to_owned().into())
            .await
            .map_err(|e| {
                BusError::Publish(format!("publish to {} failed: {e}", self.outbound_subject))
            })?;
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Publish(format!("flush failed: {e}")))
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        let Some(mut inbound) = self.inbound.take() else {
            return Err(BusError::Disconnected);
        };
        if let Err(e) = inbound.unsubscribe().await {
            warn!(error = %e, "failed to unsubscribe inbound subject");
        }
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(format!("flush on disconnect failed: {e}")))
    }
}

/// Client options for one federate's connection.
///
/// The default client request timeout is disabled: lockstep grants must
/// wait for the broker rather than fail the federate.
fn connect_options(config: &BusConfig, federate: u32) -> async_nats::ConnectOptions {
    async_nats::ConnectOptions::new()
        .name(config.federate_name(federate))
        .request_timeout(None)
}

/// Parse a time-grant reply: the granted time in whole seconds.
fn parse_grant(payload: &[u8]) -> Result<Tick, BusError> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    if let Ok(granted) = text.parse::<Tick>() {
        return Ok(granted);
    }
    // Some brokers reply with a float time; whole seconds are what count.
    match text.parse::<f64>() {
        Ok(granted) if granted.is_finite() && granted >= 0.0 => {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let granted = granted.floor() as Tick;
            Ok(granted)
        }
        _ => Err(BusError::Grant(format!("invalid time grant reply: {text:?}"))),
    }
}

impl std::fmt::Debug for NatsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBus")
            .field("time_subject", &self.time_subject)
            .field("outbound_subject", &self.outbound_subject)
            .field("connected", &self.inbound.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures::StreamExt as _;

    use super::*;

    #[test]
    fn grant_parses_integer_and_float_seconds() {
        assert_eq!(parse_grant(b"60").unwrap(), 60);
        assert_eq!(parse_grant(b" 61\n").unwrap(), 61);
        assert_eq!(parse_grant(b"120.0").unwrap(), 120);
    }

    #[test]
    fn grant_rejects_garbage() {
        assert!(matches!(parse_grant(b"soon"), Err(BusError::Grant(_))));
        assert!(matches!(parse_grant(b"-5"), Err(BusError::Grant(_))));
        assert!(matches!(parse_grant(b""), Err(BusError::Grant(_))));
    }

    /// Round trip against a live server; skipped when none is reachable.
    #[tokio::test]
    async fn grant_receive_publish_round_trip() {
        let config = BusConfig {
            federate_prefix: format!("SPM_TEST_{}_", std::process::id()),
            upstream_prefix: format!("UP_TEST_{}_", std::process::id()),
            receive_timeout_ms: 200,
            ..BusConfig::default()
        };
        let Ok(peer) = async_nats::connect(config.nats_url.as_str()).await else {
            return;
        };

        // Grant every request, the first one only after a delay.
        let mut time_requests = peer.subscribe(config.time_subject(0)).await.unwrap();
        let responder = peer.clone();
        tokio::spawn(async move {
            let mut first = true;
            while let Some(msg) = time_requests.next().await {
                if std::mem::take(&mut first) {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                if let Some(reply) = msg.reply {
                    responder.publish(reply, msg.payload).await.ok();
                }
            }
        });
        let mut commands = peer.subscribe(config.outbound_subject(0)).await.unwrap();
        peer.flush().await.unwrap();

        let mut bus = NatsBus::connect(&config, 0).await.unwrap();
        assert_eq!(bus.client.timeout(), None);
        assert_eq!(bus.request_time(60).await.unwrap(), 60);

        // Nothing published yet: an empty tick.
        assert_eq!(bus.receive().await.unwrap(), "");

        peer.publish(config.inbound_subject(0), "[1]".into()).await.unwrap();
        peer.publish(config.inbound_subject(0), "[2]".into()).await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.receive().await.unwrap(), "[2]");

        bus.publish("[]").await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), commands.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload.as_ref(), b"[]");

        bus.disconnect().await.unwrap();
        assert!(matches!(bus.publish("[]").await, Err(BusError::Disconnected)));
    }
}
