//! Outbound relay: result set -> every destination channel.
//!
//! One message popped from `<m>out` is published unmodified to each
//! destination in configured order, without delivery confirmation. When the
//! set is empty the relay sleeps for a fixed backoff before trying again; on
//! brokers with a native blocking pop it waits inside the pop instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::{RelayStats, SharedRelayStats};
use crate::broker::Broker;
use crate::config::Settings;
use crate::error::{BrokerError, RelayError};
use crate::keys::QueueKeys;
use crate::shutdown;

/// A channel the relay publishes to, with the broker that carries it.
#[derive(Clone)]
pub struct Destination {
    channel: String,
    broker: Arc<dyn Broker>,
}

impl Destination {
    pub fn new(channel: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        Self {
            channel: channel.into(),
            broker,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Why the outbound relay returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundExit {
    /// The module is a pipeline exit; the relay never ran.
    NoDestinations,
    /// Shutdown was requested.
    Shutdown,
}

/// Drains a module's result set into its destination channels.
pub struct OutboundRelay {
    keys: QueueKeys,
    broker: Arc<dyn Broker>,
    destinations: Vec<Destination>,
    backoff: Duration,
    stats: SharedRelayStats,
}

impl OutboundRelay {
    /// Creates an outbound relay.
    ///
    /// # Arguments
    ///
    /// * `module` - Module name
    /// * `broker` - Broker holding the module's result set
    /// * `destinations` - Channels to publish to, in order
    /// * `settings` - Empty-queue backoff
    pub fn new(
        module: &str,
        broker: Arc<dyn Broker>,
        destinations: Vec<Destination>,
        settings: &Settings,
    ) -> Self {
        Self {
            keys: QueueKeys::new(module),
            broker,
            destinations,
            backoff: settings.outbound_backoff,
            stats: SharedRelayStats::default(),
        }
    }

    /// Whether the module publishes anywhere.
    pub fn has_destinations(&self) -> bool {
        !self.destinations.is_empty()
    }

    /// Counters since start.
    pub fn stats(&self) -> RelayStats {
        self.stats.snapshot()
    }

    /// Pops one message and fans it out.
    ///
    /// Returns the relayed message, or `None` when the result set was empty
    /// (after waiting up to one backoff on brokers with blocking pops).
    ///
    /// A failed publish puts the message back into the result set before the
    /// error is returned, so a broker outage causes duplicates, not loss.
    pub async fn relay_once(&self) -> Result<Option<String>, BrokerError> {
        let popped = if self.broker.supports_blocking_pop() {
            self.broker
                .spop_timeout(self.keys.ready_out(), self.backoff)
                .await?
        } else {
            self.broker.spop(self.keys.ready_out()).await?
        };

        let Some(message) = popped else {
            return Ok(None);
        };

        for destination in &self.destinations {
            if let Err(e) = destination
                .broker
                .publish(&destination.channel, &message)
                .await
            {
                error!(
                    module = %self.keys.module(),
                    channel = %destination.channel,
                    error = %e,
                    "Publish failed, returning message to result set"
                );
                if let Err(requeue_err) = self.broker.sadd(self.keys.ready_out(), &message).await {
                    error!(
                        module = %self.keys.module(),
                        error = %requeue_err,
                        "Failed to return message to result set"
                    );
                }
                return Err(e);
            }
        }

        self.stats.record_relayed();
        debug!(
            module = %self.keys.module(),
            destinations = self.destinations.len(),
            "Message relayed"
        );
        Ok(Some(message))
    }

    /// Relays until shutdown.
    ///
    /// A module without destinations returns `OutboundExit::NoDestinations`
    /// immediately, without touching the broker.
    pub async fn run(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<OutboundExit, RelayError> {
        if !self.has_destinations() {
            info!(
                module = %self.keys.module(),
                "Module has no destination queues, outbound relay not started"
            );
            return Ok(OutboundExit::NoDestinations);
        }

        info!(
            module = %self.keys.module(),
            source = %self.keys.ready_out(),
            destinations = %self
                .destinations
                .iter()
                .map(Destination::channel)
                .collect::<Vec<_>>()
                .join(", "),
            "Outbound relay started"
        );

        let blocking = self.broker.supports_blocking_pop();
        loop {
            if shutdown::requested(&mut shutdown_rx) {
                break;
            }

            let relayed = self.relay_once().await?;

            if relayed.is_none() && !blocking {
                tokio::select! {
                    _ = shutdown::wait(&mut shutdown_rx) => break,
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }

        info!(
            module = %self.keys.module(),
            relayed = self.stats().relayed,
            "Outbound relay stopped"
        );
        Ok(OutboundExit::Shutdown)
    }
}
