//! Inbound relay: source channel -> ready set / delayed set.
//!
//! The relay blocks on its subscription for at most `receive_timeout`, then
//! drains whatever is already buffered without waiting. After every cycle,
//! busy or idle, it runs one delayed-promotion pass, so delayed messages are
//! promoted even when the source channel is quiet.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{DelayedScheduler, RelayStats, SharedRelayStats};
use crate::broker::{delayed_member, Broker, Subscription};
use crate::clock::epoch_now;
use crate::config::Settings;
use crate::envelope::{Envelope, Route};
use crate::error::{BrokerError, RelayError};
use crate::keys::{QueueKeys, QUEUE_DEPTHS};
use crate::shutdown;

/// Outcome of ingesting one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Ready,
    Delayed,
    Dropped,
}

/// Materializes messages received on a module's source channel.
pub struct InboundRelay {
    keys: QueueKeys,
    source: String,
    source_broker: Arc<dyn Broker>,
    broker: Arc<dyn Broker>,
    scheduler: DelayedScheduler,
    receive_timeout: Duration,
    drain_batch: usize,
    stats: SharedRelayStats,
}

impl InboundRelay {
    /// Creates an inbound relay.
    ///
    /// # Arguments
    ///
    /// * `module` - Module name
    /// * `source` - Channel (pattern) to subscribe to
    /// * `source_broker` - Broker carrying the source channel
    /// * `broker` - Broker holding the module's ready and delayed sets
    /// * `settings` - Receive timeout and drain batch size
    pub fn new(
        module: &str,
        source: impl Into<String>,
        source_broker: Arc<dyn Broker>,
        broker: Arc<dyn Broker>,
        settings: &Settings,
    ) -> Self {
        let keys = QueueKeys::new(module);
        Self {
            scheduler: DelayedScheduler::new(Arc::clone(&broker), keys.clone()),
            keys,
            source: source.into(),
            source_broker,
            broker,
            receive_timeout: settings.receive_timeout,
            drain_batch: settings.drain_batch,
            stats: SharedRelayStats::default(),
        }
    }

    /// Keys of the relayed module.
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Counters since start.
    pub fn stats(&self) -> RelayStats {
        self.stats.snapshot()
    }

    /// Routes one received payload at time `now`.
    ///
    /// Malformed payloads are logged and dropped; only broker failures are
    /// returned as errors.
    pub async fn ingest(&self, payload: &str, now: f64) -> Result<Ingested, BrokerError> {
        let envelope = match Envelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    module = %self.keys.module(),
                    error = %e,
                    "Dropping malformed message"
                );
                self.stats.record_dropped();
                return Ok(Ingested::Dropped);
            }
        };

        let ingested = match envelope.route(now) {
            Route::Ready(message) => {
                self.broker.sadd(self.keys.ready_in(), &message).await?;
                self.stats.record_ready();
                Ingested::Ready
            }
            Route::Delayed { message, due } => {
                self.broker
                    .zadd(self.keys.delayed_in(), &delayed_member(due, &message), due)
                    .await?;
                self.stats.record_delayed();
                debug!(
                    module = %self.keys.module(),
                    id = envelope.id().unwrap_or("-"),
                    due,
                    "Message delayed"
                );
                Ingested::Delayed
            }
        };

        self.update_depth().await?;
        Ok(ingested)
    }

    /// Runs one delayed-promotion pass at time `now`.
    pub async fn promote(&self, now: f64) -> Result<usize, BrokerError> {
        let promoted = self.scheduler.run_pass(now).await?;
        self.stats.record_promoted(promoted);
        Ok(promoted)
    }

    /// Subscribes to the source channel and relays until shutdown.
    ///
    /// # Errors
    ///
    /// Broker failures, including a dropped subscription, end the loop. The
    /// supervisor starts a fresh relay which subscribes from scratch.
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<(), RelayError> {
        let subscription = self.source_broker.subscribe(&self.source).await?;
        self.relay(subscription, shutdown_rx).await
    }

    /// Relays from an established subscription until shutdown.
    pub(crate) async fn relay(
        &self,
        mut subscription: Subscription,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        info!(
            module = %self.keys.module(),
            source = %self.source,
            ready = %self.keys.ready_in(),
            "Inbound relay started"
        );

        loop {
            if shutdown::requested(&mut shutdown_rx) {
                break;
            }

            tokio::select! {
                _ = shutdown::wait(&mut shutdown_rx) => break,
                received = tokio::time::timeout(self.receive_timeout, subscription.next()) => {
                    match received {
                        Ok(Some(item)) => {
                            self.receive(item).await?;
                            self.drain(&mut subscription).await?;
                        }
                        Ok(None) => {
                            return Err(BrokerError::SubscriptionClosed(self.source.clone()).into());
                        }
                        // idle cycle
                        Err(_) => {}
                    }
                }
            }

            self.promote(epoch_now()).await?;
        }

        let stats = self.stats();
        info!(
            module = %self.keys.module(),
            ready = stats.ready,
            delayed = stats.delayed,
            promoted = stats.promoted,
            dropped = stats.dropped,
            "Inbound relay stopped"
        );
        Ok(())
    }

    /// Ingests already-buffered messages without waiting.
    async fn drain(&self, subscription: &mut Subscription) -> Result<(), RelayError> {
        for _ in 0..self.drain_batch {
            match subscription.next().now_or_never() {
                Some(Some(item)) => self.receive(item).await?,
                Some(None) => {
                    return Err(BrokerError::SubscriptionClosed(self.source.clone()).into());
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Handles one subscription item. Only a closed subscription ends the
    /// relay; an undecodable item is dropped like a malformed payload.
    async fn receive(&self, item: Result<String, BrokerError>) -> Result<(), RelayError> {
        match item {
            Ok(payload) => {
                self.ingest(&payload, epoch_now()).await?;
            }
            Err(e @ BrokerError::SubscriptionClosed(_)) => return Err(e.into()),
            Err(e) => {
                warn!(
                    module = %self.keys.module(),
                    error = %e,
                    "Dropping undecodable message"
                );
                self.stats.record_dropped();
            }
        }
        Ok(())
    }

    async fn update_depth(&self) -> Result<(), BrokerError> {
        let depth = self.broker.scard(self.keys.ready_in()).await?;
        self.broker
            .hset(QUEUE_DEPTHS, self.keys.module(), &depth.to_string())
            .await
    }
}
