//! Promotion of due delayed messages into the ready set.
//!
//! Delayed members are stored as `<due>|<message>`, scored by their due time,
//! with `run_at` already stripped from the message. The broker performs range
//! read, prefix removal, insert and range removal as one atomic step: a crash
//! can never leave a message in neither set, and one pass never promotes an
//! entry twice.

use std::sync::Arc;

use tracing::debug;

use crate::broker::Broker;
use crate::clock::epoch_now;
use crate::error::BrokerError;
use crate::keys::{QueueKeys, QUEUE_DEPTHS};

/// Moves due entries of `<m>in_delayed` into `<m>in`.
pub struct DelayedScheduler {
    broker: Arc<dyn Broker>,
    keys: QueueKeys,
}

impl DelayedScheduler {
    pub fn new(broker: Arc<dyn Broker>, keys: QueueKeys) -> Self {
        Self { broker, keys }
    }

    /// Runs one promotion pass for everything due at or before `now`.
    ///
    /// Returns the number of promoted messages. An empty delayed set is a
    /// no-op.
    pub async fn run_pass(&self, now: f64) -> Result<usize, BrokerError> {
        let promoted = self
            .broker
            .promote_due(self.keys.delayed_in(), self.keys.ready_in(), now)
            .await?;

        if promoted.is_empty() {
            return Ok(0);
        }

        let depth = self.broker.scard(self.keys.ready_in()).await?;
        self.broker
            .hset(QUEUE_DEPTHS, self.keys.module(), &depth.to_string())
            .await?;

        debug!(
            module = %self.keys.module(),
            promoted = promoted.len(),
            depth,
            "Promoted delayed messages"
        );
        Ok(promoted.len())
    }

    /// Runs one pass at the current wall-clock time.
    pub async fn tick(&self) -> Result<usize, BrokerError> {
        self.run_pass(epoch_now()).await
    }

    /// Number of messages still waiting in the delayed set.
    pub async fn pending(&self) -> Result<usize, BrokerError> {
        self.broker.zcard(self.keys.delayed_in()).await
    }
}
