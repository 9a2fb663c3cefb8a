//! Per-channel broker handles, one connection per distinct endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Broker, RedisBroker};
use crate::config::{ConnectionParams, RuntimeConfig};
use crate::error::BrokerError;

/// Resolves channels to broker handles using the runtime configuration.
///
/// Channels that share connection parameters share one handle.
pub struct BrokerPool {
    runtime: RuntimeConfig,
    connections: HashMap<ConnectionParams, Arc<dyn Broker>>,
}

impl BrokerPool {
    /// Creates an empty pool.
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self {
            runtime,
            connections: HashMap::new(),
        }
    }

    /// Registers an already-open handle for the given parameters.
    pub fn with_broker(mut self, params: ConnectionParams, broker: Arc<dyn Broker>) -> Self {
        self.connections.insert(params, broker);
        self
    }

    /// The runtime configuration backing this pool.
    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Handle for the `Default` entry, which holds ready/delayed sets and
    /// shared state.
    pub async fn default_broker(&mut self) -> Result<Arc<dyn Broker>, BrokerError> {
        let params = self.runtime.default_params().clone();
        self.connect(params).await
    }

    /// Handle for a pub/sub channel.
    pub async fn for_channel(&mut self, channel: &str) -> Result<Arc<dyn Broker>, BrokerError> {
        let params = self.runtime.for_channel(channel).clone();
        self.connect(params).await
    }

    /// Handle for arbitrary connection parameters.
    pub async fn connect(
        &mut self,
        params: ConnectionParams,
    ) -> Result<Arc<dyn Broker>, BrokerError> {
        if let Some(broker) = self.connections.get(&params) {
            return Ok(Arc::clone(broker));
        }
        let broker: Arc<dyn Broker> = Arc::new(RedisBroker::from_params(&params).await?);
        self.connections.insert(params, Arc::clone(&broker));
        Ok(broker)
    }
}
