//! Queue handle used by worker processes.

use std::sync::Arc;

use crate::broker::{Broker, Command};
use crate::clock::epoch_now;
use crate::error::{BrokerError, ConfigError};
use crate::keys::{self, record, QueueKeys, QUEUE_DEPTHS};

/// Splits a runtime id `<module>_<n>` into its module and instance parts.
pub fn split_runtime_id(runtime_id: &str) -> Result<(&str, &str), ConfigError> {
    match runtime_id.rsplit_once('_') {
        Some((module, instance)) if !module.is_empty() && !instance.is_empty() => {
            Ok((module, instance))
        }
        _ => Err(ConfigError::InvalidValue {
            key: "id".to_string(),
            message: format!("expected '<module>_<n>', got '{}'", runtime_id),
        }),
    }
}

/// A worker's view of its module: pop from `<m>in`, push to `<m>out`.
///
/// Every receive and send refreshes the worker record with a timestamp and
/// the current queue sizes.
pub struct ModuleQueue {
    keys: QueueKeys,
    runtime_id: String,
    broker: Arc<dyn Broker>,
}

impl ModuleQueue {
    /// Creates a handle from a runtime id such as `Entry_0`.
    pub fn new(runtime_id: &str, broker: Arc<dyn Broker>) -> Result<Self, ConfigError> {
        let (module, _) = split_runtime_id(runtime_id)?;
        Ok(Self::for_module(module, runtime_id, broker))
    }

    /// Creates a handle for an explicit module.
    pub fn for_module(module: &str, runtime_id: &str, broker: Arc<dyn Broker>) -> Self {
        Self {
            keys: QueueKeys::new(module),
            runtime_id: runtime_id.to_string(),
            broker,
        }
    }

    pub fn module(&self) -> &str {
        self.keys.module()
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Registers this process in the worker set.
    pub async fn register(&self, pid: u32) -> Result<(), BrokerError> {
        self.broker
            .exec_atomic(vec![
                Command::sadd(keys::WORKERS, &self.runtime_id),
                Command::hset(
                    keys::worker_record(&self.runtime_id),
                    vec![
                        (record::MODULE.to_string(), self.module().to_string()),
                        (record::PID.to_string(), pid.to_string()),
                    ],
                ),
            ])
            .await
    }

    /// Pops one ready message, or `None` when the queue is empty.
    pub async fn receive(&self) -> Result<Option<String>, BrokerError> {
        let depth = self.count_queued().await?;
        self.broker
            .hset(QUEUE_DEPTHS, self.module(), &depth.to_string())
            .await?;

        let message = self.broker.spop(self.keys.ready_in()).await?;
        if message.is_some() {
            self.touch(record::LAST_RECEIVE).await?;
        }
        Ok(message)
    }

    /// Pushes a result for the outbound relay.
    pub async fn send(&self, message: &str) -> Result<(), BrokerError> {
        self.broker.sadd(self.keys.ready_out(), message).await?;
        self.touch(record::LAST_SEND).await
    }

    /// Number of messages waiting in the module's ready set.
    pub async fn count_queued(&self) -> Result<usize, BrokerError> {
        self.broker.scard(self.keys.ready_in()).await
    }

    async fn touch(&self, field: &str) -> Result<(), BrokerError> {
        let queue_in = self.broker.scard(self.keys.ready_in()).await?;
        let queue_out = self.broker.scard(self.keys.ready_out()).await?;
        self.broker
            .hset_multiple(
                &keys::worker_record(&self.runtime_id),
                &[
                    (field.to_string(), epoch_now().to_string()),
                    (record::QUEUE_IN.to_string(), queue_in.to_string()),
                    (record::QUEUE_OUT.to_string(), queue_out.to_string()),
                ],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[test]
    fn test_split_runtime_id() {
        assert_eq!(split_runtime_id("Entry_0").unwrap(), ("Entry", "0"));
        assert_eq!(split_runtime_id("my_module_12").unwrap(), ("my_module", "12"));
        assert!(split_runtime_id("Entry").is_err());
        assert!(split_runtime_id("_3").is_err());
        assert!(split_runtime_id("Entry_").is_err());
    }

    #[tokio::test]
    async fn test_receive_and_send_update_record() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = ModuleQueue::new("Entry_0", broker.clone()).expect("valid id");
        queue.register(4242).await.unwrap();
        broker.sadd("Entryin", "m1").await.unwrap();

        let message = queue.receive().await.unwrap();
        assert_eq!(message.as_deref(), Some("m1"));
        queue.send("m1").await.unwrap();

        let record = broker.hgetall("worker:Entry_0").await.unwrap();
        assert_eq!(record.get(record::MODULE).map(String::as_str), Some("Entry"));
        assert_eq!(record.get(record::PID).map(String::as_str), Some("4242"));
        assert!(record.contains_key(record::LAST_RECEIVE));
        assert!(record.contains_key(record::LAST_SEND));
        assert_eq!(record.get(record::QUEUE_IN).map(String::as_str), Some("0"));
        assert_eq!(record.get(record::QUEUE_OUT).map(String::as_str), Some("1"));

        assert_eq!(
            broker.smembers(keys::WORKERS).await.unwrap(),
            vec!["Entry_0".to_string()]
        );
        let depths = broker.hgetall(QUEUE_DEPTHS).await.unwrap();
        assert_eq!(depths.get("Entry").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_receive_empty() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = ModuleQueue::new("Entry_0", broker.clone()).expect("valid id");

        assert_eq!(queue.receive().await.unwrap(), None);
        let record = broker.hgetall("worker:Entry_0").await.unwrap();
        assert!(!record.contains_key(record::LAST_RECEIVE));
    }
}
