//! Broker adapter over the external key/value and pub/sub store.
//!
//! Every component receives its broker handle at construction as an
//! `Arc<dyn Broker>`; nothing opens ad-hoc connections of its own.
//!
//! - **RedisBroker**: production adapter backed by `redis::aio::ConnectionManager`
//! - **MemoryBroker**: in-process adapter with the same semantics, used by
//!   tests and single-process runs
//! - **BrokerPool**: one connection per distinct set of connection parameters
//!
//! # Atomicity
//!
//! Read-modify-write sequences never run from relay logic. Multi-key writes
//! go through [`Broker::exec_atomic`], and delayed promotion through
//! [`Broker::promote_due`], both of which the adapters execute as a single
//! broker-side transaction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BrokerError;

pub mod memory;
pub mod pattern;
pub mod pool;
pub mod redis_broker;

pub use memory::MemoryBroker;
pub use pattern::ChannelPattern;
pub use pool::BrokerPool;
pub use redis_broker::RedisBroker;

/// Separator between the due time and the message in a delayed member.
pub const DUE_SEPARATOR: char = '|';

/// Encodes a delayed-set member as `<due>|<message>`.
///
/// The due time is part of the member so that two messages differing only in
/// their delivery time stay distinct entries of the sorted set.
pub fn delayed_member(due: f64, message: &str) -> String {
    format!("{}{}{}", due, DUE_SEPARATOR, message)
}

/// Recovers the message from a delayed-set member. A member without a
/// numeric due prefix is returned unchanged.
pub fn delayed_message(member: &str) -> &str {
    match member.split_once(DUE_SEPARATOR) {
        Some((due, message)) if due.parse::<f64>().is_ok() => message,
        _ => member,
    }
}

/// Stream of payloads received on a pattern subscription.
///
/// The stream yields `Err` and ends when the broker drops the subscription.
pub type Subscription = BoxStream<'static, Result<String, BrokerError>>;

/// A write that can be grouped into an atomic transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    HSet { key: String, fields: Vec<(String, String)> },
    Del { key: String },
    LPush { key: String, value: String },
    LTrim { key: String, start: isize, stop: isize },
}

impl Command {
    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn hset(key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self::HSet {
            key: key.into(),
            fields,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn lpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::LPush {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn ltrim(key: impl Into<String>, start: isize, stop: isize) -> Self {
        Self::LTrim {
            key: key.into(),
            start,
            stop,
        }
    }
}

/// Primitives consumed from the key/value and pub/sub store.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Adds a member to a set. Returns true if it was not already present.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, BrokerError>;

    /// Removes and returns one arbitrary member, or `None` when empty.
    async fn spop(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Whether [`Broker::spop_timeout`] blocks natively.
    fn supports_blocking_pop(&self) -> bool {
        false
    }

    /// Pops one member, waiting up to `timeout` when the adapter supports
    /// blocking pops. Adapters without native support return immediately.
    async fn spop_timeout(
        &self,
        key: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        self.spop(key).await
    }

    /// Set cardinality.
    async fn scard(&self, key: &str) -> Result<usize, BrokerError>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, BrokerError>;

    /// Adds a member to a sorted set with the given score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BrokerError>;

    /// Sorted set cardinality.
    async fn zcard(&self, key: &str) -> Result<usize, BrokerError>;

    /// Atomically moves every member of `delayed` with score <= `max_score`
    /// into the set `ready`, removing that score range from `delayed`.
    /// Members are inserted as their [`delayed_message`]. Returns the
    /// promoted messages.
    async fn promote_due(
        &self,
        delayed: &str,
        ready: &str,
        max_score: f64,
    ) -> Result<Vec<String>, BrokerError>;

    /// Sets several hash fields in one command.
    async fn hset_multiple(&self, key: &str, fields: &[(String, String)])
        -> Result<(), BrokerError>;

    /// Sets a single hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        self.hset_multiple(key, &[(field.to_string(), value.to_string())])
            .await
    }

    /// All fields of a hash.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;

    /// Sets a string key with an expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Reads a string key.
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Publishes a payload on a channel. Fire-and-forget.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Subscribes to every channel matching a glob pattern.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError>;

    /// Runs all commands as one transaction.
    async fn exec_atomic(&self, commands: Vec<Command>) -> Result<(), BrokerError>;
}
