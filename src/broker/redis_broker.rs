//! Redis-backed broker adapter.
//!
//! Commands go through a `ConnectionManager` (reconnects transparently);
//! each pattern subscription owns a dedicated pub/sub connection. When that
//! connection drops the subscription stream ends with
//! `BrokerError::SubscriptionClosed` and the caller starts over. A payload
//! that is not UTF-8 yields `BrokerError::InvalidPayload` and the stream
//! stays open.
//!
//! Redis has no blocking set pop, so `supports_blocking_pop` stays false and
//! callers fall back to sleep-polling.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{Broker, Command, Subscription};
use crate::config::ConnectionParams;
use crate::error::BrokerError;

/// Moves due members from the delayed sorted set into the ready set and
/// removes the promoted score range, all inside one script execution.
/// Members lose their `<due>|` prefix on the way, as in `delayed_message`.
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if #due > 0 then
    for i = 1, #due do
        local sep = string.find(due[i], '|', 1, true)
        if sep and tonumber(string.sub(due[i], 1, sep - 1)) then
            due[i] = string.sub(due[i], sep + 1)
        end
    end
    for i = 1, #due, 4096 do
        redis.call('SADD', KEYS[2], unpack(due, i, math.min(i + 4095, #due)))
    end
    redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
return due
"#;

/// Broker adapter over a single Redis database.
pub struct RedisBroker {
    client: redis::Client,
    redis: ConnectionManager,
    url: String,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379/0")
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConnectionFailed` if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        debug!(url = %url, "Connected to broker");

        Ok(Self {
            client,
            redis,
            url: url.to_string(),
        })
    }

    /// Connects using host/port/db parameters.
    pub async fn from_params(params: &ConnectionParams) -> Result<Self, BrokerError> {
        Self::connect(&params.url()).await
    }

    /// The URL this adapter is connected to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        let added: usize = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn spop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let member: Option<String> = conn.spop(key).await?;
        Ok(member)
    }

    async fn scard(&self, key: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.scard(key).await?;
        Ok(len)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(key).await?;
        Ok(len)
    }

    async fn promote_due(
        &self,
        delayed: &str,
        ready: &str,
        max_score: f64,
    ) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let script = redis::Script::new(PROMOTE_DUE_SCRIPT);
        let promoted: Vec<String> = script
            .key(delayed)
            .key(ready)
            .arg(max_score)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), BrokerError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.psubscribe(pattern).await?;
        debug!(url = %self.url, pattern = %pattern, "Subscribed");

        let pattern = pattern.to_string();
        let stream = async_stream::stream! {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                yield msg
                    .get_payload::<Vec<u8>>()
                    .map_err(BrokerError::from)
                    .and_then(decode_payload);
            }
            yield Err(BrokerError::SubscriptionClosed(pattern));
        };

        Ok(Box::pin(stream))
    }

    async fn exec_atomic(&self, commands: Vec<Command>) -> Result<(), BrokerError> {
        if commands.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            match command {
                Command::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                Command::SRem { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                Command::HSet { key, fields } => {
                    if !fields.is_empty() {
                        pipe.hset_multiple(key, fields.as_slice()).ignore();
                    }
                }
                Command::Del { key } => {
                    pipe.del(key).ignore();
                }
                Command::LPush { key, value } => {
                    pipe.lpush(key, value).ignore();
                }
                Command::LTrim { key, start, stop } => {
                    pipe.ltrim(key, *start, *stop).ignore();
                }
            }
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

fn decode_payload(bytes: Vec<u8>) -> Result<String, BrokerError> {
    String::from_utf8(bytes).map_err(|e| BrokerError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promote_script_uses_score_range() {
        assert!(PROMOTE_DUE_SCRIPT.contains("ZRANGEBYSCORE"));
        assert!(PROMOTE_DUE_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(PROMOTE_DUE_SCRIPT.contains("SADD"));
        // the prefix is stripped inside the script, before SADD
        let strip = PROMOTE_DUE_SCRIPT.find("string.sub").expect("prefix stripped");
        let sadd = PROMOTE_DUE_SCRIPT.find("'SADD'").expect("sadd");
        assert!(strip < sadd);
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(
            decode_payload(br#"{"content":1}"#.to_vec()).unwrap(),
            r#"{"content":1}"#
        );
        assert!(matches!(
            decode_payload(vec![0xff, 0xfe, b'{']),
            Err(BrokerError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisBroker::connect("not-a-url").await;
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
    }
}
