//! In-process broker with the same semantics as the Redis adapter.
//!
//! All state sits behind one mutex, so every trait method (and every
//! `exec_atomic` batch) is atomic with respect to the others. Unlike Redis it
//! supports blocking set pops, and it records every publish for inspection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tracing::warn;

use super::{delayed_message, Broker, ChannelPattern, Command, Subscription};
use crate::error::BrokerError;

/// Capacity of the in-process pub/sub bus.
const BUS_CAPACITY: usize = 4096;

#[derive(Default)]
struct State {
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
}

impl State {
    fn sadd(&mut self, key: &str, member: &str) -> bool {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string())
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn spop(&mut self, key: &str) -> Option<String> {
        let set = self.sets.get_mut(key)?;
        let member = set.iter().next().cloned()?;
        set.remove(&member);
        if set.is_empty() {
            self.sets.remove(key);
        }
        Some(member)
    }

    fn hset(&mut self, key: &str, fields: &[(String, String)]) {
        if fields.is_empty() {
            return;
        }
        let hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
    }

    fn del(&mut self, key: &str) {
        self.sets.remove(key);
        self.zsets.remove(key);
        self.hashes.remove(key);
        self.strings.remove(key);
        self.lists.remove(key);
    }

    fn lpush(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
    }

    fn ltrim(&mut self, key: &str, start: isize, stop: isize) {
        let Some(list) = self.lists.get_mut(key) else {
            return;
        };
        let len = list.len() as isize;
        let resolve = |idx: isize| if idx < 0 { len + idx } else { idx };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);

        if start > stop {
            self.lists.remove(key);
            return;
        }
        list.truncate(stop as usize + 1);
        list.drain(..start as usize);
    }

    fn live_string(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.strings.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(value, _)| value)
    }
}

/// Broker adapter that keeps everything in process memory.
pub struct MemoryBroker {
    state: Mutex<State>,
    bus: broadcast::Sender<(String, String)>,
    published: Mutex<Vec<(String, String)>>,
    set_changed: Notify,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            bus,
            published: Mutex::new(Vec::new()),
            set_changed: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every `(channel, payload)` published so far, in publish order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Members of a sorted set as `(score, member)`, lowest score first.
    pub fn zrange(&self, key: &str) -> Vec<(f64, String)> {
        self.state().zsets.get(key).cloned().unwrap_or_default()
    }

    /// Contents of a list, head first.
    pub fn lrange(&self, key: &str) -> Vec<String> {
        self.state()
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remaining time to live of a string key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state();
        state.live_string(key)?;
        state
            .strings
            .get(key)
            .and_then(|(_, deadline)| *deadline)
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether any key of any type exists under this name.
    pub fn exists(&self, key: &str) -> bool {
        let mut state = self.state();
        state.sets.contains_key(key)
            || state.zsets.contains_key(key)
            || state.hashes.contains_key(key)
            || state.lists.contains_key(key)
            || state.live_string(key).is_some()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
        let added = self.state().sadd(key, member);
        self.set_changed.notify_waiters();
        Ok(added)
    }

    async fn spop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.state().spop(key))
    }

    fn supports_blocking_pop(&self) -> bool {
        true
    }

    async fn spop_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.set_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(member) = self.state().spop(key) {
                return Ok(Some(member));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn scard(&self, key: &str) -> Result<usize, BrokerError> {
        Ok(self.state().sets.get(key).map_or(0, HashSet::len))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .state()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BrokerError> {
        let mut state = self.state();
        let zset = state.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        let pos = zset.partition_point(|(s, _)| *s <= score);
        zset.insert(pos, (score, member.to_string()));
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<usize, BrokerError> {
        Ok(self.state().zsets.get(key).map_or(0, Vec::len))
    }

    async fn promote_due(
        &self,
        delayed: &str,
        ready: &str,
        max_score: f64,
    ) -> Result<Vec<String>, BrokerError> {
        let promoted = {
            let mut state = self.state();
            let Some(zset) = state.zsets.get_mut(delayed) else {
                return Ok(Vec::new());
            };
            let split = zset.partition_point(|(s, _)| *s <= max_score);
            let due: Vec<String> = zset
                .drain(..split)
                .map(|(_, m)| delayed_message(&m).to_string())
                .collect();
            if zset.is_empty() {
                state.zsets.remove(delayed);
            }
            for member in &due {
                state.sadd(ready, member);
            }
            due
        };
        if !promoted.is_empty() {
            self.set_changed.notify_waiters();
        }
        Ok(promoted)
    }

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), BrokerError> {
        self.state().hset(key, fields);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        Ok(self.state().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let deadline = Instant::now() + ttl.max(Duration::from_secs(1));
        self.state()
            .strings
            .insert(key.to_string(), (value.to_string(), Some(deadline)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.state().live_string(key).cloned())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel.to_string(), payload.to_string()));
        // no subscribers is not an error for pub/sub
        let _ = self.bus.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        let matcher = ChannelPattern::new(pattern)?;
        let mut rx = self.bus.subscribe();

        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok((channel, payload)) => {
                        if matcher.matches(&channel) {
                            yield Ok(payload);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(pattern = %matcher.as_str(), skipped, "Subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        yield Err(BrokerError::SubscriptionClosed(matcher.as_str().to_string()));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn exec_atomic(&self, commands: Vec<Command>) -> Result<(), BrokerError> {
        let mut touched_sets = false;
        {
            let mut state = self.state();
            for command in &commands {
                match command {
                    Command::SAdd { key, member } => {
                        state.sadd(key, member);
                        touched_sets = true;
                    }
                    Command::SRem { key, member } => state.srem(key, member),
                    Command::HSet { key, fields } => state.hset(key, fields),
                    Command::Del { key } => state.del(key),
                    Command::LPush { key, value } => state.lpush(key, value),
                    Command::LTrim { key, start, stop } => state.ltrim(key, *start, *stop),
                }
            }
        }
        if touched_sets {
            self.set_changed.notify_waiters();
        }
        Ok(())
    }
}
