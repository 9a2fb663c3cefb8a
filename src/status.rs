//! Status aggregator: one consolidated snapshot of every module.
//!
//! Each pass reads queue sizes per module and the record of every
//! registered worker, prunes workers whose process is gone, and writes the
//! result as JSON to the `status` key with an expiry. If the aggregator
//! stops, the snapshot expires instead of going stale.
//!
//! ```json
//! {
//!   "generated_at": "2024-05-01T12:00:00+00:00",
//!   "modules": {
//!     "Entry": {
//!       "queue_in": 3, "queue_out": 0, "delayed": 1,
//!       "workers": [{"runtime_id": "Entry_0", "pid": 4242, "last_receive": 1714564800.1}]
//!     }
//!   },
//!   "pools": {"Entry": {"expected": 1, "running": 1}}
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::broker::{Broker, Command};
use crate::clock::rfc3339_now;
use crate::config::Settings;
use crate::error::{BrokerError, StatusError};
use crate::keys::{self, record, QueueKeys};
use crate::shutdown;
use crate::worker::split_runtime_id;

/// Decides whether a process id belongs to a live process.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Reads process state from procfs.
///
/// A missing entry and the zombie (`Z`) and dead (`X`) states all count as
/// not alive.
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    root: PathBuf,
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsProbe {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Uses a different procfs mount point.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Single-letter state of a process, if it exists.
    pub fn state(&self, pid: u32) -> Option<char> {
        let stat = std::fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        // "<pid> (<comm>) <state> ...", comm may itself contain parentheses
        let after_comm = &stat[stat.rfind(')')? + 1..];
        after_comm.trim_start().chars().next()
    }
}

impl LivenessProbe for ProcfsProbe {
    fn is_alive(&self, pid: u32) -> bool {
        !matches!(self.state(pid), None | Some('Z') | Some('X') | Some('x'))
    }
}

/// Snapshot written to the `status` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub generated_at: String,
    pub modules: BTreeMap<String, ModuleStatus>,
    #[serde(default)]
    pub pools: BTreeMap<String, PoolStatus>,
}

/// Queue sizes and workers of one module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub queue_in: usize,
    pub queue_out: usize,
    pub delayed: usize,
    pub workers: Vec<WorkerStatus>,
}

/// One live worker as last reported by itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub runtime_id: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_receive: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_send: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_in: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_out: Option<usize>,
}

/// Supervisor counts for one pool. A module without destinations has no
/// `queue-out:<module>` entry at all; a crashed relay shows `running < expected`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub expected: usize,
    pub running: usize,
}

/// Builds and publishes status snapshots.
pub struct StatusAggregator {
    broker: Arc<dyn Broker>,
    modules: Vec<String>,
    probe: Arc<dyn LivenessProbe>,
    interval: Duration,
    ttl: Duration,
}

impl StatusAggregator {
    /// Creates an aggregator over the given modules.
    ///
    /// Modules that only appear in worker records are reported as well.
    pub fn new(
        broker: Arc<dyn Broker>,
        modules: Vec<String>,
        probe: Arc<dyn LivenessProbe>,
        settings: &Settings,
    ) -> Self {
        Self {
            broker,
            modules,
            probe,
            interval: settings.status_interval,
            ttl: settings.status_ttl,
        }
    }

    /// Reads the broker and builds a snapshot, pruning dead workers.
    pub async fn collect(&self) -> Result<StatusSnapshot, BrokerError> {
        let mut workers: BTreeMap<String, Vec<WorkerStatus>> = BTreeMap::new();
        let mut ids = self.broker.smembers(keys::WORKERS).await?;
        ids.sort();

        for runtime_id in ids {
            let fields = self.broker.hgetall(&keys::worker_record(&runtime_id)).await?;
            let pid = fields.get(record::PID).and_then(|p| p.parse::<u32>().ok());

            let Some(pid) = pid.filter(|pid| self.probe.is_alive(*pid)) else {
                self.prune(&runtime_id).await?;
                continue;
            };

            let module = match fields.get(record::MODULE) {
                Some(module) => module.clone(),
                None => match split_runtime_id(&runtime_id) {
                    Ok((module, _)) => module.to_string(),
                    Err(_) => {
                        self.prune(&runtime_id).await?;
                        continue;
                    }
                },
            };

            workers
                .entry(module)
                .or_default()
                .push(worker_status(runtime_id, pid, &fields));
        }

        let names: BTreeSet<String> = self
            .modules
            .iter()
            .cloned()
            .chain(workers.keys().cloned())
            .collect();

        let mut modules = BTreeMap::new();
        for name in names {
            let keys = QueueKeys::new(name.as_str());
            let status = ModuleStatus {
                queue_in: self.broker.scard(keys.ready_in()).await?,
                queue_out: self.broker.scard(keys.ready_out()).await?,
                delayed: self.broker.zcard(keys.delayed_in()).await?,
                workers: workers.remove(&name).unwrap_or_default(),
            };
            modules.insert(name, status);
        }

        Ok(StatusSnapshot {
            generated_at: rfc3339_now(),
            modules,
            pools: self.pools().await?,
        })
    }

    /// Writes a snapshot to the `status` key with the configured expiry.
    pub async fn publish(&self, snapshot: &StatusSnapshot) -> Result<(), StatusError> {
        let body = serde_json::to_string(snapshot)?;
        self.broker.set_ex(keys::STATUS, &body, self.ttl).await?;
        Ok(())
    }

    /// Collects and publishes one snapshot.
    pub async fn run_once(&self) -> Result<StatusSnapshot, StatusError> {
        let snapshot = self.collect().await?;
        self.publish(&snapshot).await?;
        Ok(snapshot)
    }

    /// Publishes a snapshot every interval until shutdown.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), StatusError> {
        info!(
            modules = self.modules.len(),
            interval_ms = self.interval.as_millis() as u64,
            ttl_secs = self.ttl.as_secs(),
            "Status aggregator started"
        );

        loop {
            if shutdown::requested(&mut shutdown_rx) {
                break;
            }
            let snapshot = self.run_once().await?;
            debug!(modules = snapshot.modules.len(), "Status snapshot written");

            tokio::select! {
                _ = shutdown::wait(&mut shutdown_rx) => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Status aggregator stopped");
        Ok(())
    }

    async fn prune(&self, runtime_id: &str) -> Result<(), BrokerError> {
        info!(runtime_id = %runtime_id, "Pruning record of dead worker");
        self.broker
            .exec_atomic(vec![
                Command::srem(keys::WORKERS, runtime_id),
                Command::del(keys::worker_record(runtime_id)),
            ])
            .await
    }

    async fn pools(&self) -> Result<BTreeMap<String, PoolStatus>, BrokerError> {
        let expected = self.broker.hgetall(keys::SUPERVISOR_EXPECTED).await?;
        let running = self.broker.hgetall(keys::SUPERVISOR_RUNNING).await?;

        let count = |map: &HashMap<String, String>, pool: &str| {
            map.get(pool).and_then(|v| v.parse::<usize>().ok()).unwrap_or(0)
        };
        Ok(expected
            .keys()
            .chain(running.keys())
            .map(|pool| {
                let status = PoolStatus {
                    expected: count(&expected, pool),
                    running: count(&running, pool),
                };
                (pool.clone(), status)
            })
            .collect())
    }
}

fn worker_status(runtime_id: String, pid: u32, fields: &HashMap<String, String>) -> WorkerStatus {
    let float = |key: &str| fields.get(key).and_then(|v| v.parse::<f64>().ok());
    let count = |key: &str| fields.get(key).and_then(|v| v.parse::<usize>().ok());
    WorkerStatus {
        runtime_id,
        pid,
        last_receive: float(record::LAST_RECEIVE),
        last_send: float(record::LAST_SEND),
        queue_in: count(record::QUEUE_IN),
        queue_out: count(record::QUEUE_OUT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::collections::HashSet;

    struct FixedProbe(HashSet<u32>);

    impl LivenessProbe for FixedProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }
    }

    async fn register(broker: &MemoryBroker, id: &str, module: &str, pid: u32) {
        broker
            .exec_atomic(vec![
                Command::sadd(keys::WORKERS, id),
                Command::hset(
                    keys::worker_record(id),
                    vec![
                        (record::MODULE.to_string(), module.to_string()),
                        (record::PID.to_string(), pid.to_string()),
                        (record::LAST_RECEIVE.to_string(), "1700000000.5".to_string()),
                        (record::QUEUE_IN.to_string(), "2".to_string()),
                    ],
                ),
            ])
            .await
            .unwrap();
    }

    fn aggregator(broker: &Arc<MemoryBroker>, alive: &[u32]) -> StatusAggregator {
        StatusAggregator::new(
            broker.clone(),
            vec!["Entry".to_string(), "Sink".to_string()],
            Arc::new(FixedProbe(alive.iter().copied().collect())),
            &Settings::new(),
        )
    }

    #[tokio::test]
    async fn test_collect_counts_and_workers() {
        let broker = Arc::new(MemoryBroker::new());
        broker.sadd("Entryin", "a").await.unwrap();
        broker.sadd("Entryin", "b").await.unwrap();
        broker.sadd("Entryout", "c").await.unwrap();
        broker.zadd("Entryin_delayed", "d", 1e12).await.unwrap();
        register(&broker, "Entry_0", "Entry", 10).await;

        let snapshot = aggregator(&broker, &[10]).collect().await.unwrap();

        let entry = &snapshot.modules["Entry"];
        assert_eq!(entry.queue_in, 2);
        assert_eq!(entry.queue_out, 1);
        assert_eq!(entry.delayed, 1);
        assert_eq!(entry.workers.len(), 1);
        assert_eq!(entry.workers[0].runtime_id, "Entry_0");
        assert_eq!(entry.workers[0].last_receive, Some(1700000000.5));
        assert_eq!(entry.workers[0].queue_in, Some(2));
        assert_eq!(entry.workers[0].last_send, None);

        assert_eq!(snapshot.modules["Sink"], ModuleStatus::default());
    }

    #[tokio::test]
    async fn test_dead_workers_are_pruned() {
        let broker = Arc::new(MemoryBroker::new());
        register(&broker, "Entry_0", "Entry", 10).await;
        register(&broker, "Entry_1", "Entry", 11).await;

        let snapshot = aggregator(&broker, &[10]).collect().await.unwrap();

        assert_eq!(snapshot.modules["Entry"].workers.len(), 1);
        assert_eq!(
            broker.smembers(keys::WORKERS).await.unwrap(),
            vec!["Entry_0".to_string()]
        );
        assert!(!broker.exists("worker:Entry_1"));
    }

    #[tokio::test]
    async fn test_worker_of_unlisted_module_is_reported() {
        let broker = Arc::new(MemoryBroker::new());
        register(&broker, "Extra_0", "Extra", 10).await;

        let snapshot = aggregator(&broker, &[10]).collect().await.unwrap();

        assert_eq!(snapshot.modules["Extra"].workers.len(), 1);
    }

    #[tokio::test]
    async fn test_pools_distinguish_exit_from_crash() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .exec_atomic(vec![
                Command::hset(
                    keys::SUPERVISOR_EXPECTED,
                    vec![("queue-out:Entry".to_string(), "1".to_string())],
                ),
                Command::hset(
                    keys::SUPERVISOR_RUNNING,
                    vec![("queue-out:Entry".to_string(), "0".to_string())],
                ),
            ])
            .await
            .unwrap();

        let snapshot = aggregator(&broker, &[]).collect().await.unwrap();

        assert_eq!(
            snapshot.pools.get("queue-out:Entry"),
            Some(&PoolStatus {
                expected: 1,
                running: 0
            })
        );
        assert!(!snapshot.pools.contains_key("queue-out:Sink"));
    }

    #[tokio::test]
    async fn test_publish_sets_expiring_snapshot() {
        let broker = Arc::new(MemoryBroker::new());
        let aggregator = aggregator(&broker, &[]);

        let snapshot = aggregator.run_once().await.unwrap();

        let stored = broker.get(keys::STATUS).await.unwrap().expect("snapshot stored");
        let decoded: StatusSnapshot = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded, snapshot);
        let ttl = broker.ttl(keys::STATUS).expect("expiry set");
        assert!(ttl <= Settings::new().status_ttl);
    }

    #[test]
    fn test_procfs_probe() {
        let root = tempfile::tempdir().unwrap();
        let write = |pid: u32, stat: &str| {
            let dir = root.path().join(pid.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("stat"), stat).unwrap();
        };
        write(1, "1 (init) S 0 1 1 0 -1");
        write(2, "2 (odd (name)) R 1 2 2 0 -1");
        write(3, "3 (worker) Z 1 3 3 0 -1");

        let probe = ProcfsProbe::with_root(root.path());
        assert!(probe.is_alive(1));
        assert_eq!(probe.state(2), Some('R'));
        assert!(probe.is_alive(2));
        assert!(!probe.is_alive(3));
        assert!(!probe.is_alive(4));
    }
}
