//! Process supervisor: keeps every pool at its configured size.
//!
//! The supervisor is a reconciliation loop. Each pass compares desired
//! state (configured pool sizes) with observed state (live children),
//! replaces what died and writes both counts to the broker:
//!
//! ```text
//! Stopped ──launch──▶ Launching ──▶ Running ──child died──▶ Degraded
//!    ▲                                 ▲                       │
//!    │                                 └───── respawned ───────┘
//!    └────────────── shutdown (kill all, purge state) ─────────┘
//! ```
//!
//! Three kinds of pools are managed: module workers, one inbound relay per
//! module with a source channel and one outbound relay per module with
//! destinations. Relays are single-slot pools and heal like workers.
//!
//! Only one supervisor may run against a broker at a time. This is an
//! operational requirement and is not enforced here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Command};
use crate::clock::rfc3339_now;
use crate::config::{PipelineConfig, Settings, StartupConfig};
use crate::error::SupervisorError;
use crate::keys::{self, record};
use crate::shutdown;

pub mod pool;
pub mod process;

pub use pool::{Pool, PoolKind, PoolState, PoolTemplate};
pub use process::{ChildProcess, LaunchSpec, Launcher, OsLauncher};

use pool::Slot;

/// Paths handed to spawned processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPaths {
    /// Pipeline configuration, passed to relays.
    pub pipeline: String,
    /// Runtime configuration, passed to relays and workers.
    pub runtime: String,
    /// Executable providing the `queue-in` / `queue-out` subcommands.
    pub relay_program: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Processes started this pass.
    pub spawned: usize,
    /// Dead processes removed this pass.
    pub reaped: usize,
    /// Launch attempts that failed this pass.
    pub failed: usize,
}

/// Supervises worker and relay pools.
pub struct Supervisor {
    pools: Vec<Pool>,
    runtime_path: String,
    launcher: Arc<dyn Launcher>,
    broker: Arc<dyn Broker>,
    poll_interval: Duration,
    kill_timeout: Duration,
}

impl Supervisor {
    /// Builds the pools from the pipeline and startup configurations.
    ///
    /// # Arguments
    ///
    /// * `pipeline` - Decides which relays exist
    /// * `startup` - Worker entrypoints and counts
    /// * `paths` - Configuration paths and relay executable
    /// * `launcher` - Starts child processes
    /// * `broker` - Receives supervisor state and worker records
    /// * `settings` - Poll interval and kill timeout
    pub fn new(
        pipeline: &PipelineConfig,
        startup: &StartupConfig,
        paths: LaunchPaths,
        launcher: Arc<dyn Launcher>,
        broker: Arc<dyn Broker>,
        settings: &Settings,
    ) -> Self {
        let mut pools = Vec::new();

        for (module, program) in startup.programs() {
            pools.push(Pool::new(
                module,
                PoolKind::Worker,
                program.process_count(),
                PoolTemplate {
                    program: program.module.clone(),
                    args: program.args.clone(),
                },
            ));
        }

        for (module, config) in pipeline.modules() {
            if config.source.is_some() {
                pools.push(relay_pool(module, PoolKind::QueueIn, &paths));
            }
            if config.is_exit() {
                info!(
                    module = %module,
                    "Module has no destination queues, no outbound relay"
                );
            } else {
                pools.push(relay_pool(module, PoolKind::QueueOut, &paths));
            }
        }

        Self {
            pools,
            runtime_path: paths.runtime,
            launcher,
            broker,
            poll_interval: settings.supervisor_poll,
            kill_timeout: settings.kill_timeout,
        }
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.iter().find(|p| p.name() == name)
    }

    /// Runs one reconciliation pass.
    ///
    /// Dead children are reaped first, then exactly `size - live` new ones
    /// are started per pool. A failed launch is logged and retried on the
    /// next pass. Expected and running counts are written to the broker in
    /// one transaction together with worker registrations.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport, SupervisorError> {
        let mut report = ReconcileReport::default();
        let mut commands = Vec::new();
        let started_at = rfc3339_now();

        for pool in &mut self.pools {
            for (runtime_id, pid) in pool.reap() {
                warn!(
                    pool = %pool.name(),
                    runtime_id = %runtime_id,
                    pid = pid.unwrap_or_default(),
                    "Process died, scheduling replacement"
                );
                report.reaped += 1;
                pool.state = PoolState::Degraded;
                if *pool.kind() == PoolKind::Worker {
                    commands.push(Command::srem(keys::WORKERS, &runtime_id));
                    commands.push(Command::del(keys::worker_record(&runtime_id)));
                }
            }

            let missing = pool.size().saturating_sub(pool.live());
            if missing > 0 && pool.state == PoolState::Stopped {
                pool.state = PoolState::Launching;
            }

            for _ in 0..missing {
                let spec = pool.next_spec(&self.runtime_path);
                match self.launcher.launch(&spec) {
                    Ok(child) => {
                        let pid = child.pid();
                        debug!(
                            pool = %pool.name(),
                            runtime_id = %spec.runtime_id,
                            pid = pid.unwrap_or_default(),
                            "Process started"
                        );
                        if *pool.kind() == PoolKind::Worker {
                            commands.extend(register_worker(
                                &spec.runtime_id,
                                pool.module(),
                                pid,
                                &started_at,
                            ));
                        }
                        pool.slots.push(Slot {
                            runtime_id: spec.runtime_id,
                            pid,
                            child,
                        });
                        report.spawned += 1;
                    }
                    Err(e) => {
                        let err = SupervisorError::SpawnFailed {
                            runtime_id: spec.runtime_id,
                            source: e,
                        };
                        error!(pool = %pool.name(), error = %err, "Launch failed");
                        report.failed += 1;
                    }
                }
            }

            pool.state = if pool.live() >= pool.size() {
                PoolState::Running
            } else {
                PoolState::Degraded
            };
        }

        commands.extend(self.counts_commands());
        self.broker.exec_atomic(commands).await?;

        if report.spawned > 0 || report.reaped > 0 {
            info!(
                spawned = report.spawned,
                reaped = report.reaped,
                failed = report.failed,
                "Reconciled pools"
            );
        }
        Ok(report)
    }

    /// Reconciles on every poll interval until shutdown, then kills all
    /// children.
    ///
    /// A broker failure stops the loop; children are still killed before
    /// the error is returned.
    pub async fn run(
        &mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), SupervisorError> {
        info!(
            pools = self.pools.len(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "Supervisor started"
        );

        let result = loop {
            if shutdown::requested(&mut shutdown_rx) {
                break Ok(());
            }
            if let Err(e) = self.reconcile().await {
                break Err(e);
            }
            tokio::select! {
                _ = shutdown::wait(&mut shutdown_rx) => break Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };

        let purge = self.shutdown().await;
        result.and(purge.map(|_| ()))
    }

    /// Kills every tracked child and purges supervisor state from the
    /// broker. Returns the number of processes killed.
    pub async fn shutdown(&mut self) -> Result<usize, SupervisorError> {
        let live_workers = self.live_worker_ids();
        let mut killed = 0;
        for pool in &mut self.pools {
            for mut slot in pool.slots.drain(..) {
                match tokio::time::timeout(self.kill_timeout, slot.child.kill()).await {
                    Ok(Ok(())) => killed += 1,
                    Ok(Err(source)) => {
                        let err = SupervisorError::KillFailed {
                            runtime_id: slot.runtime_id,
                            source,
                        };
                        warn!(error = %err, "Kill failed");
                    }
                    Err(_) => {
                        warn!(
                            runtime_id = %slot.runtime_id,
                            "Timed out waiting for process to exit"
                        );
                    }
                }
            }
            pool.state = PoolState::Stopped;
        }

        self.broker
            .exec_atomic(vec![
                Command::del(keys::SUPERVISOR_EXPECTED),
                Command::del(keys::SUPERVISOR_RUNNING),
                Command::del(keys::WORKERS),
            ])
            .await?;
        // records of reaped workers were already removed by reconcile
        let records: Vec<Command> = live_workers
            .iter()
            .map(|id| Command::del(keys::worker_record(id)))
            .collect();
        if !records.is_empty() {
            self.broker.exec_atomic(records).await?;
        }

        info!(killed, "Supervisor stopped");
        Ok(killed)
    }

    fn live_worker_ids(&self) -> Vec<String> {
        self.pools
            .iter()
            .filter(|p| *p.kind() == PoolKind::Worker)
            .flat_map(|p| p.runtime_ids())
            .map(str::to_string)
            .collect()
    }

    fn counts_commands(&self) -> Vec<Command> {
        if self.pools.is_empty() {
            return Vec::new();
        }
        let expected = self
            .pools
            .iter()
            .map(|p| (p.name().to_string(), p.size().to_string()))
            .collect();
        let running = self
            .pools
            .iter()
            .map(|p| (p.name().to_string(), p.live().to_string()))
            .collect();
        vec![
            Command::del(keys::SUPERVISOR_EXPECTED),
            Command::hset(keys::SUPERVISOR_EXPECTED, expected),
            Command::del(keys::SUPERVISOR_RUNNING),
            Command::hset(keys::SUPERVISOR_RUNNING, running),
        ]
    }
}

fn relay_pool(module: &str, kind: PoolKind, paths: &LaunchPaths) -> Pool {
    let subcommand = kind.subcommand().unwrap_or_default();
    let args = [
        subcommand,
        "-p",
        paths.pipeline.as_str(),
        "-r",
        paths.runtime.as_str(),
        "-m",
        module,
    ]
    .iter()
    .map(|a| a.to_string())
    .collect();
    Pool::new(
        module,
        kind,
        1,
        PoolTemplate {
            program: paths.relay_program.clone(),
            args,
        },
    )
}

fn register_worker(
    runtime_id: &str,
    module: &str,
    pid: Option<u32>,
    started_at: &str,
) -> Vec<Command> {
    let mut fields = vec![
        (record::MODULE.to_string(), module.to_string()),
        (record::STARTED_AT.to_string(), started_at.to_string()),
    ];
    if let Some(pid) = pid {
        fields.push((record::PID.to_string(), pid.to_string()));
    }
    vec![
        Command::sadd(keys::WORKERS, runtime_id),
        Command::hset(keys::worker_record(runtime_id), fields),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::{ModuleConfig, WorkerProgram};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLauncher {
        next_pid: AtomicU32,
        launched: Mutex<Vec<(LaunchSpec, Arc<AtomicBool>)>>,
        fail: AtomicBool,
    }

    impl FakeLauncher {
        fn specs(&self) -> Vec<LaunchSpec> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .map(|(s, _)| s.clone())
                .collect()
        }

        fn crash(&self, runtime_id: &str) {
            for (spec, alive) in self.launched.lock().unwrap().iter() {
                if spec.runtime_id == runtime_id {
                    alive.store(false, Ordering::SeqCst);
                }
            }
        }

        fn alive(&self) -> usize {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, a)| a.load(Ordering::SeqCst))
                .count()
        }
    }

    struct FakeChild {
        pid: u32,
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ChildProcess for FakeChild {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Box<dyn ChildProcess>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"));
            }
            let alive = Arc::new(AtomicBool::new(true));
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.launched
                .lock()
                .unwrap()
                .push((spec.clone(), Arc::clone(&alive)));
            Ok(Box::new(FakeChild { pid, alive }))
        }
    }

    fn paths() -> LaunchPaths {
        LaunchPaths {
            pipeline: "pipeline.json".to_string(),
            runtime: "runtime.json".to_string(),
            relay_program: "/usr/bin/pipequeue".to_string(),
        }
    }

    fn supervisor(
        startup: StartupConfig,
        pipeline: PipelineConfig,
    ) -> (Supervisor, Arc<FakeLauncher>, Arc<MemoryBroker>) {
        let launcher = Arc::new(FakeLauncher::default());
        let broker = Arc::new(MemoryBroker::new());
        let supervisor = Supervisor::new(
            &pipeline,
            &startup,
            paths(),
            launcher.clone(),
            broker.clone(),
            &Settings::new().with_supervisor_poll(Duration::from_millis(10)),
        );
        (supervisor, launcher, broker)
    }

    #[tokio::test]
    async fn test_respawns_exactly_missing_workers() {
        let startup = StartupConfig::from_programs([("Entry", WorkerProgram::new("./entry", 4))]);
        let (mut sup, launcher, broker) = supervisor(startup, PipelineConfig::default());

        let first = sup.reconcile().await.unwrap();
        assert_eq!(first.spawned, 4);
        assert_eq!(sup.pool("Entry").unwrap().state(), PoolState::Running);

        launcher.crash("Entry_1");
        launcher.crash("Entry_3");

        let second = sup.reconcile().await.unwrap();
        assert_eq!(second.reaped, 2);
        assert_eq!(second.spawned, 2);
        assert_eq!(launcher.alive(), 4);
        assert_eq!(sup.pool("Entry").unwrap().live(), 4);

        let third = sup.reconcile().await.unwrap();
        assert_eq!(third, ReconcileReport::default());

        let mut workers = broker.smembers(keys::WORKERS).await.unwrap();
        workers.sort();
        assert_eq!(workers, vec!["Entry_0", "Entry_2", "Entry_4", "Entry_5"]);
        assert!(!broker.exists("worker:Entry_1"));

        let running = broker.hgetall(keys::SUPERVISOR_RUNNING).await.unwrap();
        assert_eq!(running.get("Entry").map(String::as_str), Some("4"));
    }

    #[tokio::test]
    async fn test_zero_processes_defaults_to_one() {
        let startup = StartupConfig::from_programs([("Entry", WorkerProgram::new("./entry", 0))]);
        let (mut sup, launcher, broker) = supervisor(startup, PipelineConfig::default());

        sup.reconcile().await.unwrap();

        assert_eq!(launcher.specs().len(), 1);
        let expected = broker.hgetall(keys::SUPERVISOR_EXPECTED).await.unwrap();
        assert_eq!(expected.get("Entry").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_worker_command_line_and_record() {
        let program = WorkerProgram::new("./entry", 1).with_args(["--verbose"]);
        let startup = StartupConfig::from_programs([("Entry", program)]);
        let (mut sup, launcher, broker) = supervisor(startup, PipelineConfig::default());

        sup.reconcile().await.unwrap();

        let spec = &launcher.specs()[0];
        assert_eq!(spec.program, "./entry");
        assert_eq!(
            spec.args,
            vec!["--verbose", "-r", "runtime.json", "-i", "Entry_0"]
        );
        let record = broker.hgetall("worker:Entry_0").await.unwrap();
        assert_eq!(record.get(record::MODULE).map(String::as_str), Some("Entry"));
        assert_eq!(record.get(record::PID).map(String::as_str), Some("1000"));
        assert!(record.contains_key(record::STARTED_AT));
    }

    #[tokio::test]
    async fn test_relay_pools_follow_pipeline() {
        let pipeline = PipelineConfig::from_modules([
            ("Entry", ModuleConfig::new(Some("entry"), &["next"])),
            ("Sink", ModuleConfig::new(Some("next"), &[])),
            ("Producer", ModuleConfig::new(None, &["entry"])),
        ]);
        let (mut sup, launcher, _broker) = supervisor(StartupConfig::default(), pipeline);

        let mut names: Vec<&str> = sup.pools().iter().map(Pool::name).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "queue-in:Entry",
                "queue-in:Sink",
                "queue-out:Entry",
                "queue-out:Producer"
            ]
        );
        assert!(sup.pool("queue-out:Sink").is_none());

        sup.reconcile().await.unwrap();
        let relay = launcher
            .specs()
            .into_iter()
            .find(|s| s.runtime_id == "queue-in:Entry_0")
            .expect("inbound relay launched");
        assert_eq!(relay.program, "/usr/bin/pipequeue");
        assert_eq!(
            relay.args,
            vec!["queue-in", "-p", "pipeline.json", "-r", "runtime.json", "-m", "Entry"]
        );
    }

    #[tokio::test]
    async fn test_failed_launch_is_retried() {
        let startup = StartupConfig::from_programs([("Entry", WorkerProgram::new("./entry", 2))]);
        let (mut sup, launcher, _broker) = supervisor(startup, PipelineConfig::default());

        launcher.fail.store(true, Ordering::SeqCst);
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(sup.pool("Entry").unwrap().state(), PoolState::Degraded);

        launcher.fail.store(false, Ordering::SeqCst);
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.spawned, 2);
        assert_eq!(sup.pool("Entry").unwrap().state(), PoolState::Running);
    }

    #[tokio::test]
    async fn test_shutdown_kills_and_purges() {
        let startup = StartupConfig::from_programs([("Entry", WorkerProgram::new("./entry", 2))]);
        let (mut sup, launcher, broker) = supervisor(startup, PipelineConfig::default());
        let (tx, rx) = shutdown::channel();

        let handle = tokio::spawn(async move {
            let result = sup.run(rx).await;
            (sup, result)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.alive(), 2);

        tx.send(()).expect("supervisor listening");
        let (sup, result) = handle.await.expect("supervisor joined");
        result.unwrap();

        assert_eq!(launcher.alive(), 0);
        assert_eq!(sup.pool("Entry").unwrap().state(), PoolState::Stopped);
        assert!(!broker.exists(keys::WORKERS));
        assert!(!broker.exists(keys::SUPERVISOR_EXPECTED));
        assert!(!broker.exists(keys::SUPERVISOR_RUNNING));
        assert!(!broker.exists("worker:Entry_0"));
        assert!(!broker.exists("worker:Entry_1"));
    }

    #[tokio::test]
    async fn test_shutdown_purges_only_tracked_workers() {
        let startup = StartupConfig::from_programs([("Entry", WorkerProgram::new("./entry", 2))]);
        let (mut sup, launcher, broker) = supervisor(startup, PipelineConfig::default());

        sup.reconcile().await.unwrap();
        launcher.crash("Entry_0");
        let report = sup.reconcile().await.unwrap();
        assert_eq!(report.reaped, 1);
        assert!(!broker.exists("worker:Entry_0"));

        assert_eq!(sup.live_worker_ids(), vec!["Entry_1", "Entry_2"]);

        let killed = sup.shutdown().await.unwrap();
        assert_eq!(killed, 2);
        assert!(sup.live_worker_ids().is_empty());
        assert!(!broker.exists("worker:Entry_1"));
        assert!(!broker.exists("worker:Entry_2"));
    }
}
