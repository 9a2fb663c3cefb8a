//! CLI command definitions for pipequeue.
//!
//! Every long-running command stops on SIGINT, SIGTERM or SIGQUIT.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerPool;
use crate::clock::epoch_now;
use crate::config::{PipelineConfig, RuntimeConfig, Settings, StartupConfig};
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::relay::{Destination, InboundRelay, OutboundRelay};
use crate::shutdown;
use crate::status::{ProcfsProbe, StatusAggregator};
use crate::supervisor::{LaunchPaths, OsLauncher, Supervisor};
use crate::worker::{run_passthrough, ModuleQueue};

/// Broker-backed message pipeline.
#[derive(Parser)]
#[command(name = "pipequeue")]
#[command(about = "Relay messages between pub/sub channels and worker queues")]
#[command(version)]
#[command(
    long_about = "pipequeue moves messages between pub/sub channels and per-module work queues, delays messages carrying a run_at time and keeps worker pools alive.\n\nExample usage:\n  pipequeue manage -p pipeline.json -r runtime.json -s startup.json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Relay a module's source channel into its ready and delayed sets.
    QueueIn(RelayArgs),

    /// Publish a module's results to its destination channels.
    QueueOut(RelayArgs),

    /// Supervise workers and relays for a whole pipeline.
    Manage(ManageArgs),

    /// Write status snapshots for every module.
    Status(StatusArgs),

    /// Run the pass-through worker for one module instance.
    Worker(WorkerArgs),

    /// Publish test messages to a module's source channel.
    Publish(PublishArgs),
}

/// Arguments shared by `queue-in` and `queue-out`.
#[derive(Parser, Debug)]
pub struct RelayArgs {
    /// Pipeline configuration file.
    #[arg(short = 'p', long, env = "PIPEQUEUE_PIPELINE")]
    pub pipeline: PathBuf,

    /// Module to relay for.
    #[arg(short = 'm', long)]
    pub module: String,

    /// Runtime configuration file.
    #[arg(short = 'r', long, env = "PIPEQUEUE_RUNTIME")]
    pub runtime: PathBuf,
}

/// Arguments for `pipequeue manage`.
#[derive(Parser, Debug)]
pub struct ManageArgs {
    /// Pipeline configuration file.
    #[arg(short = 'p', long, env = "PIPEQUEUE_PIPELINE")]
    pub pipeline: PathBuf,

    /// Runtime configuration file.
    #[arg(short = 'r', long, env = "PIPEQUEUE_RUNTIME")]
    pub runtime: PathBuf,

    /// Startup configuration file.
    #[arg(short = 's', long, env = "PIPEQUEUE_STARTUP")]
    pub startup: PathBuf,
}

/// Arguments for `pipequeue status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Pipeline configuration file.
    #[arg(short = 'p', long, env = "PIPEQUEUE_PIPELINE")]
    pub pipeline: PathBuf,

    /// Runtime configuration file.
    #[arg(short = 'r', long, env = "PIPEQUEUE_RUNTIME")]
    pub runtime: PathBuf,

    /// Startup configuration, adds worker-only modules to the report.
    #[arg(short = 's', long, env = "PIPEQUEUE_STARTUP")]
    pub startup: Option<PathBuf>,

    /// Write one snapshot, print it as JSON and exit.
    #[arg(long)]
    pub once: bool,
}

/// Arguments for `pipequeue worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Runtime configuration file.
    #[arg(short = 'r', long, env = "PIPEQUEUE_RUNTIME")]
    pub runtime: PathBuf,

    /// Runtime id, `<module>_<n>`.
    #[arg(short = 'i', long)]
    pub id: String,
}

/// Arguments for `pipequeue publish`.
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// Pipeline configuration file.
    #[arg(short = 'p', long, env = "PIPEQUEUE_PIPELINE")]
    pub pipeline: PathBuf,

    /// Runtime configuration file.
    #[arg(short = 'r', long, env = "PIPEQUEUE_RUNTIME")]
    pub runtime: PathBuf,

    /// Module whose source channel receives the messages.
    #[arg(short = 'm', long)]
    pub module: String,

    /// JSON object to send.
    #[arg(long)]
    pub content: String,

    /// Deliver this many seconds from now.
    #[arg(long)]
    pub delay: Option<f64>,

    /// Number of messages to send.
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,
}

impl Commands {
    /// Runtime configuration path of the command.
    pub fn runtime_path(&self) -> &Path {
        match self {
            Commands::QueueIn(args) | Commands::QueueOut(args) => &args.runtime,
            Commands::Manage(args) => &args.runtime,
            Commands::Status(args) => &args.runtime,
            Commands::Worker(args) => &args.runtime,
            Commands::Publish(args) => &args.runtime,
        }
    }

    /// Name of the process in broker log lists.
    pub fn log_name(&self) -> String {
        match self {
            Commands::QueueIn(args) => format!("queue-in:{}", args.module),
            Commands::QueueOut(args) => format!("queue-out:{}", args.module),
            Commands::Manage(_) => "manage".to_string(),
            Commands::Status(_) => "status".to_string(),
            Commands::Worker(args) => args.id.clone(),
            Commands::Publish(args) => format!("publish:{}", args.module),
        }
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    settings.validate()?;

    match cli.command {
        Commands::QueueIn(args) => run_queue_in_command(args, &settings).await,
        Commands::QueueOut(args) => run_queue_out_command(args, &settings).await,
        Commands::Manage(args) => run_manage_command(args, &settings).await,
        Commands::Status(args) => run_status_command(args, &settings).await,
        Commands::Worker(args) => run_worker_command(args, &settings).await,
        Commands::Publish(args) => run_publish_command(args).await,
    }
}

/// Shutdown channel fired by the first termination signal.
///
/// The returned sender must be kept alive for as long as the receivers are
/// used: dropping every sender counts as shutdown.
fn shutdown_on_signal() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
    let (tx, rx) = shutdown::channel();
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        match shutdown::wait_for_signal().await {
            Ok(()) => {
                info!("Shutdown signal received");
                let _ = signal_tx.send(());
            }
            Err(e) => {
                warn!(error = %e, "Signal handlers unavailable, only external kill stops this process");
                std::future::pending::<()>().await;
            }
        }
    });
    (tx, rx)
}

fn load_pipeline(path: &Path) -> anyhow::Result<PipelineConfig> {
    let pipeline = PipelineConfig::load(path)?;
    pipeline.validate()?;
    Ok(pipeline)
}

// ============================================================================
// Relays
// ============================================================================

async fn run_queue_in_command(args: RelayArgs, settings: &Settings) -> anyhow::Result<()> {
    let pipeline = load_pipeline(&args.pipeline)?;
    let source = pipeline
        .module(&args.module)?
        .source
        .clone()
        .ok_or_else(|| RelayError::NoSource(args.module.clone()))?;

    let mut brokers = BrokerPool::new(RuntimeConfig::load(&args.runtime)?);
    let broker = brokers.default_broker().await?;
    let source_broker = brokers.for_channel(&source).await?;

    let relay = InboundRelay::new(&args.module, source, source_broker, broker, settings);
    let (_tx, rx) = shutdown_on_signal();
    relay.run(rx).await?;
    Ok(())
}

async fn run_queue_out_command(args: RelayArgs, settings: &Settings) -> anyhow::Result<()> {
    let pipeline = load_pipeline(&args.pipeline)?;
    let module = pipeline.module(&args.module)?;

    let mut brokers = BrokerPool::new(RuntimeConfig::load(&args.runtime)?);
    let broker = brokers.default_broker().await?;
    let mut destinations = Vec::with_capacity(module.destinations().len());
    for channel in module.destinations() {
        destinations.push(Destination::new(
            channel.as_str(),
            brokers.for_channel(channel).await?,
        ));
    }

    let relay = OutboundRelay::new(&args.module, broker, destinations, settings);
    let (_tx, rx) = shutdown_on_signal();
    let exit = relay.run(rx).await?;
    info!(module = %args.module, exit = ?exit, "Outbound relay exited");
    Ok(())
}

// ============================================================================
// Supervisor and status
// ============================================================================

async fn run_manage_command(args: ManageArgs, settings: &Settings) -> anyhow::Result<()> {
    settings.validate_status()?;
    let pipeline = load_pipeline(&args.pipeline)?;
    let startup = StartupConfig::load(&args.startup)?;
    let mut brokers = BrokerPool::new(RuntimeConfig::load(&args.runtime)?);
    let broker = brokers.default_broker().await?;

    let relay_program = std::env::current_exe()
        .context("Failed to locate the pipequeue executable for relays")?;
    let paths = LaunchPaths {
        pipeline: args.pipeline.display().to_string(),
        runtime: args.runtime.display().to_string(),
        relay_program: relay_program.display().to_string(),
    };

    let mut supervisor = Supervisor::new(
        &pipeline,
        &startup,
        paths,
        Arc::new(OsLauncher),
        Arc::clone(&broker),
        settings,
    );
    let aggregator = StatusAggregator::new(
        broker,
        known_modules(&pipeline, Some(&startup)),
        Arc::new(ProcfsProbe::new()),
        settings,
    );

    let (tx, rx) = shutdown_on_signal();
    let status_rx = tx.subscribe();
    let status_task = tokio::spawn(async move { aggregator.run(status_rx).await });

    let result = supervisor.run(rx).await;

    // the supervisor may have stopped on an error; stop the aggregator as well
    let _ = tx.send(());
    match status_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Status aggregator failed"),
        Err(e) => error!(error = %e, "Status aggregator task panicked"),
    }

    result?;
    Ok(())
}

async fn run_status_command(args: StatusArgs, settings: &Settings) -> anyhow::Result<()> {
    settings.validate_status()?;
    let pipeline = load_pipeline(&args.pipeline)?;
    let startup = match &args.startup {
        Some(path) => Some(StartupConfig::load(path)?),
        None => None,
    };
    let mut brokers = BrokerPool::new(RuntimeConfig::load(&args.runtime)?);
    let aggregator = StatusAggregator::new(
        brokers.default_broker().await?,
        known_modules(&pipeline, startup.as_ref()),
        Arc::new(ProcfsProbe::new()),
        settings,
    );

    if args.once {
        let snapshot = aggregator.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let (_tx, rx) = shutdown_on_signal();
    aggregator.run(rx).await?;
    Ok(())
}

fn known_modules(pipeline: &PipelineConfig, startup: Option<&StartupConfig>) -> Vec<String> {
    let mut names: BTreeSet<String> = pipeline.module_names().into_iter().collect();
    if let Some(startup) = startup {
        names.extend(startup.programs().map(|(name, _)| name.to_string()));
    }
    names.into_iter().collect()
}

// ============================================================================
// Worker and publisher
// ============================================================================

async fn run_worker_command(args: WorkerArgs, settings: &Settings) -> anyhow::Result<()> {
    let mut brokers = BrokerPool::new(RuntimeConfig::load(&args.runtime)?);
    let queue = ModuleQueue::new(&args.id, brokers.default_broker().await?)?;
    queue.register(std::process::id()).await?;

    let (_tx, rx) = shutdown_on_signal();
    run_passthrough(&queue, settings.outbound_backoff, rx).await?;
    Ok(())
}

async fn run_publish_command(args: PublishArgs) -> anyhow::Result<()> {
    let pipeline = load_pipeline(&args.pipeline)?;
    let channel = pipeline
        .module(&args.module)?
        .source
        .clone()
        .ok_or_else(|| RelayError::NoSource(args.module.clone()))?;

    let payload = match serde_json::from_str::<serde_json::Value>(&args.content)
        .context("--content is not valid JSON")?
    {
        serde_json::Value::Object(map) => map,
        _ => anyhow::bail!("--content must be a JSON object"),
    };

    let mut brokers = BrokerPool::new(RuntimeConfig::load(&args.runtime)?);
    let broker = brokers.for_channel(&channel).await?;

    for _ in 0..args.count {
        let envelope = build_message(&payload, args.delay, epoch_now());
        broker.publish(&channel, envelope.as_str()).await?;
        info!(
            channel = %channel,
            id = envelope.id().unwrap_or("-"),
            run_at = ?envelope.run_at(),
            "Published message"
        );
    }
    Ok(())
}

fn build_message(
    payload: &serde_json::Map<String, serde_json::Value>,
    delay: Option<f64>,
    now: f64,
) -> Envelope {
    let envelope = Envelope::from_payload(payload.clone()).with_id(Uuid::new_v4().to_string());
    match delay {
        Some(delay) => envelope.with_run_at(now + delay),
        None => envelope,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_queue_in_arguments() {
        let args = vec![
            "pipequeue",
            "queue-in",
            "-p",
            "pipeline.json",
            "-m",
            "Entry",
            "-r",
            "runtime.json",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.command.log_name(), "queue-in:Entry");
        assert_eq!(cli.command.runtime_path(), Path::new("runtime.json"));
        match cli.command {
            Commands::QueueIn(args) => {
                assert_eq!(args.module, "Entry");
                assert_eq!(args.pipeline, PathBuf::from("pipeline.json"));
            }
            _ => panic!("Expected QueueIn command"),
        }
    }

    #[test]
    fn test_manage_requires_startup() {
        let args = vec!["pipequeue", "manage", "-p", "p.json", "-r", "r.json"];
        // unless PIPEQUEUE_STARTUP is set in the environment
        if std::env::var_os("PIPEQUEUE_STARTUP").is_none() {
            assert!(Cli::try_parse_from(args).is_err());
        }
    }

    #[test]
    fn test_worker_arguments() {
        let args = vec![
            "pipequeue",
            "--log-level",
            "debug",
            "worker",
            "-r",
            "runtime.json",
            "-i",
            "Entry_3",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.command.log_name(), "Entry_3");
    }

    #[test]
    fn test_publish_defaults() {
        let args = vec![
            "pipequeue",
            "publish",
            "-p",
            "p.json",
            "-r",
            "r.json",
            "-m",
            "Entry",
            "--content",
            r#"{"content": 42}"#,
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");
        match cli.command {
            Commands::Publish(args) => {
                assert_eq!(args.count, 1);
                assert!(args.delay.is_none());
            }
            _ => panic!("Expected Publish command"),
        }
    }

    #[test]
    fn test_build_message() {
        let payload = serde_json::json!({"content": 1});
        let payload = payload.as_object().expect("object").clone();

        let now = build_message(&payload, None, 1000.0);
        assert!(now.id().is_some());
        assert_eq!(now.run_at(), None);

        let later = build_message(&payload, Some(5.0), 1000.0);
        assert_eq!(later.run_at(), Some(1005.0));
        assert!(later.is_delayed(1004.0));
        assert_ne!(now.id(), later.id());
    }

    #[test]
    fn test_known_modules_union() {
        use crate::config::{ModuleConfig, WorkerProgram};

        let pipeline = PipelineConfig::from_modules([("Entry", ModuleConfig::new(Some("e"), &[]))]);
        let startup = StartupConfig::from_programs([
            ("Entry", WorkerProgram::new("./e", 1)),
            ("Batch", WorkerProgram::new("./b", 1)),
        ]);

        assert_eq!(
            known_modules(&pipeline, Some(&startup)),
            vec!["Batch".to_string(), "Entry".to_string()]
        );
        assert_eq!(known_modules(&pipeline, None), vec!["Entry".to_string()]);
    }
}
