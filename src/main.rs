//! pipequeue CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use pipequeue::config::RuntimeConfig;
use pipequeue::logging::BrokerLogLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level
    let cli = pipequeue::cli::parse_cli();

    // Initialize tracing with environment filter
    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    // Mirror events into the broker when the runtime config has a Log entry.
    // A missing or unreadable runtime config is reported by the command itself.
    let broker_layer = match RuntimeConfig::load(cli.command.runtime_path()) {
        Ok(runtime) => match BrokerLogLayer::from_runtime(cli.command.log_name(), &runtime).await {
            Ok(layer) => layer.map(|(layer, _writer)| layer),
            Err(e) => {
                eprintln!("Broker log sink disabled: {}", e);
                None
            }
        },
        Err(_) => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(broker_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    // Run the CLI with parsed arguments
    pipequeue::cli::run_with_cli(cli).await
}
