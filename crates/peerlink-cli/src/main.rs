//! peerlink CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;

use peerlink_cli::{run_demo, run_session, Cli, CliConfig, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_configuration(&cli)?;

    match cli.command {
        Commands::Demo { mtu, payload_size } => {
            let report = run_demo(&config, mtu, payload_size, true)
                .await
                .context("demo failed")?;
            info!(
                mtu = report.mtu,
                payload_size = report.payload_size,
                alice_events = report.alice_events.len(),
                bob_events = report.bob_events.len(),
                "Payload delivered and echoed"
            );
        }
        Commands::Session { backend, name } => {
            run_session(&config, backend, name)
                .await
                .context("session failed")?;
        }
    }
    Ok(())
}

/// Logs go to stderr; stdout is reserved for JSON event lines
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> anyhow::Result<CliConfig> {
    match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            CliConfig::load_from_file(path)
                .with_context(|| format!("cannot load configuration from {path}"))
        }
        None => Ok(CliConfig::default()),
    }
}
