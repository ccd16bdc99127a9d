use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use observer_relay::{RawConfig, RelayConfig, init_logging, shutdown};
use tokio_util::sync::CancellationToken;

/// Observer relay - forwards observations to the remote observer with a
/// managed access token
#[derive(Parser)]
#[command(name = "observer-relay")]
#[command(about = "Credential-aware relay for the DataObserver gRPC service")]
#[command(version)]
struct Cli {
    /// Path to a YAML configuration file (environment variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (default warn; -v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw = RawConfig::load(cli.config.as_deref())?;
    if cli.print_config {
        println!("Effective configuration:\n{}", raw.to_yaml()?);
        return Ok(());
    }

    init_logging(raw.log_format_or_default(), cli.verbose)?;
    let config = raw.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_relay(config).await,
        Commands::Check => check_config(&raw),
    }
}

async fn run_relay(config: RelayConfig) -> Result<()> {
    tracing::info!(
        listen_addr = %config.listen_addr,
        observer = %config.observer_endpoint,
        test_mode = config.test_mode,
        "observer relay starting"
    );

    let cancel = CancellationToken::new();
    let watcher = shutdown::cancel_on_signal(cancel.clone());
    let result = observer_relay::run(config, cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = watcher.await {
        tracing::warn!(error = %e, "signal watcher ended abnormally");
    }
    result
}

fn check_config(raw: &RawConfig) -> Result<()> {
    tracing::info!("Checking configuration...");
    println!("Configuration is valid");
    println!("{}", raw.to_yaml()?);
    Ok(())
}
