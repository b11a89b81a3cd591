use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use trigger_receiver::{serve, ReceiverConfig, ReceiverError, StaticDecisionProvider};

/// Event trigger webhook receiver.
#[derive(Debug, Parser)]
#[command(name = "trigger-receiver", version)]
struct Cli {
    /// TOML config file. Without it, TOKEN and PORT are read from the environment.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listening port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("trigger_receiver=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trigger_receiver=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ReceiverError> {
    let mut config = match cli.config {
        Some(path) => ReceiverConfig::load(path)?,
        None => ReceiverConfig::from_env()?,
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    serve(config, Arc::new(StaticDecisionProvider::auto_approve())).await
}
