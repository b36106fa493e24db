use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use url_fanout::{setup_logging, Cli, CliRunner, Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Setup logging
    setup_logging(&config.logging, args.verbose)?;

    info!("Starting url-fanout v{}", env!("CARGO_PKG_VERSION"));

    // Setup graceful shutdown; the receiver exists before any signal can be sent
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let cli_runner = CliRunner::new(config);
    let result = cli_runner.run(args.command, shutdown_rx).await;

    if let Err(e) = result {
        error!("Application error: {e:#}");
        std::process::exit(1);
    }

    info!("url-fanout stopped");
    Ok(())
}

fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(DEFAULT_CONFIG_PATH)?,
    };

    // Override with CLI arguments
    args.apply_overrides(&mut config);

    config.validate()?;

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                let _ = shutdown_tx.send(());
            }
            Err(e) => error!("Failed to install signal handlers: {e}"),
        }
    })
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }

    Ok(())
}
