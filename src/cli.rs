use crate::{
    bind_listener, format_duration, parse_target_list, serve, AppState, BatchResponse, Config,
    HttpFetcher, LoggingSettings,
};
use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "url-fanout")]
#[command(about = "Fan a batch of URLs out to concurrent JSON fetches")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (default: config/config.yml)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Batches admitted concurrently")]
    pub global_limit: Option<usize>,

    #[arg(long, help = "Fetches in flight per batch")]
    pub batch_limit: Option<usize>,

    #[arg(long, help = "Largest accepted batch")]
    pub max_targets: Option<usize>,

    #[arg(long, value_parser = parse_duration, help = "Per-fetch timeout, e.g. 1s or 750ms")]
    pub call_timeout: Option<Duration>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service until SIGINT or SIGTERM
    Serve {
        #[arg(short, long, help = "Listen address as host:port")]
        address: Option<String>,

        #[arg(long, help = "Network family (tcp, tcp4, tcp6)")]
        network: Option<String>,
    },

    /// Fetch one batch in-process and print the response body
    Fetch {
        #[arg(short, long, help = "File containing URLs (one per line)")]
        input: Option<PathBuf>,

        #[arg(help = "URLs to fetch")]
        urls: Vec<String>,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

impl Cli {
    /// Apply limit flags on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(global_limit) = self.global_limit {
            config.limits.global_limit = global_limit;
        }
        if let Some(batch_limit) = self.batch_limit {
            config.limits.batch_limit = batch_limit;
        }
        if let Some(max_targets) = self.max_targets {
            config.limits.max_targets = max_targets;
        }
        if let Some(call_timeout) = self.call_timeout {
            config.limits.call_timeout = call_timeout;
        }
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        match command {
            Commands::Serve { address, network } => self.run_server(address, network, shutdown).await,
            Commands::Fetch { input, urls } => self.run_fetch(input, urls, shutdown).await,
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    pub async fn run_server(
        &self,
        address: Option<String>,
        network: Option<String>,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut config = self.config.clone();
        if let Some(address) = address {
            config.server.address = address;
        }
        if let Some(network) = network {
            config.server.network = network;
        }
        config.validate()?;

        info!(
            global_limit = config.limits.global_limit,
            batch_limit = config.limits.batch_limit,
            max_targets = config.limits.max_targets,
            call_timeout = ?config.limits.call_timeout,
            "Starting server"
        );

        let listener = bind_listener(&config.server).await?;
        let state = Arc::new(AppState::from_config(config)?);

        serve(listener, state, shutdown).await
    }

    pub async fn run_fetch(
        &self,
        input: Option<PathBuf>,
        mut urls: Vec<String>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        if let Some(path) = &input {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let from_file = parse_target_list(&content);
            info!("Loaded {} URLs from {}", from_file.len(), path.display());
            urls.extend(from_file);
        }

        if urls.is_empty() {
            bail!("no URLs given; pass them as arguments or with --input");
        }

        let fetcher = HttpFetcher::new(self.config.limits.call_timeout)?;
        let state = AppState::new(self.config.clone(), Arc::new(fetcher));

        let _slot = state
            .admission
            .try_admit()
            .ok_or_else(|| anyhow!("admission pool exhausted"))?;

        let cancel = CancellationToken::new();
        let start = Instant::now();

        let outcome = tokio::select! {
            outcome = state.dispatcher.dispatch(&cancel, urls) => outcome,
            Ok(()) = shutdown.recv() => {
                warn!("Interrupted, cancelling in-flight fetches");
                cancel.cancel();
                bail!("batch interrupted");
            }
        };

        let batch = outcome?;
        info!(
            "Batch of {} records completed in {}",
            batch.len(),
            format_duration(start.elapsed())
        );

        let response = BatchResponse::from(batch);
        println!("{}", serde_json::to_string_pretty(&response)?);

        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::load(&config_path)?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Listen: {} ({})", config.server.address, config.server.network);
        println!("  Global limit: {}", config.limits.global_limit);
        println!("  Batch limit: {}", config.limits.batch_limit);
        println!("  Max targets: {}", config.limits.max_targets);
        println!("  Call timeout: {:?}", config.limits.call_timeout);
        println!("  Request timeout: {:?}", config.server.request_timeout);
        println!("  Shutdown timeout: {:?}", config.server.shutdown_timeout);

        Ok(())
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn setup_logging(settings: &LoggingSettings, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { settings.level.as_str() };

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("url_fanout={level},tower_http=info"))
            .with_context(|| format!("invalid log level {level:?}"))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_limit_overrides() {
        let cli = Cli::parse_from([
            "url-fanout",
            "--global-limit",
            "7",
            "--call-timeout",
            "250ms",
            "serve",
        ]);

        let mut config = Config::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.limits.global_limit, 7);
        assert_eq!(config.limits.call_timeout, Duration::from_millis(250));
        assert_eq!(config.limits.batch_limit, 4);
        assert!(matches!(
            cli.command,
            Commands::Serve { address: None, network: None }
        ));
    }

    #[test]
    fn test_fetch_arguments() {
        let cli = Cli::parse_from([
            "url-fanout",
            "fetch",
            "--input",
            "urls.txt",
            "https://a.test/1",
            "https://a.test/2",
        ]);

        match cli.command {
            Commands::Fetch { input, urls } => {
                assert_eq!(input, Some(PathBuf::from("urls.txt")));
                assert_eq!(urls.len(), 2);
            }
            _ => panic!("expected fetch command"),
        }
    }

    #[test]
    fn test_invalid_call_timeout_rejected() {
        let result = Cli::try_parse_from(["url-fanout", "--call-timeout", "soon", "serve"]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fetch_without_urls_fails() {
        let runner = CliRunner::new(Config::default());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let result = runner.run_fetch(None, Vec::new(), shutdown_rx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_validate_config_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "limits:\n  batch_limit: 0\n").unwrap();

        let runner = CliRunner::new(Config::default());
        assert!(runner.validate_config(file.path().to_path_buf()).await.is_err());

        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "limits:\n  batch_limit: 2\n").unwrap();
        assert!(runner.validate_config(file.path().to_path_buf()).await.is_ok());
    }
}
