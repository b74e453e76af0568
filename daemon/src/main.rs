//! BoomPoW daemon: runs the work broker or a worker.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;

use bpow_broker::{Broker, BrokerConfig, BrokerDeps};
use bpow_utils::{init_logging, LogFormat, ShutdownController};
use bpow_worker::WorkerConfig;

#[derive(Parser)]
#[command(name = "bpow", about = "BoomPoW distributed proof-of-work")]
struct Cli {
    /// Path to a TOML configuration file. File settings are the base;
    /// CLI flags and env vars override them.
    #[arg(long, global = true, env = "BPOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, global = true, env = "BPOW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "human" or "json".
    #[arg(long, global = true, env = "BPOW_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// The work broker.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// A worker that computes work for a broker.
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Run the broker.
    Run(ServerArgs),
    /// Print the effective configuration as TOML.
    PrintConfig(ServerArgs),
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Run the worker.
    Run(WorkerArgs),
    /// Print the effective configuration as TOML.
    PrintConfig(WorkerArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Address to bind, e.g. "0.0.0.0:8080".
    #[arg(long, env = "BPOW_LISTEN")]
    listen: Option<String>,

    /// First-tier wait in milliseconds.
    #[arg(long, env = "BPOW_SHORT_TIMEOUT_MS")]
    short_timeout_ms: Option<u64>,

    /// Second-tier wait in milliseconds.
    #[arg(long, env = "BPOW_LONG_TIMEOUT_MS")]
    long_timeout_ms: Option<u64>,

    /// Ignore X-Real-IP / X-Forwarded-For.
    #[arg(long, env = "BPOW_NO_PROXY_HEADERS")]
    no_proxy_headers: bool,

    /// Disable the Prometheus endpoint.
    #[arg(long, env = "BPOW_DISABLE_METRICS")]
    disable_metrics: bool,
}

#[derive(Args)]
struct WorkerArgs {
    /// Broker WebSocket URL.
    #[arg(long, env = "BPOW_URL")]
    url: Option<String>,

    /// Auth token sent as the Authorization header.
    #[arg(long, env = "BPOW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Work items computed at the same time.
    #[arg(long, env = "BPOW_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Threads for the CPU engine.
    #[arg(long, env = "BPOW_CPU_THREADS")]
    cpu_threads: Option<usize>,

    /// Ignore requests below this multiplier.
    #[arg(long, env = "BPOW_MIN_DIFFICULTY")]
    min_difficulty: Option<u32>,

    /// Ignore requests above this multiplier.
    #[arg(long, env = "BPOW_MAX_DIFFICULTY")]
    max_difficulty: Option<u32>,

    /// Ignore precache requests.
    #[arg(long, env = "BPOW_SKIP_PRECACHE")]
    skip_precache: bool,
}

impl ServerArgs {
    fn apply(self, mut config: BrokerConfig) -> BrokerConfig {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(ms) = self.short_timeout_ms {
            config.short_timeout_ms = ms;
        }
        if let Some(ms) = self.long_timeout_ms {
            config.long_timeout_ms = ms;
        }
        if self.no_proxy_headers {
            config.trust_proxy_headers = false;
        }
        if self.disable_metrics {
            config.enable_metrics = false;
        }
        config
    }
}

impl WorkerArgs {
    fn apply(self, mut config: WorkerConfig) -> WorkerConfig {
        if let Some(url) = self.url {
            config.server_url = url;
        }
        if let Some(token) = self.token {
            config.token = token;
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if self.cpu_threads.is_some() {
            config.cpu_threads = self.cpu_threads;
        }
        if let Some(min) = self.min_difficulty {
            config.min_difficulty = min;
        }
        if let Some(max) = self.max_difficulty {
            config.max_difficulty = max;
        }
        if self.skip_precache {
            config.skip_precache = true;
        }
        config
    }
}

fn load_broker_config(path: Option<&Path>) -> anyhow::Result<BrokerConfig> {
    match path {
        Some(path) => BrokerConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(BrokerConfig::default()),
    }
}

fn load_worker_config(path: Option<&Path>) -> anyhow::Result<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(WorkerConfig::default()),
    }
}

/// CLI values win over the config file.
fn start_logging(
    cli_format: Option<LogFormat>,
    cli_level: Option<&str>,
    file_format: &str,
    file_level: &str,
) {
    let format = cli_format.unwrap_or_else(|| file_format.parse().unwrap_or_default());
    init_logging(format, cli_level.unwrap_or(file_level));
}

async fn run_server(config: BrokerConfig) -> anyhow::Result<()> {
    let shutdown = ShutdownController::new();
    let broker = Broker::start(&config, BrokerDeps::in_memory(&config), &shutdown)
        .context("starting broker")?;
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    let signals = shutdown.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    tracing::info!(
        addr = %config.listen_addr,
        tokens = config.tokens.len(),
        metrics = config.enable_metrics,
        "starting broker"
    );
    broker.serve(listener, &shutdown).await?;
    tracing::info!("broker exited cleanly");
    Ok(())
}

async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    let shutdown = ShutdownController::new();
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    bpow_worker::run(&config, &shutdown).await?;
    tracing::info!("worker exited cleanly");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Server { action } => match action {
            ServerAction::Run(args) => {
                let config = args.apply(load_broker_config(config_path)?);
                start_logging(
                    cli.log_format,
                    cli.log_level.as_deref(),
                    &config.log_format,
                    &config.log_level,
                );
                run_server(config).await
            }
            ServerAction::PrintConfig(args) => {
                let config = args.apply(load_broker_config(config_path)?);
                println!("{}", config.to_toml_string()?);
                Ok(())
            }
        },
        Command::Worker { action } => match action {
            WorkerAction::Run(args) => {
                let config = args.apply(load_worker_config(config_path)?);
                start_logging(
                    cli.log_format,
                    cli.log_level.as_deref(),
                    &config.log_format,
                    &config.log_level,
                );
                run_worker(config).await
            }
            WorkerAction::PrintConfig(args) => {
                let config = args.apply(load_worker_config(config_path)?);
                println!("{}", config.to_toml_string()?);
                Ok(())
            }
        },
    }
}
