//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "binary"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Binary entrypoint for the orchestration daemon."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tso_common::{init_cli_tracing, init_tracing, AppConfig, LoadedAppConfig};
use tso_core::Orchestrator;
use tso_metrics::{new_registry, spawn_http_server, DaemonMetrics};

mod commands;

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["configs/tsod.toml", "configs/tsod.example.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Trading simulation orchestration daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the stream consumer and run lifecycle until interrupted")]
    Run,
    #[command(about = "Start a run and wait for its stages to come up")]
    Start(commands::StartArgs),
    #[command(about = "Stop a run and tear down its stages")]
    Stop { run_id: String },
    #[command(about = "Show the reconciled state of a run")]
    Status { run_id: String },
    #[command(about = "List runs, newest first")]
    List(commands::ListArgs),
    #[command(about = "Check reachability of every backend")]
    Health,
    #[command(about = "Append a worker event to the stream")]
    Emit(commands::EmitArgs),
}

fn version_string() -> String {
    format!("tsod {} ({})", env!("CARGO_PKG_VERSION"), build_profile())
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", version_string());
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.extend(DEFAULT_CONFIG_CANDIDATES.iter().map(PathBuf::from));

    let load_started = Instant::now();
    let loaded = if cli.config.is_some() {
        AppConfig::load_with_source(&candidates)?
    } else {
        AppConfig::load_or_default(&candidates)?
    };
    let load_duration = load_started.elapsed();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(loaded, load_duration.as_secs_f64()).await?,
        other => {
            init_cli_tracing();
            let config = loaded.config;
            match other {
                Commands::Start(args) => commands::start(&config, args).await?,
                Commands::Stop { run_id } => commands::stop(&config, &run_id).await?,
                Commands::Status { run_id } => commands::status(&config, &run_id)?,
                Commands::List(args) => commands::list(&config, args)?,
                Commands::Health => commands::health(&config).await?,
                Commands::Emit(args) => commands::emit(&config, args).await?,
                Commands::Run => {}
            }
        }
    }

    Ok(())
}

async fn run_daemon(loaded: LoadedAppConfig, load_seconds: f64) -> Result<()> {
    let LoadedAppConfig { config, source } = loaded;
    init_tracing("tsod", &config.logging)?;
    match &source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => warn!("no configuration file found; using built-in defaults"),
    }

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_seconds);
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), build_profile());

    let orchestrator = Arc::new(Orchestrator::from_config(&config, Some(registry.clone()))?);
    let recovery = orchestrator.recover().await?;
    if !recovery.failed_pending.is_empty() {
        warn!(runs = ?recovery.failed_pending, "failed runs interrupted during launch");
    }

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(
            registry,
            config.metrics.listen,
            orchestrator.clone(),
        )?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let consumer = orchestrator.spawn_consumer();
    info!(
        stream = %config.stream.stream_name,
        group = %config.stream.consumer_group,
        "daemon running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    consumer.shutdown().await?;
    orchestrator.shutdown();
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}
