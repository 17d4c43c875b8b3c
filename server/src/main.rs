//! citusha-monitor: keeps one writable primary per Citus worker group.
//!
//! Polls every group's primary and secondary, promotes the secondary when
//! the primary disappears, repoints coordinator metadata and persists the
//! role mapping so a restarted monitor never reinstates a stale primary.

mod settings;

use anyhow::{Context, Result};
use citusha_cluster::{
    FailoverController, HealthProbe, PgIsReadyProbe, ProbeKind, PsqlExecutor, TcpProbe,
};
use citusha_common::Topology;
use citusha_storage::{FileRoleStateStore, RoleStateStore};
use clap::{Parser, Subcommand, ValueEnum};
use settings::MonitorConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "citusha-monitor")]
#[command(about = "Failover monitor for Citus worker groups", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor until SIGINT/SIGTERM (default)
    Run,

    /// Evaluate every group once and print the decisions
    Once,

    /// Show the persisted role assignments without changing them
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration and print the effective topology
    CheckConfig,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = MonitorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let topology = config.topology().context("Invalid topology")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, topology).await,
        Commands::Once => once(config, topology).await,
        Commands::Status { json } => status(&config, &topology, json).await,
        Commands::CheckConfig => check_config(&config, &topology),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_controller(config: &MonitorConfig, topology: Topology) -> FailoverController {
    let probe: Arc<dyn HealthProbe> = match config.probe {
        ProbeKind::Tcp => Arc::new(TcpProbe::new()),
        ProbeKind::PgIsReady => Arc::new(PgIsReadyProbe::new(config.pg_isready_path.clone())),
    };
    let sql = Arc::new(PsqlExecutor::new(config.psql.clone()));
    let store = Arc::new(FileRoleStateStore::new(&config.state_path));

    FailoverController::new(topology, config.controller(), probe, sql, store)
}

async fn run(config: MonitorConfig, topology: Topology) -> Result<()> {
    info!("Starting citusha-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Role state file: {}", config.state_path.display());

    if let Some(addr) = config.metrics_listen {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start metrics exporter")?;
        info!("Serving metrics on http://{}/metrics", addr);
    }

    let controller = build_controller(&config, topology);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    controller.run(shutdown).await;
    Ok(())
}

async fn once(config: MonitorConfig, topology: Topology) -> Result<()> {
    let mut controller = build_controller(&config, topology);
    let report = controller.tick().await.context("Tick failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn status(config: &MonitorConfig, topology: &Topology, json: bool) -> Result<()> {
    let store = FileRoleStateStore::new(&config.state_path);
    let mapping = store
        .load()
        .await
        .with_context(|| format!("Failed to read {}", config.state_path.display()))?;

    let Some(mapping) = mapping else {
        println!("No role state at {} (monitor has not run yet)", config.state_path.display());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&mapping)?);
        return Ok(());
    }

    for (group, assignment) in mapping.iter() {
        let note = match topology.group(group) {
            Some(g) if assignment.primary() == &g.primary => "",
            Some(_) => "  (promoted)",
            None => "  (not in configuration)",
        };
        println!(
            "{:<12} primary={:<24} secondary={}{}",
            group.as_str(),
            assignment.primary().to_string(),
            assignment.secondary(),
            note
        );
    }
    Ok(())
}

fn check_config(config: &MonitorConfig, topology: &Topology) -> Result<()> {
    println!("Configuration OK");
    println!("  state file:     {}", config.state_path.display());
    println!("  poll interval:  {}s", config.poll_interval_secs);
    println!("  probe:          {:?} (timeout {}s)", config.probe, config.probe_timeout_secs);
    println!("  sql timeout:    {}s", config.sql_timeout_secs);
    for group in &topology.groups {
        println!("  group {:<10} primary={} secondary={}", group.name.as_str(), group.primary, group.secondary);
    }
    for coordinator in &topology.coordinators {
        println!("  coordinator     {}", coordinator);
    }
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn wait_for_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown requested, finishing the current group");
    token.cancel();
}
