//! Hive Hub
//!
//! Spawns worktree-isolated drones and serves the coordination API
//! (agents, tasks, solicitations, ports, events) over REST and SSE.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use hive_core::config::load_config;
use hive_core::tracing_init::LogWriter;
use hive_hub::Hub;

#[derive(Parser, Debug)]
#[command(name = "hive-hub")]
#[command(version, about = "Hive hub - drone orchestration server")]
struct Args {
    /// REST/SSE bind address
    #[arg(long, env = "HIVE_LISTEN_ADDR")]
    addr: Option<SocketAddr>,

    /// Repository the drones branch from
    #[arg(long, env = "HIVE_REPO_PATH")]
    repo: Option<PathBuf>,

    /// Explicit config file, layered over the global one
    #[arg(long, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Base directory for drone worktrees
    #[arg(long, env = "HIVE_WORKTREES_DIR")]
    worktree_dir: Option<PathBuf>,

    /// First control port handed to drones
    #[arg(long, env = "HIVE_BASE_PORT")]
    base_port: Option<u16>,

    /// Run drones under the sandbox wrapper by default
    #[arg(long)]
    sandbox: bool,

    /// Default model for drones
    #[arg(long, env = "HIVE_MODEL")]
    model: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "HIVE_LOG_JSON")]
    log_json: bool,

    /// Log level filter for the hub (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "HIVE_LOG_LEVEL")]
    log_level: String,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "HIVE_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

impl Args {
    /// CLI flags win over every config layer.
    fn apply(&self, config: &mut hive_core::Config) {
        if let Some(addr) = self.addr {
            config.hub.listen_addr = addr;
        }
        if let Some(repo) = &self.repo {
            config.hub.repo_path = Some(repo.clone());
        }
        if let Some(dir) = &self.worktree_dir {
            config.worktree.root.clone_from(dir);
        }
        if let Some(port) = self.base_port {
            config.spawner.base_port = port;
        }
        if self.sandbox {
            config.spawner.sandbox = true;
        }
        if let Some(model) = &self.model {
            config.spawner.model = Some(model.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("hive_hub={},hive_core={}", args.log_level, args.log_level);
    #[cfg(feature = "metrics")]
    let _metrics_guard = hive_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        LogWriter::Stdout,
        args.metrics_endpoint.as_deref(),
    );
    #[cfg(not(feature = "metrics"))]
    hive_core::tracing_init::init_tracing(&log_filter, args.log_json, LogWriter::Stdout);

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.hub.listen_addr,
        repo = ?config.hub.repo_path,
        worktrees = %config.worktree.root.display(),
        base_port = config.spawner.base_port,
        "Starting hive-hub"
    );
    if config.hub.repo_path.is_none() {
        warn!("No repository configured; spawning is disabled until --repo is set");
    }

    let listener = tokio::net::TcpListener::bind(config.hub.listen_addr).await?;
    let hub = Arc::new(Hub::new(config)?);
    let report = hub.reconcile().await?;
    if report.agents_recovered + report.agents_dropped > 0 {
        info!(
            recovered = report.agents_recovered,
            dropped = report.agents_dropped,
            "Recovered agents from previous run"
        );
    }

    let mut server = tokio::spawn(Arc::clone(&hub).serve(listener));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so drones don't notify systemd themselves.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let exited = tokio::select! {
        result = &mut server => {
            warn!("Server exited before a shutdown signal");
            Some(result)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            None
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            None
        }
    };

    hub.stop().await?;
    match exited {
        Some(result) => result??,
        None => server.await??,
    }

    info!("Hub stopped");
    Ok(())
}
