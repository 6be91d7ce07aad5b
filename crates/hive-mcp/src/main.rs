//! Hive MCP adapter binary: stdio JSON-RPC in front of an embedded hub.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use hive_core::config::load_config;
use hive_core::tracing_init::LogWriter;
use hive_mcp::{EmbeddedHub, McpServer};

#[derive(Parser, Debug)]
#[command(name = "hive-mcp")]
#[command(version, about = "Hive MCP adapter - drone orchestration tools over stdio")]
struct Args {
    /// Address the embedded hub listens on
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

    /// Output logs as JSON. Logs always go to stderr.
    #[arg(long, env = "HIVE_LOG_JSON")]
    log_json: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "HIVE_LOG_LEVEL")]
    log_level: String,

    /// OpenTelemetry OTLP endpoint. Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "HIVE_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

impl Args {
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

    // stdout carries the protocol.
    let log_filter = format!(
        "hive_mcp={level},hive_hub={level},hive_core={level}",
        level = args.log_level
    );
    #[cfg(feature = "metrics")]
    let _metrics_guard = hive_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        LogWriter::Stderr,
        args.metrics_endpoint.as_deref(),
    );
    #[cfg(not(feature = "metrics"))]
    hive_core::tracing_init::init_tracing(&log_filter, args.log_json, LogWriter::Stderr);

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    if config.hub.repo_path.is_none() {
        warn!("No repository configured; spawning is disabled until --repo is set");
    }

    let embedded = EmbeddedHub::start(config).await?;
    info!(version = env!("CARGO_PKG_VERSION"), hub = embedded.url(), "Starting hive-mcp");

    let server = McpServer::new(Arc::clone(embedded.hub()));
    let served = tokio::select! {
        result = server.run(tokio::io::stdin(), tokio::io::stdout()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            Ok(())
        }
    };

    embedded.shutdown().await?;
    served?;
    info!("hive-mcp stopped");
    Ok(())
}
