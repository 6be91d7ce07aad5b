//! Hub instance owned by the MCP adapter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hive_core::Config;
use hive_hub::hub::hub_url;
use hive_hub::{Hub, HubError};

pub const READY_PROBES: u32 = 10;
pub const READY_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
pub const READY_MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Failed to bind hub listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("Failed to build health client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Hub at {url} not ready after {attempts} probes")]
    NotReady { url: String, attempts: u32 },
}

/// A hub serving on a background task.
#[derive(Debug)]
pub struct EmbeddedHub {
    hub: Arc<Hub>,
    url: String,
    server: JoinHandle<Result<(), HubError>>,
}

impl EmbeddedHub {
    /// Bind, reconcile saved state, serve, and wait until `/health` answers.
    pub async fn start(config: Config) -> Result<Self, EmbedError> {
        let hub = Arc::new(Hub::new(config)?);
        Self::start_with(hub).await
    }

    /// Like [`EmbeddedHub::start`] for a hub that is already built.
    pub async fn start_with(hub: Arc<Hub>) -> Result<Self, EmbedError> {
        let addr = hub.config().hub.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EmbedError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| EmbedError::Bind { addr, source })?;
        let url = hub_url(local);

        let report = hub.reconcile().await?;
        if report.agents_recovered + report.agents_dropped > 0 {
            info!(
                recovered = report.agents_recovered,
                dropped = report.agents_dropped,
                "Recovered agents from previous run"
            );
        }

        let server = tokio::spawn(Arc::clone(&hub).serve(listener));
        let embedded = Self { hub, url, server };

        // reqwest is built with rustls-no-provider; Err only means a provider
        // was installed already.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(READY_MAX_BACKOFF)
            .build()?;
        if let Err(e) = wait_ready(&client, &embedded.url, READY_PROBES, READY_INITIAL_BACKOFF).await {
            if let Err(stop) = embedded.shutdown().await {
                warn!(error = %stop, "Failed to stop hub after readiness failure");
            }
            return Err(e);
        }

        info!(url = %embedded.url, "Embedded hub ready");
        Ok(embedded)
    }

    pub const fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop the hub and wait for the server task to finish draining.
    pub async fn shutdown(self) -> Result<(), HubError> {
        self.hub.stop().await?;
        match self.server.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Hub server task did not finish cleanly");
                Ok(())
            }
        }
    }
}

/// Probe `{url}/health` up to `attempts` times, doubling the delay between
/// probes from `initial` up to [`READY_MAX_BACKOFF`].
pub async fn wait_ready(
    client: &reqwest::Client,
    url: &str,
    attempts: u32,
    initial: Duration,
) -> Result<(), EmbedError> {
    let health = format!("{url}/health");
    let mut delay = initial;
    for attempt in 1..=attempts {
        match client.get(&health).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => debug!(attempt, status = %resp.status(), "Hub not ready"),
            Err(e) => debug!(attempt, error = %e, "Hub not ready"),
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(READY_MAX_BACKOFF);
        }
    }
    Err(EmbedError::NotReady {
        url: url.to_string(),
        attempts,
    })
}
