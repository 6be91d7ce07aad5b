//! HTTP client for an agent's control shim.
//!
//! The shim listens on loopback and exposes `GET /status`, `POST /message`
//! and `GET /messages`. Every call carries its own timeout.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use hive_core::config::SpawnerConfig;
use hive_core::{AgentStatus, ErrorKind, Message};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Agent API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected agent status: {0}")]
    UnknownStatus(String),
}

impl ClientError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(_) | Self::Api { .. } | Self::UnknownStatus(_) => ErrorKind::Transient,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct MessagesBody {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl AgentClient {
    pub fn new(request_timeout: Duration, probe_timeout: Duration) -> Result<Self, ClientError> {
        // reqwest is built with rustls-no-provider; Err only means a provider
        // was installed already.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            http,
            request_timeout,
            probe_timeout,
        })
    }

    pub fn from_config(config: &SpawnerConfig) -> Result<Self, ClientError> {
        Self::new(config.request_timeout(), config.health_probe_timeout())
    }

    pub(crate) fn url(port: u16, path: &str) -> String {
        format!("http://127.0.0.1:{port}{path}")
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            body.trim().to_string()
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Liveness probe. Any failure, including a timeout, is reported as
    /// `false` so one bad probe never fails a listing.
    pub async fn health(&self, port: u16) -> bool {
        let resp = self
            .http
            .get(Self::url(port, "/status"))
            .timeout(self.probe_timeout)
            .send()
            .await;
        matches!(resp, Ok(r) if r.status().is_success())
    }

    /// Current activity: `stable` maps to Ready and `running` to Busy.
    pub async fn status(&self, port: u16) -> Result<AgentStatus, ClientError> {
        let resp = self
            .http
            .get(Self::url(port, "/status"))
            .timeout(self.probe_timeout)
            .send()
            .await?;
        let body: StatusBody = Self::check_status(resp).await?.json().await?;
        match body.status.as_str() {
            "stable" => Ok(AgentStatus::Ready),
            "running" => Ok(AgentStatus::Busy),
            other => Err(ClientError::UnknownStatus(other.to_string())),
        }
    }

    /// Post a user message into the agent's conversation.
    pub async fn send_message(&self, port: u16, content: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(Self::url(port, "/message"))
            .timeout(self.request_timeout)
            .json(&json!({ "content": content, "type": "user" }))
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    pub async fn messages(&self, port: u16) -> Result<Vec<Message>, ClientError> {
        let resp = self
            .http
            .get(Self::url(port, "/messages"))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let body: MessagesBody = Self::check_status(resp).await?.json().await?;
        Ok(body.messages)
    }
}
