//! Hub state snapshot written on shutdown and read back on start.
//!
//! Best effort only: the hub is authoritative while it runs, and a missing
//! or unreadable snapshot just means starting empty.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use hive_core::{Agent, ErrorKind, unix_timestamp};

use crate::port::PortLease;
use crate::solicitation::Solicitation;
use crate::task::Task;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State file I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed state file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported state version {found} (expected {STATE_VERSION})")]
    Version { found: u32 },
}

impl StateError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Transient,
            Self::Json { .. } | Self::Version { .. } => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub version: u32,
    pub saved_at: i64,
    /// Agents that were running when the hub stopped.
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Open solicitations only.
    #[serde(default)]
    pub solicitations: Vec<Solicitation>,
    #[serde(default)]
    pub ports: Vec<PortLease>,
}

impl PersistentState {
    pub fn new(
        agents: Vec<Agent>,
        tasks: Vec<Task>,
        solicitations: Vec<Solicitation>,
        ports: Vec<PortLease>,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: unix_timestamp(),
            agents,
            tasks,
            solicitations,
            ports,
        }
    }

    /// Write the snapshot atomically (temp file + rename).
    pub async fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(self).map_err(|source| StateError::Json {
            path: path.display().to_string(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        info!(
            path = %path.display(),
            agents = self.agents.len(),
            tasks = self.tasks.len(),
            solicitations = self.solicitations.len(),
            "Saved hub state"
        );
        Ok(())
    }

    /// Read a snapshot. `Ok(None)` when the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>, StateError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No saved hub state");
                return Ok(None);
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        let state: Self = serde_json::from_slice(&data).map_err(|source| StateError::Json {
            path: path.display().to_string(),
            source,
        })?;
        if state.version != STATE_VERSION {
            return Err(StateError::Version {
                found: state.version,
            });
        }
        Ok(Some(state))
    }
}
