//! Records shared by the hub, the MCP adapter and the agent cache.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current Unix timestamp in seconds.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Short identifier: the first 8 hex characters of a v4 UUID.
pub fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Lifecycle state of a drone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Worktree/process setup in progress, control endpoint not yet healthy.
    Spawning,
    /// Control endpoint healthy and idle.
    Ready,
    /// Control endpoint healthy and processing a message.
    Busy,
    /// Process terminated on request.
    Stopped,
    /// Process died or never became healthy.
    Failed,
}

impl AgentStatus {
    /// Whether the process is expected to be alive.
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Spawning | Self::Ready | Self::Busy)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A spawned, worktree-isolated coding agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// Unique among agents that have not been destroyed.
    pub name: String,
    pub branch: String,
    #[serde(default)]
    pub base_branch: String,
    pub worktree_path: PathBuf,
    /// Control port of the HTTP shim.
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub sandbox: bool,
    pub created_at: i64,
    /// Last failure reported for this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Agent {
    pub const fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Base URL of the agent's control endpoint.
    pub fn control_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// One conversation entry as reported by the agent's control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, alias = "time")]
    pub timestamp: String,
}
