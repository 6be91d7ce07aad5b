//! Agent registry and lifecycle operations.
//!
//! The map lock is held only while reading or writing entries, never across
//! a spawn, a git call or an HTTP request to an agent.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use hive_core::{Agent, AgentStatus, ErrorKind, Message, short_id, unix_timestamp};

use super::client::ClientError;
use super::process;
use super::spawner::{AgentSpawner, SpawnError, SpawnOptions};
use crate::events::{EventBus, EventKind};
use crate::worktree::{WorktreeError, validate_name};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent name already in use: {name}")]
    Duplicate { name: String },

    #[error("Agent not found: {id}")]
    NotFound { id: String },

    #[error("Agent {id} is not running (status: {status})")]
    NotRunning { id: String, status: AgentStatus },

    #[error("Agent {name} is still spawning")]
    StillSpawning { name: String },

    #[error("No repository configured for spawning agents")]
    NoRepo,

    #[error("Message content is empty")]
    EmptyMessage,

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),
}

impl AgentError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Duplicate { .. } | Self::NotRunning { .. } | Self::StillSpawning { .. } => {
                ErrorKind::Conflict
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NoRepo | Self::EmptyMessage => ErrorKind::Validation,
            Self::Spawn(e) => e.kind(),
            Self::Client(e) => e.kind(),
            Self::Worktree(e) => e.kind(),
        }
    }
}

#[derive(Debug)]
pub struct AgentManager {
    agents: RwLock<HashMap<String, Agent>>,
    spawner: AgentSpawner,
    repo: Option<PathBuf>,
    delete_branch_on_destroy: bool,
    events: EventBus,
}

impl AgentManager {
    pub fn new(
        spawner: AgentSpawner,
        repo: Option<PathBuf>,
        delete_branch_on_destroy: bool,
        events: EventBus,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            spawner,
            repo,
            delete_branch_on_destroy,
            events,
        }
    }

    pub const fn spawner(&self) -> &AgentSpawner {
        &self.spawner
    }

    pub fn repo(&self) -> Option<&std::path::Path> {
        self.repo.as_deref()
    }

    /// Spawn a new agent. The name is claimed before any filesystem work, so
    /// a concurrent spawn with the same name fails fast.
    pub async fn spawn(&self, opts: SpawnOptions) -> Result<Agent, AgentError> {
        let repo = self.repo.clone().ok_or(AgentError::NoRepo)?;
        validate_name(&opts.name).map_err(SpawnError::from)?;

        let id = short_id();
        {
            let mut agents = self.agents.write().await;
            if agents.values().any(|a| a.name == opts.name) {
                return Err(AgentError::Duplicate {
                    name: opts.name.clone(),
                });
            }
            agents.insert(id.clone(), placeholder(&id, &opts));
        }
        info!(agent = %opts.name, id = %id, "Spawning agent");

        match self.spawner.spawn(&id, &repo, &opts).await {
            Ok(agent) => {
                self.agents.write().await.insert(id, agent.clone());
                self.events.publish(EventKind::AgentSpawned, &agent);
                Ok(agent)
            }
            Err(e) => {
                self.agents.write().await.remove(&id);
                Err(e.into())
            }
        }
    }

    /// Look an agent up by ID, falling back to its name.
    pub async fn get(&self, id_or_name: &str) -> Result<Agent, AgentError> {
        let agents = self.agents.read().await;
        agents
            .get(id_or_name)
            .or_else(|| agents.values().find(|a| a.name == id_or_name))
            .cloned()
            .ok_or_else(|| AgentError::NotFound {
                id: id_or_name.to_string(),
            })
    }

    /// All agents, oldest first.
    pub async fn list(&self) -> Vec<Agent> {
        let mut out: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        out
    }

    pub async fn running_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.is_running())
            .count()
    }

    /// Probe the agent's control endpoint and record what it reports.
    ///
    /// An agent that does not answer and whose process is gone becomes
    /// Failed. One that does not answer but is still alive keeps its status.
    pub async fn refresh_status(&self, id_or_name: &str) -> Result<Agent, AgentError> {
        let agent = self.get(id_or_name).await?;
        if !agent.is_running() || agent.status == AgentStatus::Spawning {
            return Ok(agent);
        }

        let (status, error) = match self.spawner.client().status(agent.port).await {
            Ok(status) => (status, None),
            Err(e) => {
                let dead = agent.pid.is_none_or(|pid| !process::is_alive(pid));
                if dead {
                    (AgentStatus::Failed, Some(format!("control endpoint unreachable: {e}")))
                } else {
                    warn!(agent = %agent.name, error = %e, "Status probe failed, process still alive");
                    return Ok(agent);
                }
            }
        };

        if status == agent.status {
            return Ok(agent);
        }
        let updated = self
            .update(&agent.id, |a| {
                a.status = status;
                if error.is_some() {
                    a.error.clone_from(&error);
                    a.pid = None;
                }
            })
            .await?;
        info!(agent = %updated.name, from = %agent.status, to = %status, "Agent status changed");
        self.events.publish(
            EventKind::AgentStatus,
            json!({"id": updated.id, "name": updated.name, "from": agent.status, "to": status}),
        );
        Ok(updated)
    }

    pub async fn send_message(&self, id_or_name: &str, content: &str) -> Result<(), AgentError> {
        if content.trim().is_empty() {
            return Err(AgentError::EmptyMessage);
        }
        let agent = self.running(id_or_name).await?;
        self.spawner
            .client()
            .send_message(agent.port, content)
            .await?;
        info!(agent = %agent.name, len = content.len(), "Message sent");
        self.events.publish(
            EventKind::MessageSent,
            json!({"agent_id": agent.id, "agent_name": agent.name, "content": content}),
        );
        Ok(())
    }

    pub async fn conversation(&self, id_or_name: &str) -> Result<Vec<Message>, AgentError> {
        let agent = self.running(id_or_name).await?;
        Ok(self.spawner.client().messages(agent.port).await?)
    }

    /// Terminate the agent's process. Stopping a stopped agent is a no-op.
    pub async fn stop(&self, id_or_name: &str) -> Result<Agent, AgentError> {
        let agent = self.get(id_or_name).await?;
        if agent.status == AgentStatus::Spawning {
            return Err(AgentError::StillSpawning { name: agent.name });
        }
        if !agent.is_running() {
            return Ok(agent);
        }
        self.spawner.stop(&agent).await;
        let stopped = self
            .update(&agent.id, |a| {
                a.status = AgentStatus::Stopped;
                a.pid = None;
            })
            .await?;
        info!(agent = %stopped.name, "Agent stopped");
        self.events.publish(EventKind::AgentStopped, &stopped);
        Ok(stopped)
    }

    /// Stop the agent, remove its worktree and branch, and forget it.
    pub async fn destroy(&self, id_or_name: &str) -> Result<Agent, AgentError> {
        let agent = self.stop(id_or_name).await?;
        // Ports may still be held by a Failed agent that was never stopped.
        self.spawner.stop(&Agent { pid: None, ..agent.clone() }).await;

        if let Some(repo) = &self.repo {
            self.spawner
                .remove_worktree(repo, &agent, self.delete_branch_on_destroy)
                .await?;
        } else {
            warn!(agent = %agent.name, "No repository configured, leaving worktree in place");
        }

        self.agents.write().await.remove(&agent.id);
        info!(agent = %agent.name, "Agent destroyed");
        self.events.publish(EventKind::AgentDestroyed, &agent);
        Ok(agent)
    }

    /// Stop every running agent, returning how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let running: Vec<String> = self
            .list()
            .await
            .into_iter()
            .filter(Agent::is_running)
            .map(|a| a.id)
            .collect();
        let mut stopped = 0;
        for id in running {
            match self.stop(&id).await {
                Ok(_) => stopped += 1,
                Err(e) => warn!(agent = %id, error = %e, "Failed to stop agent"),
            }
        }
        stopped
    }

    /// Track an agent that is already running, e.g. after a hub restart.
    pub async fn register(&self, agent: Agent) -> Result<(), AgentError> {
        let mut agents = self.agents.write().await;
        if agents
            .values()
            .any(|a| a.name == agent.name && a.id != agent.id)
        {
            return Err(AgentError::Duplicate { name: agent.name });
        }
        info!(agent = %agent.name, id = %agent.id, port = agent.port, "Registered agent");
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn running(&self, id_or_name: &str) -> Result<Agent, AgentError> {
        let agent = self.get(id_or_name).await?;
        if matches!(agent.status, AgentStatus::Ready | AgentStatus::Busy) {
            Ok(agent)
        } else {
            Err(AgentError::NotRunning {
                id: agent.id,
                status: agent.status,
            })
        }
    }

    async fn update<F>(&self, id: &str, apply: F) -> Result<Agent, AgentError>
    where
        F: FnOnce(&mut Agent),
    {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(id).ok_or_else(|| AgentError::NotFound {
            id: id.to_string(),
        })?;
        apply(agent);
        Ok(agent.clone())
    }
}

/// Entry holding the name while the spawn is in flight.
fn placeholder(id: &str, opts: &SpawnOptions) -> Agent {
    Agent {
        id: id.to_string(),
        name: opts.name.clone(),
        branch: opts.branch.clone().unwrap_or_default(),
        base_branch: opts.base_branch.clone().unwrap_or_default(),
        worktree_path: PathBuf::new(),
        port: 0,
        pid: None,
        status: AgentStatus::Spawning,
        specialty: opts.specialty.clone(),
        model: opts.model.clone(),
        sandbox: opts.sandbox.unwrap_or(false),
        created_at: unix_timestamp(),
        error: None,
    }
}
