//! The hub: one explicit state struct owning every manager.
//!
//! Operations that touch more than one manager (destroying an agent cancels
//! its tasks, creating a task resolves its agent) live here so that no
//! manager ever takes another manager's lock.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use hive_core::cache::AgentCache;
use hive_core::{Agent, AgentStatus, Config, ErrorKind, Message, unix_timestamp};

use crate::agent::{
    AgentClient, AgentError, AgentManager, AgentSpawner, ClientError, OsLauncher,
    ProcessLauncher, SpawnOptions, process,
};
use crate::events::EventBus;
use crate::port::{CONTROL_SERVICE, PortError, PortLease, PortRegistry};
use crate::server::{self, AppState};
use crate::solicitation::{
    CreateSolicitationRequest, Solicitation, SolicitationError, SolicitationManager,
};
use crate::state::{PersistentState, StateError};
use crate::task::{Assignee, CreateTaskRequest, Task, TaskError, TaskManager, TaskStatus};
use crate::worktree::WorktreeManager;

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Solicitation(#[from] SolicitationError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] hive_core::Error),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Agent(e) => e.kind(),
            Self::Task(e) => e.kind(),
            Self::Solicitation(e) => e.kind(),
            Self::Port(e) => e.kind(),
            Self::State(e) => e.kind(),
            Self::Client(e) => e.kind(),
            Self::Config(_) => ErrorKind::Validation,
            Self::Io(_) => ErrorKind::Fatal,
        }
    }
}

/// Counts reported by `GET /status` and the `get_status` tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub agents_total: usize,
    pub agents_running: usize,
    pub tasks_total: usize,
    pub tasks_in_progress: usize,
    pub solicitations_pending: usize,
    pub ports_leased: usize,
}

/// What [`Hub::reconcile`] found in the saved state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub agents_recovered: usize,
    pub agents_dropped: usize,
    pub tasks_restored: usize,
    pub solicitations_restored: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Start,
    Complete,
    Fail,
    Cancel,
}

/// Body of `PATCH /tasks/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskUpdate {
    pub action: TaskAction,
    /// Agent ID or name to assign on `start`.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskUpdate {
    pub const fn new(action: TaskAction) -> Self {
        Self {
            action,
            agent_id: None,
            result: None,
            error: None,
        }
    }
}

pub struct Hub {
    config: Config,
    events: EventBus,
    ports: Arc<PortRegistry>,
    agents: AgentManager,
    tasks: TaskManager,
    solicitations: SolicitationManager,
    cache: Option<AgentCache>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("listen_addr", &self.config.hub.listen_addr)
            .field("repo", &self.config.hub.repo_path)
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Build a hub that launches real agent processes.
    pub fn new(config: Config) -> Result<Self, HubError> {
        Self::with_launcher(config, Arc::new(OsLauncher))
    }

    pub fn with_launcher(
        config: Config,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self, HubError> {
        config.validate()?;

        let events = EventBus::new(config.hub.event_capacity);
        let ports = Arc::new(PortRegistry::new(
            config.spawner.base_port,
            config.spawner.port_range,
            events.clone(),
        ));
        let spawner = AgentSpawner::new(
            config.spawner.clone(),
            config.hub.public_url(),
            WorktreeManager::new(&config.worktree),
            Arc::clone(&ports),
            AgentClient::from_config(&config.spawner)?,
            launcher,
        );
        let agents = AgentManager::new(
            spawner,
            config.hub.repo_path.clone(),
            config.worktree.delete_branch_on_destroy,
            events.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            cache: config.hub.cache_path.clone().map(AgentCache::new),
            tasks: TaskManager::new(events.clone()),
            solicitations: SolicitationManager::new(events.clone()),
            config,
            events,
            ports,
            agents,
            shutdown,
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub const fn agents(&self) -> &AgentManager {
        &self.agents
    }

    pub const fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub const fn solicitations(&self) -> &SolicitationManager {
        &self.solicitations
    }

    /// Flips to `true` once [`Hub::stop`] is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Load the saved state and keep whatever survived the restart.
    ///
    /// An agent is recovered only if its process is still alive and its
    /// control endpoint answers; its control port is reserved again.
    pub async fn reconcile(&self) -> Result<ReconcileReport, HubError> {
        let mut report = ReconcileReport::default();
        let Some(path) = self.config.hub.effective_state_path() else {
            return Ok(report);
        };
        let Some(state) = PersistentState::load(&path).await? else {
            return Ok(report);
        };
        info!(path = %path.display(), saved_at = state.saved_at, "Reconciling saved hub state");

        let client = self.agents.spawner().client();
        let mut recovered = Vec::new();
        for agent in state.agents {
            let alive = agent.pid.is_none_or(process::is_alive);
            if !(alive && client.health(agent.port).await) {
                warn!(agent = %agent.name, port = agent.port, pid = ?agent.pid, "Agent did not survive restart, dropping");
                let delete_branch = self.config.worktree.delete_branch_on_destroy;
                if let Some(repo) = self.agents.repo()
                    && let Err(e) = self
                        .agents
                        .spawner()
                        .remove_worktree(repo, &agent, delete_branch)
                        .await
                {
                    warn!(agent = %agent.name, error = %e, "Failed to remove dropped agent's worktree");
                }
                report.agents_dropped += 1;
                continue;
            }
            self.ports
                .reserve(PortLease {
                    port: agent.port,
                    agent_id: agent.id.clone(),
                    agent_name: agent.name.clone(),
                    service: CONTROL_SERVICE.to_string(),
                    pid: agent.pid,
                    leased_at: unix_timestamp(),
                })
                .await;
            let id = agent.id.clone();
            match self.agents.register(agent).await {
                Ok(()) => {
                    recovered.push(id);
                    report.agents_recovered += 1;
                }
                Err(e) => warn!(error = %e, "Failed to re-register agent"),
            }
        }

        for lease in state.ports {
            if lease.service != CONTROL_SERVICE && recovered.contains(&lease.agent_id) {
                self.ports.reserve(lease).await;
            }
        }

        report.tasks_restored = state.tasks.len();
        self.tasks.restore(state.tasks).await;
        report.solicitations_restored = state.solicitations.len();
        self.solicitations.restore(state.solicitations).await;

        info!(?report, "Reconciliation complete");
        self.refresh_cache().await;
        Ok(report)
    }

    /// Serve the REST/SSE API on `listener` until [`Hub::stop`] is called.
    ///
    /// After the stop request, in-flight requests get `drain_timeout_secs`
    /// to finish before the remaining connections are dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), HubError> {
        let addr = listener.local_addr()?;
        self.agents.spawner().set_hub_url(hub_url(addr)).await;

        let router = server::build_router(AppState::new(Arc::clone(&self)));
        let mut graceful = self.shutdown.subscribe();
        let mut deadline = self.shutdown.subscribe();
        let drain = self.config.hub.drain_timeout();

        info!(%addr, "Hub listening");
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = graceful.wait_for(|stop| *stop).await;
            })
            .into_future();

        tokio::select! {
            result = serve => result?,
            () = drain_deadline(&mut deadline, drain) => {
                warn!(timeout_secs = drain.as_secs(), "Drain timeout elapsed, dropping open connections");
            }
        }
        info!("Hub server stopped");
        Ok(())
    }

    /// Request shutdown, optionally stop the agents, and save state.
    /// Calling it again is a no-op.
    pub async fn stop(&self) -> Result<(), HubError> {
        if self.shutdown.send_replace(true) {
            return Ok(());
        }
        info!("Stopping hub");
        if self.config.hub.stop_agents_on_shutdown {
            let stopped = self.agents.stop_all().await;
            info!(stopped, "Stopped agents on shutdown");
        }
        self.save_state().await?;
        self.refresh_cache().await;
        Ok(())
    }

    /// Write the snapshot that [`Hub::reconcile`] reads.
    pub async fn save_state(&self) -> Result<(), HubError> {
        let Some(path) = self.config.hub.effective_state_path() else {
            debug!("No state path configured, skipping save");
            return Ok(());
        };
        let agents = self
            .agents
            .list()
            .await
            .into_iter()
            .filter(|a| a.is_running() && a.status != AgentStatus::Spawning)
            .collect();
        PersistentState::new(
            agents,
            self.tasks.list(None, None).await,
            self.solicitations.list_open().await,
            self.ports.leases().await,
        )
        .save(&path)
        .await?;
        Ok(())
    }

    pub async fn status(&self) -> StatusInfo {
        StatusInfo {
            agents_total: self.agents.list().await.len(),
            agents_running: self.agents.running_count().await,
            tasks_total: self.tasks.len().await,
            tasks_in_progress: self.tasks.count_by_status(TaskStatus::InProgress).await,
            solicitations_pending: self.solicitations.open_count().await,
            ports_leased: self.ports.leased_count().await,
        }
    }

    // Agents

    pub async fn spawn_agent(&self, opts: SpawnOptions) -> Result<Agent, HubError> {
        let agent = self.agents.spawn(opts).await?;
        self.refresh_cache().await;
        Ok(agent)
    }

    /// All agents, each running one re-probed first. A failed probe only
    /// affects that agent's entry.
    pub async fn list_agents(&self) -> Vec<Agent> {
        for agent in self.agents.list().await {
            if agent.is_running()
                && let Err(e) = self.agents.refresh_status(&agent.id).await
            {
                debug!(agent = %agent.name, error = %e, "Status refresh failed");
            }
        }
        self.agents.list().await
    }

    pub async fn get_agent(&self, id_or_name: &str) -> Result<Agent, HubError> {
        Ok(self.agents.get(id_or_name).await?)
    }

    pub async fn agent_status(&self, id_or_name: &str) -> Result<Agent, HubError> {
        Ok(self.agents.refresh_status(id_or_name).await?)
    }

    pub async fn message_agent(&self, id_or_name: &str, content: &str) -> Result<(), HubError> {
        Ok(self.agents.send_message(id_or_name, content).await?)
    }

    pub async fn conversation(&self, id_or_name: &str) -> Result<Vec<Message>, HubError> {
        Ok(self.agents.conversation(id_or_name).await?)
    }

    pub async fn stop_agent(&self, id_or_name: &str) -> Result<Agent, HubError> {
        let agent = self.agents.stop(id_or_name).await?;
        self.refresh_cache().await;
        Ok(agent)
    }

    /// Destroy the agent, then cancel its unfinished tasks and dismiss its
    /// open solicitations.
    pub async fn destroy_agent(&self, id_or_name: &str) -> Result<Agent, HubError> {
        let agent = self.agents.destroy(id_or_name).await?;
        let reason = format!("agent {} destroyed", agent.name);
        let cancelled = self.tasks.cancel_all_for_agent(&agent.id, &reason).await;
        let dismissed = self
            .solicitations
            .dismiss_all_for_agent(&agent.id, &reason)
            .await;
        if cancelled + dismissed > 0 {
            info!(agent = %agent.name, cancelled, dismissed, "Closed work left by destroyed agent");
        }
        self.refresh_cache().await;
        Ok(agent)
    }

    // Tasks

    /// Create a task. A given agent (ID or name) must exist; the stored
    /// assignment always carries the canonical ID and the name.
    pub async fn create_task(&self, mut req: CreateTaskRequest) -> Result<Task, HubError> {
        if let Some(wanted) = req.agent_id.as_deref().filter(|a| !a.is_empty()) {
            let agent = self.agents.get(wanted).await?;
            req.agent_id = Some(agent.id);
            req.agent_name = Some(agent.name);
        } else {
            req.agent_id = None;
        }
        Ok(self.tasks.create(req).await?)
    }

    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<Task, HubError> {
        let task = match update.action {
            TaskAction::Start => {
                let assignee = match update.agent_id.as_deref().filter(|a| !a.is_empty()) {
                    Some(wanted) => {
                        let agent = self.agents.get(wanted).await?;
                        Some(Assignee {
                            agent_id: agent.id,
                            agent_name: agent.name,
                        })
                    }
                    None => None,
                };
                self.tasks.start(id, assignee).await?
            }
            TaskAction::Complete => self.tasks.complete(id, update.result).await?,
            TaskAction::Fail => {
                let error = update
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "no reason given".to_string());
                self.tasks.fail(id, error).await?
            }
            TaskAction::Cancel => self.tasks.cancel(id, update.error.or(update.result)).await?,
        };
        Ok(task)
    }

    // Solicitations

    /// Raise a solicitation. With `wait`, block until it is answered,
    /// dismissed, or `timeout` (if any) elapses.
    pub async fn solicit(
        &self,
        mut req: CreateSolicitationRequest,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<Solicitation, HubError> {
        if let Ok(agent) = self.agents.get(&req.agent_id).await {
            req.agent_id = agent.id;
            if req.agent_name.is_empty() {
                req.agent_name = agent.name;
            }
        }
        let sol = if wait {
            self.solicitations.create_and_wait(req, timeout).await?
        } else {
            self.solicitations.create(req).await?
        };
        Ok(sol)
    }

    async fn refresh_cache(&self) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let agents = self.agents.list().await;
        match tokio::task::spawn_blocking(move || cache.save(&agents)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to write agent cache"),
            Err(e) => warn!(error = %e, "Agent cache writer panicked"),
        }
    }
}

async fn drain_deadline(stop: &mut watch::Receiver<bool>, drain: Duration) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(drain).await;
}

/// URL agents use to reach a hub bound at `addr`.
pub fn hub_url(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("http://127.0.0.1:{}", addr.port())
    } else {
        format!("http://{addr}")
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
#[path = "hub_tests.rs"]
mod tests;
