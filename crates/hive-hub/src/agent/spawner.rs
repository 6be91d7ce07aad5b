//! Agent spawner: worktree, control port, process chain, readiness.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hive_core::config::SpawnerConfig;
use hive_core::{Agent, AgentStatus, ErrorKind, unix_timestamp};

use super::client::AgentClient;
use super::launcher::{Binaries, LaunchPlan, ProcessLauncher};
use super::process;
use super::workspace::{self, Briefing, WorkspaceFiles};
use crate::port::{PortError, PortRegistry};
use crate::worktree::{Worktree, WorktreeError, WorktreeManager};

/// Errors from spawning an agent.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("{binary} not found: {hint}")]
    BinaryNotFound { binary: String, hint: String },

    #[error("Failed to prepare workspace for agent {agent}: {source}")]
    Workspace {
        agent: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn agent {agent}: {reason}")]
    SpawnFailed { agent: String, reason: String },

    #[error("Agent {agent} not ready on port {port} after {timeout_secs}s")]
    NotReady {
        agent: String,
        port: u16,
        timeout_secs: u64,
    },
}

impl SpawnError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Worktree(e) => e.kind(),
            Self::Port(e) => e.kind(),
            Self::BinaryNotFound { .. } | Self::Workspace { .. } | Self::SpawnFailed { .. } => {
                ErrorKind::Fatal
            }
            Self::NotReady { .. } => ErrorKind::Transient,
        }
    }
}

/// Caller-supplied spawn parameters. Unset fields fall back to config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpawnOptions {
    pub name: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub sandbox: Option<bool>,
}

impl SpawnOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_base_branch(mut self, base: impl Into<String>) -> Self {
        self.base_branch = Some(base.into());
        self
    }
}

pub struct AgentSpawner {
    config: SpawnerConfig,
    hub_url: RwLock<String>,
    worktrees: WorktreeManager,
    ports: Arc<PortRegistry>,
    client: AgentClient,
    launcher: Arc<dyn ProcessLauncher>,
    #[cfg(feature = "metrics")]
    metrics: hive_core::metrics::HubMetrics,
}

impl std::fmt::Debug for AgentSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSpawner")
            .field("worktree_root", &self.worktrees.root())
            .field("launcher", &self.launcher)
            .finish_non_exhaustive()
    }
}

impl AgentSpawner {
    pub fn new(
        config: SpawnerConfig,
        hub_url: String,
        worktrees: WorktreeManager,
        ports: Arc<PortRegistry>,
        client: AgentClient,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            config,
            hub_url: RwLock::new(hub_url),
            worktrees,
            ports,
            client,
            launcher,
            #[cfg(feature = "metrics")]
            metrics: hive_core::metrics::HubMetrics::new(),
        }
    }

    pub const fn client(&self) -> &AgentClient {
        &self.client
    }

    pub const fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub const fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    /// Point newly spawned agents at the address the hub actually bound.
    pub async fn set_hub_url(&self, url: String) {
        *self.hub_url.write().await = url;
    }

    pub async fn hub_url(&self) -> String {
        self.hub_url.read().await.clone()
    }

    /// Spawn agent `id` and wait until its control endpoint is healthy.
    ///
    /// On any failure after the worktree exists, the process is killed, the
    /// port released and the worktree removed before the error is returned.
    pub async fn spawn(&self, id: &str, repo: &Path, opts: &SpawnOptions) -> Result<Agent, SpawnError> {
        let sandbox = opts.sandbox.unwrap_or(self.config.sandbox);
        let binaries = self.launcher.resolve(&self.config, sandbox)?;

        let wt = self
            .worktrees
            .create(repo, &opts.name, opts.branch.as_deref(), opts.base_branch.as_deref())
            .await?;

        let result = self.launch_in(id, repo, &wt, opts, &binaries, sandbox).await;
        if let Err(e) = &result {
            warn!(agent = %opts.name, error = %e, "Spawn failed, cleaning up");
            #[cfg(feature = "metrics")]
            self.metrics.spawn_failures.add(1, &[]);
            self.ports.release_all_for_agent(id).await;
            let branch = wt.created_branch.then_some(wt.branch.as_str());
            if let Err(cleanup) = self.worktrees.delete(repo, &opts.name, branch).await {
                warn!(agent = %opts.name, error = %cleanup, "Failed to remove worktree after failed spawn");
            }
        }
        result
    }

    async fn launch_in(
        &self,
        id: &str,
        repo: &Path,
        wt: &Worktree,
        opts: &SpawnOptions,
        binaries: &Binaries,
        sandbox: bool,
    ) -> Result<Agent, SpawnError> {
        let name = opts.name.as_str();
        let hub_url = self.hub_url().await;
        let specialty = opts.specialty.as_deref().filter(|s| !s.is_empty());
        let model = opts
            .model
            .clone()
            .or_else(|| self.config.model.clone())
            .filter(|m| !m.is_empty());

        let files = workspace::prepare(
            &wt.path,
            &Briefing {
                agent_id: id,
                agent_name: name,
                branch: &wt.branch,
                base_branch: &wt.base_branch,
                specialty,
                hub_url: &hub_url,
                repo,
            },
            sandbox,
        )
        .await
        .map_err(|source| SpawnError::Workspace {
            agent: name.to_string(),
            source,
        })?;

        let port = self.ports.allocate(id, name).await?;
        let plan = self.plan(id, name, wt, &files, binaries, port, model.as_deref(), specialty, &hub_url);
        let pid = self.launcher.launch(&plan)?;
        if let Some(pid) = pid {
            // Force-releasing the control port then stops the agent too.
            let _ = self.ports.set_pid(port, pid).await;
        }

        if let Err(e) = self.wait_ready(name, port, pid, &files).await {
            if let Some(pid) = pid {
                process::terminate(pid, self.config.stop_grace()).await;
            }
            return Err(e);
        }

        #[cfg(feature = "metrics")]
        self.metrics.agents_spawned.add(1, &[]);
        info!(agent = name, id, port, pid = ?pid, branch = %wt.branch, "Agent ready");

        Ok(Agent {
            id: id.to_string(),
            name: name.to_string(),
            branch: wt.branch.clone(),
            base_branch: wt.base_branch.clone(),
            worktree_path: wt.path.clone(),
            port,
            pid,
            status: AgentStatus::Ready,
            specialty: specialty.map(str::to_string),
            model,
            sandbox,
            created_at: unix_timestamp(),
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn plan(
        &self,
        id: &str,
        name: &str,
        wt: &Worktree,
        files: &WorkspaceFiles,
        binaries: &Binaries,
        port: u16,
        model: Option<&str>,
        specialty: Option<&str>,
        hub_url: &str,
    ) -> LaunchPlan {
        let chain = command_chain(binaries, port, model);
        let (program, args) = match (&binaries.sandbox, &files.sandbox_policy) {
            (Some(srt), Some(policy)) => (
                srt.clone(),
                vec![
                    "-s".to_string(),
                    policy.display().to_string(),
                    "-c".to_string(),
                    chain,
                ],
            ),
            _ => ("/bin/sh".into(), vec!["-c".to_string(), chain]),
        };

        let mut env: Vec<(String, String)> = self
            .config
            .forward_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
            .collect();
        env.extend(self.config.extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend([
            ("HIVE_HUB_URL".to_string(), hub_url.to_string()),
            ("HIVE_AGENT_ID".to_string(), id.to_string()),
            ("HIVE_AGENT_NAME".to_string(), name.to_string()),
            ("HIVE_WORKTREE_PATH".to_string(), wt.path.display().to_string()),
            ("HIVE_COMMANDS_PATH".to_string(), files.commands.display().to_string()),
            ("HIVE_SPECIALTY".to_string(), specialty.unwrap_or_default().to_string()),
        ]);

        LaunchPlan {
            agent_name: name.to_string(),
            program,
            args,
            cwd: wt.path.clone(),
            env,
            port,
            log_path: files.log.clone(),
        }
    }

    async fn wait_ready(
        &self,
        name: &str,
        port: u16,
        pid: Option<u32>,
        files: &WorkspaceFiles,
    ) -> Result<(), SpawnError> {
        let timeout = self.config.spawn_timeout();
        let deadline = Instant::now() + timeout;
        let mut probes = 0u32;
        loop {
            probes += 1;
            if self.client.health(port).await {
                debug!(agent = name, port, probes, "Control endpoint healthy");
                return Ok(());
            }
            if let Some(pid) = pid
                && !process::is_alive(pid)
            {
                return Err(SpawnError::SpawnFailed {
                    agent: name.to_string(),
                    reason: format!(
                        "process exited before becoming ready (see {})",
                        files.log.display()
                    ),
                });
            }
            if Instant::now() >= deadline {
                return Err(SpawnError::NotReady {
                    agent: name.to_string(),
                    port,
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.config.health_poll_interval()).await;
        }
    }

    /// Terminate the agent's process group and release its ports.
    pub async fn stop(&self, agent: &Agent) {
        if let Some(pid) = agent.pid {
            let graceful = process::terminate(pid, self.config.stop_grace()).await;
            info!(agent = %agent.name, pid, graceful, "Agent process stopped");
        }
        let released = self.ports.release_all_for_agent(&agent.id).await;
        debug!(agent = %agent.name, ?released, "Released agent ports");
    }

    /// Remove the agent's worktree and optionally its branch.
    pub async fn remove_worktree(
        &self,
        repo: &Path,
        agent: &Agent,
        delete_branch: bool,
    ) -> Result<(), WorktreeError> {
        self.worktrees
            .delete(repo, &agent.name, delete_branch.then_some(agent.branch.as_str()))
            .await
    }
}

/// `exec <agentapi> server --port P -- <claude> --dangerously-skip-permissions [--model M]`
pub fn command_chain(binaries: &Binaries, port: u16, model: Option<&str>) -> String {
    let mut chain = format!(
        "exec {} server --port {port} -- {} --dangerously-skip-permissions",
        shell_quote(&binaries.agentapi.display().to_string()),
        shell_quote(&binaries.claude.display().to_string()),
    );
    if let Some(model) = model {
        chain.push_str(" --model ");
        chain.push_str(&shell_quote(model));
    }
    chain
}

/// Single-quote `s` for `sh -c`.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn binaries(sandbox: bool) -> Binaries {
        Binaries {
            agentapi: PathBuf::from("/usr/local/bin/agentapi"),
            claude: PathBuf::from("/opt/claude code/claude"),
            sandbox: sandbox.then(|| PathBuf::from("/usr/bin/srt")),
        }
    }

    #[test]
    fn chain_quotes_paths_and_model() {
        let chain = command_chain(&binaries(false), 3284, Some("claude-sonnet-4"));
        assert_eq!(
            chain,
            "exec /usr/local/bin/agentapi server --port 3284 -- '/opt/claude code/claude' \
             --dangerously-skip-permissions --model claude-sonnet-4"
        );
    }

    #[test]
    fn chain_without_model() {
        let chain = command_chain(&binaries(false), 4000, None);
        assert!(chain.ends_with("--dangerously-skip-permissions"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("plain-name_1.0"), "plain-name_1.0");
    }

    #[test]
    fn spawn_options_deserialize_with_defaults() {
        let opts: SpawnOptions = serde_json::from_str(r#"{"name":"drone-1"}"#).unwrap();
        assert_eq!(opts.name, "drone-1");
        assert!(opts.sandbox.is_none());
        assert!(opts.base_branch.is_none());
    }

    #[test]
    fn error_kinds_follow_the_taxonomy() {
        let missing = SpawnError::BinaryNotFound {
            binary: "agentapi".into(),
            hint: "install".into(),
        };
        assert_eq!(missing.kind(), ErrorKind::Fatal);
        let slow = SpawnError::NotReady {
            agent: "d".into(),
            port: 1,
            timeout_secs: 1,
        };
        assert_eq!(slow.kind(), ErrorKind::Transient);
        let bad_name = SpawnError::from(WorktreeError::InvalidName("x".into()));
        assert_eq!(bad_name.kind(), ErrorKind::Validation);
    }
}
