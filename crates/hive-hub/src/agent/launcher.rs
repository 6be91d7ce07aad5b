//! Starting the agent process chain.
//!
//! [`ProcessLauncher`] is the seam between the spawner's bookkeeping and the
//! OS. [`OsLauncher`] runs the real binaries; tests swap in a launcher that
//! serves a fake control endpoint in-process.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use hive_core::config::SpawnerConfig;

use super::spawner::SpawnError;

/// Resolved executables for one spawn.
#[derive(Debug, Clone)]
pub struct Binaries {
    pub agentapi: PathBuf,
    pub claude: PathBuf,
    /// Present only when the spawn is sandboxed.
    pub sandbox: Option<PathBuf>,
}

/// Everything needed to start one agent.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub agent_name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Complete environment; nothing is inherited from the hub.
    pub env: Vec<(String, String)>,
    pub port: u16,
    /// Receives the chain's stdout and stderr.
    pub log_path: PathBuf,
}

pub trait ProcessLauncher: Send + Sync + std::fmt::Debug {
    /// Locate the binaries a spawn needs, failing fast when one is missing.
    fn resolve(&self, config: &SpawnerConfig, sandbox: bool) -> Result<Binaries, SpawnError> {
        resolve_binaries(config, sandbox)
    }

    /// Start the chain detached from the caller. Returns the PID, if any.
    fn launch(&self, plan: &LaunchPlan) -> Result<Option<u32>, SpawnError>;
}

/// Launches real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn launch(&self, plan: &LaunchPlan) -> Result<Option<u32>, SpawnError> {
        let failed = |reason: String| SpawnError::SpawnFailed {
            agent: plan.agent_name.clone(),
            reason,
        };

        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&plan.log_path)
            .map_err(|e| failed(format!("open {}: {e}", plan.log_path.display())))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| failed(format!("clone log handle: {e}")))?;

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(&plan.cwd)
            .env_clear()
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        // Own process group, so stop can signal the shim and the agent together.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            agent = %plan.agent_name,
            program = %plan.program.display(),
            port = plan.port,
            cwd = %plan.cwd.display(),
            "Launching agent process"
        );
        let mut child = cmd.spawn().map_err(|e| failed(e.to_string()))?;
        let pid = child.id();

        // Reap the child when it exits; liveness is tracked by PID elsewhere.
        let agent = plan.agent_name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(agent = %agent, %status, "Agent process exited"),
                Err(e) => warn!(agent = %agent, error = %e, "Failed to wait on agent process"),
            }
        });

        Ok(pid)
    }
}

/// Look up the shim, the agent binary and, if asked, the sandbox wrapper.
pub fn resolve_binaries(config: &SpawnerConfig, sandbox: bool) -> Result<Binaries, SpawnError> {
    let go_bin = dirs::home_dir().map(|h| h.join("go/bin/agentapi"));
    let agentapi = find_binary(&config.agentapi_bin, go_bin.as_deref()).ok_or_else(|| {
        SpawnError::BinaryNotFound {
            binary: config.agentapi_bin.display().to_string(),
            hint: "install it with `go install github.com/coder/agentapi@latest` \
                   or set spawner.agentapi_bin"
                .to_string(),
        }
    })?;
    let claude = find_binary(&config.claude_bin, None).ok_or_else(|| SpawnError::BinaryNotFound {
        binary: config.claude_bin.display().to_string(),
        hint: "install it with `npm install -g @anthropic-ai/claude-code` or set spawner.claude_bin"
            .to_string(),
    })?;
    let sandbox = if sandbox {
        Some(
            find_binary(&config.sandbox_bin, None).ok_or_else(|| SpawnError::BinaryNotFound {
                binary: config.sandbox_bin.display().to_string(),
                hint: "install it with `npm install -g @anthropic-ai/sandbox-runtime` \
                       or spawn with sandbox disabled"
                    .to_string(),
            })?,
        )
    } else {
        None
    };
    Ok(Binaries {
        agentapi,
        claude,
        sandbox,
    })
}

fn find_binary(configured: &Path, fallback: Option<&Path>) -> Option<PathBuf> {
    which::which(configured)
        .ok()
        .or_else(|| fallback.filter(|p| p.is_file()).map(Path::to_path_buf))
}
