//! Test support: scratch git repositories and a launcher that serves a fake
//! control endpoint in-process instead of starting real agent binaries.
//!
//! Enabled for this crate's own tests and, through the `test-utils`
//! feature, for downstream integration tests.

use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use hive_core::Config;
use hive_core::config::SpawnerConfig;

use crate::agent::{Binaries, LaunchPlan, ProcessLauncher, SpawnError};

/// Initialise a git repository on `main` with one empty commit.
pub fn init_repo(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    run_git(path, &["-c", "init.defaultBranch=main", "init", "-q"])?;
    run_git(path, &["config", "user.email", "hive@example.com"])?;
    run_git(path, &["config", "user.name", "Hive Test"])?;
    run_git(path, &["config", "commit.gpgsign", "false"])?;
    run_git(path, &["commit", "-q", "--allow-empty", "-m", "init"])?;
    Ok(())
}

/// Config for a hub rooted in the scratch directory `root`.
///
/// Creates `root/repo` as a fresh repository; worktrees, state and the agent
/// cache all live under `root`. Control ports start at `base_port`, so tests
/// running in parallel should each pick their own range.
pub fn scratch_config(root: &Path, base_port: u16) -> std::io::Result<Config> {
    let repo = root.join("repo");
    init_repo(&repo)?;

    let mut config = Config::default();
    config.hub.repo_path = Some(repo);
    config.hub.state_path = Some(root.join("hub-state.json"));
    config.hub.cache_path = Some(root.join("agents.json"));
    config.hub.drain_timeout_secs = 1;
    config.worktree.root = root.join("worktrees");
    config.spawner.base_port = base_port;
    config.spawner.port_range = 20;
    config.spawner.spawn_timeout_secs = 3;
    config.spawner.health_poll_interval_ms = 25;
    config.spawner.health_probe_timeout_ms = 500;
    config.spawner.request_timeout_secs = 5;
    config.spawner.stop_grace_secs = 1;
    Ok(config)
}

fn run_git(repo: &Path, args: &[&str]) -> std::io::Result<()> {
    let output = Command::new("git").args(args).current_dir(repo).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// How the fake agents behave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockBehavior {
    /// Serve a healthy control endpoint on the allocated port.
    #[default]
    Healthy,
    /// Launch "succeeds" but nothing ever listens.
    NeverReady,
    /// The launch itself fails.
    FailLaunch,
    /// Binary resolution fails.
    MissingBinary,
}

/// [`ProcessLauncher`] that runs a fake agentapi inside the test runtime.
///
/// The fake answers `GET /status` with `stable`, records `POST /message`
/// bodies as user messages followed by an agent echo, and returns them from
/// `GET /messages`.
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    behavior: MockBehavior,
    launches: Arc<Mutex<Vec<LaunchPlan>>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    /// Plans passed to `launch`, in call order.
    pub fn launches(&self) -> Vec<LaunchPlan> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProcessLauncher for MockLauncher {
    fn resolve(&self, config: &SpawnerConfig, sandbox: bool) -> Result<Binaries, SpawnError> {
        if self.behavior == MockBehavior::MissingBinary {
            return Err(SpawnError::BinaryNotFound {
                binary: config.agentapi_bin.display().to_string(),
                hint: "mock launcher configured without binaries".to_string(),
            });
        }
        Ok(Binaries {
            agentapi: config.agentapi_bin.clone(),
            claude: config.claude_bin.clone(),
            sandbox: sandbox.then(|| config.sandbox_bin.clone()),
        })
    }

    fn launch(&self, plan: &LaunchPlan) -> Result<Option<u32>, SpawnError> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(plan.clone());

        match self.behavior {
            MockBehavior::FailLaunch => Err(SpawnError::SpawnFailed {
                agent: plan.agent_name.clone(),
                reason: "mock launch failure".to_string(),
            }),
            MockBehavior::NeverReady | MockBehavior::MissingBinary => Ok(None),
            MockBehavior::Healthy => {
                serve_fake_agent(plan.port).map_err(|e| SpawnError::SpawnFailed {
                    agent: plan.agent_name.clone(),
                    reason: e.to_string(),
                })?;
                Ok(None)
            }
        }
    }
}

type Conversation = Arc<Mutex<Vec<Value>>>;

#[derive(Deserialize)]
struct PostMessage {
    content: String,
}

fn serve_fake_agent(port: u16) -> std::io::Result<()> {
    let std_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;

    let conversation: Conversation = Arc::default();
    let app = Router::new()
        .route("/status", get(|| async { Json(json!({"status": "stable"})) }))
        .route("/message", post(post_message))
        .route("/messages", get(list_messages))
        .with_state(conversation);

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(())
}

async fn post_message(State(conv): State<Conversation>, Json(body): Json<PostMessage>) -> Json<Value> {
    let mut messages = conv.lock().unwrap_or_else(PoisonError::into_inner);
    let next = messages.len();
    messages.push(json!({"id": next, "role": "user", "content": body.content, "time": "2025-01-01T00:00:00Z"}));
    messages.push(json!({"id": next + 1, "role": "agent", "content": format!("echo: {}", body.content), "time": "2025-01-01T00:00:01Z"}));
    Json(json!({"ok": true}))
}

async fn list_messages(State(conv): State<Conversation>) -> Json<Value> {
    let messages = conv.lock().unwrap_or_else(PoisonError::into_inner).clone();
    Json(json!({ "messages": messages }))
}
