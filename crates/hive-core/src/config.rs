//! Configuration resolution for Hive.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/hive/config.toml`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`HIVE_*`)
//! 5. CLI arguments (highest priority, applied by the binaries)

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete Hive configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hub: HubConfig,
    pub spawner: SpawnerConfig,
    pub worktree: WorktreeConfig,
}

/// Hub server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// REST/SSE listen address.
    pub listen_addr: SocketAddr,
    /// Repository the drones branch from. Required to spawn.
    pub repo_path: Option<PathBuf>,
    /// Where the hub persists its state on shutdown. Defaults to `<repo>/.hive/hub-state.json`.
    pub state_path: Option<PathBuf>,
    /// CLI agent cache, rewritten after every mutating agent call.
    pub cache_path: Option<PathBuf>,
    /// Event bus buffer per subscriber.
    pub event_capacity: usize,
    /// Upper bound on the graceful drain after a stop request.
    pub drain_timeout_secs: u64,
    /// Terminate running drones when the hub shuts down instead of leaving them for reconciliation.
    pub stop_agents_on_shutdown: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            repo_path: None,
            state_path: None,
            cache_path: default_cache_path(),
            event_capacity: 256,
            drain_timeout_secs: 10,
            stop_agents_on_shutdown: false,
        }
    }
}

impl HubConfig {
    /// Set the repository path.
    #[must_use]
    pub fn with_repo_path(mut self, repo: impl Into<PathBuf>) -> Self {
        self.repo_path = Some(repo.into());
        self
    }

    /// Set the listen address.
    #[must_use]
    pub const fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Effective state file: explicit path, else `<repo>/.hive/hub-state.json`.
    pub fn effective_state_path(&self) -> Option<PathBuf> {
        self.state_path.clone().or_else(|| {
            self.repo_path
                .as_ref()
                .map(|repo| repo.join(".hive").join("hub-state.json"))
        })
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// URL drones use to reach the hub.
    pub fn public_url(&self) -> String {
        let addr = self.listen_addr;
        if addr.ip().is_unspecified() {
            format!("http://127.0.0.1:{}", addr.port())
        } else {
            format!("http://{addr}")
        }
    }
}

/// Agent process spawning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// HTTP control shim binary.
    pub agentapi_bin: PathBuf,
    /// Underlying coding agent binary.
    pub claude_bin: PathBuf,
    /// Sandboxing wrapper binary.
    pub sandbox_bin: PathBuf,
    /// Default model passed to the agent binary.
    pub model: Option<String>,
    /// Default sandbox setting for spawns that do not specify one.
    pub sandbox: bool,
    /// First control port.
    pub base_port: u16,
    /// Number of control ports available from `base_port`.
    pub port_range: u16,
    pub spawn_timeout_secs: u64,
    pub health_poll_interval_ms: u64,
    pub health_probe_timeout_ms: u64,
    pub request_timeout_secs: u64,
    /// Grace period after SIGTERM before SIGKILL.
    pub stop_grace_secs: u64,
    /// Variables copied from the hub's own environment into every agent.
    pub forward_env: Vec<String>,
    /// Fixed variables injected into every agent.
    pub extra_env: BTreeMap<String, String>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            agentapi_bin: PathBuf::from("agentapi"),
            claude_bin: PathBuf::from("claude"),
            sandbox_bin: PathBuf::from("srt"),
            model: None,
            sandbox: false,
            base_port: 3284,
            port_range: 100,
            spawn_timeout_secs: 120,
            health_poll_interval_ms: 500,
            health_probe_timeout_ms: 2_000,
            request_timeout_secs: 30,
            stop_grace_secs: 5,
            forward_env: vec![
                "HOME".to_string(),
                "PATH".to_string(),
                "ANTHROPIC_API_KEY".to_string(),
                "USER".to_string(),
                "SHELL".to_string(),
                "TERM".to_string(),
                "LANG".to_string(),
            ],
            extra_env: BTreeMap::new(),
        }
    }
}

impl SpawnerConfig {
    /// Set the first control port.
    #[must_use]
    pub const fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    /// Set the overall spawn timeout.
    #[must_use]
    pub const fn with_spawn_timeout_secs(mut self, secs: u64) -> Self {
        self.spawn_timeout_secs = secs;
        self
    }

    pub const fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub const fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub const fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Last control port (exclusive).
    pub fn port_end(&self) -> u32 {
        u32::from(self.base_port) + u32::from(self.port_range)
    }
}

/// Git worktree layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Directory holding one worktree per agent.
    pub root: PathBuf,
    /// Branches are named `<namespace>/<agent>`.
    pub branch_namespace: String,
    pub delete_branch_on_destroy: bool,
    /// Attempts for the best-effort `git worktree prune`.
    pub prune_attempts: u32,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            root: default_worktree_root(),
            branch_namespace: "hive".to_string(),
            delete_branch_on_destroy: true,
            prune_attempts: 3,
        }
    }
}

impl Config {
    /// Reject settings that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.spawner.port_range == 0 {
            return Err(Error::Config("spawner.port_range must be > 0".into()));
        }
        if self.spawner.port_end() > u32::from(u16::MAX) + 1 {
            return Err(Error::Config(format!(
                "control port range {}..{} exceeds 65535",
                self.spawner.base_port,
                self.spawner.port_end()
            )));
        }
        if self.spawner.spawn_timeout_secs == 0 {
            return Err(Error::Config("spawner.spawn_timeout_secs must be > 0".into()));
        }
        if self.spawner.health_poll_interval_ms == 0 {
            return Err(Error::Config(
                "spawner.health_poll_interval_ms must be > 0".into(),
            ));
        }
        let ns = &self.worktree.branch_namespace;
        if ns.is_empty() || ns.starts_with('-') || ns.contains("..") || ns.contains(' ') {
            return Err(Error::Config(format!(
                "invalid worktree.branch_namespace: {ns:?}"
            )));
        }
        Ok(())
    }
}

/// Default worktree root: `~/hive-worktrees`.
pub fn default_worktree_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hive-worktrees")
}

/// Default CLI agent cache: `~/.hive/agents.json`.
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".hive").join("agents.json"))
}

/// Global config file location.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hive").join("config.toml"))
}

/// Load configuration with hierarchical resolution from the process environment.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global) = global_config_path()
        && global.exists()
    {
        layers.push(global);
    }
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        layers.push(path.to_path_buf());
    }
    load_layers(&layers, |key| std::env::var(key).ok())
}

/// Merge the given TOML files in order, then apply `HIVE_*` overrides from `env`.
pub fn load_layers(
    files: &[PathBuf],
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut merged = toml::Table::new();
    for path in files {
        let layer = load_config_file(path)?;
        merge_tables(&mut merged, layer);
    }
    let mut config: Config = toml::Value::Table(merged)
        .try_into()
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    content.parse::<toml::Table>().map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`; nested tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| Error::Config(format!("Invalid value for {key}: {val:?}")))
}

fn parse_bool(key: &str, val: &str) -> Result<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("Invalid value for {key}: {val:?}"))),
    }
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(val) = env("HIVE_LISTEN_ADDR") {
        config.hub.listen_addr = parse_env("HIVE_LISTEN_ADDR", &val)?;
    }
    if let Some(val) = env("HIVE_REPO_PATH") {
        config.hub.repo_path = Some(PathBuf::from(val));
    }
    if let Some(val) = env("HIVE_STATE_PATH") {
        config.hub.state_path = Some(PathBuf::from(val));
    }
    if let Some(val) = env("HIVE_WORKTREES_DIR") {
        config.worktree.root = PathBuf::from(val);
    }
    if let Some(val) = env("HIVE_BASE_PORT") {
        config.spawner.base_port = parse_env("HIVE_BASE_PORT", &val)?;
    }
    if let Some(val) = env("HIVE_SANDBOX") {
        config.spawner.sandbox = parse_bool("HIVE_SANDBOX", &val)?;
    }
    if let Some(val) = env("HIVE_MODEL") {
        config.spawner.model = Some(val).filter(|m| !m.is_empty());
    }
    if let Some(val) = env("HIVE_AGENTAPI_BIN") {
        config.spawner.agentapi_bin = PathBuf::from(val);
    }
    if let Some(val) = env("HIVE_CLAUDE_BIN") {
        config.spawner.claude_bin = PathBuf::from(val);
    }
    if let Some(val) = env("HIVE_SPAWN_TIMEOUT_SECS") {
        config.spawner.spawn_timeout_secs = parse_env("HIVE_SPAWN_TIMEOUT_SECS", &val)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_match_documented_constants() {
        let config = Config::default();
        assert_eq!(config.hub.listen_addr.port(), 8080);
        assert_eq!(config.spawner.base_port, 3284);
        assert_eq!(config.spawner.spawn_timeout(), Duration::from_secs(120));
        assert_eq!(config.spawner.health_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.spawner.stop_grace(), Duration::from_secs(5));
        assert_eq!(config.worktree.branch_namespace, "hive");
        assert!(config.worktree.root.ends_with("hive-worktrees"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn agent_cache_defaults_under_home() {
        let config = Config::default();
        assert_eq!(config.hub.cache_path, default_cache_path());
        if let Some(path) = &config.hub.cache_path {
            assert!(path.ends_with(".hive/agents.json"));
        }
    }

    #[test]
    fn layers_merge_nested_tables() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(
            &global,
            "[spawner]\nbase_port = 4000\nmodel = \"opus\"\n[worktree]\nbranch_namespace = \"drones\"\n",
        )
        .unwrap();
        std::fs::write(&project, "[spawner]\nbase_port = 5000\n").unwrap();

        let config = load_layers(&[global, project], no_env).unwrap();
        assert_eq!(config.spawner.base_port, 5000);
        assert_eq!(config.spawner.model.as_deref(), Some("opus"));
        assert_eq!(config.worktree.branch_namespace, "drones");
        assert_eq!(config.spawner.agentapi_bin, PathBuf::from("agentapi"));
    }

    #[test]
    fn env_overrides_win_over_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("c.toml");
        std::fs::write(&file, "[spawner]\nbase_port = 4000\n").unwrap();

        let config = load_layers(&[file], |key| match key {
            "HIVE_BASE_PORT" => Some("6000".into()),
            "HIVE_SANDBOX" => Some("yes".into()),
            "HIVE_REPO_PATH" => Some("/srv/repo".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.spawner.base_port, 6000);
        assert!(config.spawner.sandbox);
        assert_eq!(config.hub.repo_path, Some(PathBuf::from("/srv/repo")));
    }

    #[test]
    fn bad_env_value_is_a_config_error() {
        let err = load_layers(&[], |key| (key == "HIVE_BASE_PORT").then(|| "abc".into()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("HIVE_BASE_PORT")));
    }

    #[test]
    fn unparsable_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.toml");
        std::fs::write(&file, "[spawner\n").unwrap();
        assert!(matches!(
            load_layers(&[file], no_env),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn port_range_overflow_rejected() {
        let mut config = Config::default();
        config.spawner.base_port = 65_500;
        config.spawner.port_range = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn state_path_defaults_under_repo() {
        let hub = HubConfig::default().with_repo_path("/srv/repo");
        assert_eq!(
            hub.effective_state_path(),
            Some(PathBuf::from("/srv/repo/.hive/hub-state.json"))
        );
    }

    #[test]
    fn public_url_rewrites_unspecified_host() {
        let hub = HubConfig::default().with_listen_addr("0.0.0.0:9000".parse().unwrap());
        assert_eq!(hub.public_url(), "http://127.0.0.1:9000");
    }
}
