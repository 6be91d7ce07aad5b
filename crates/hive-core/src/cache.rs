//! Flat-file agent cache consumed by the CLI.
//!
//! A JSON array of [`Agent`] records. It is a convenience snapshot, never the
//! hub's authoritative state, so readers tolerate a missing file.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::Agent;

/// Reader/writer for the agent cache file.
#[derive(Debug, Clone)]
pub struct AgentCache {
    path: PathBuf,
}

impl AgentCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load cached agents. A missing file yields an empty list.
    pub fn load(&self) -> Result<Vec<Agent>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&data).map_err(|e| {
            Error::Cache(format!("Failed to parse {}: {e}", self.path.display()))
        })
    }

    /// Replace the cache contents atomically (temp file + rename).
    pub fn save(&self, agents: &[Agent]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_vec_pretty(agents)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::AgentStatus;

    fn agent(name: &str) -> Agent {
        Agent {
            id: crate::short_id(),
            name: name.into(),
            branch: format!("hive/{name}"),
            base_branch: "main".into(),
            worktree_path: PathBuf::from(format!("/tmp/{name}")),
            port: 3300,
            pid: None,
            status: AgentStatus::Ready,
            specialty: Some("backend".into()),
            model: None,
            sandbox: true,
            created_at: crate::unix_timestamp(),
            error: None,
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AgentCache::new(dir.path().join("nope").join("agents.json"));
        assert!(cache.load().unwrap().is_empty());
    }

    #[test]
    fn save_creates_parent_and_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AgentCache::new(dir.path().join(".hive").join("agents.json"));

        cache.save(&[agent("a"), agent("b")]).unwrap();
        assert_eq!(cache.load().unwrap().len(), 2);

        cache.save(&[agent("c")]).unwrap();
        let loaded = cache.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "c");
        assert!(!dir.path().join(".hive").join("agents.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(AgentCache::new(path).load(), Err(Error::Cache(_))));
    }
}
