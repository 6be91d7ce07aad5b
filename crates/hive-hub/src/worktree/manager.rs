//! Worktree manager: one git worktree per agent, reconciled against git's registry.

use std::path::{Path, PathBuf};

use hive_core::ErrorKind;
use hive_core::config::WorktreeConfig;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from worktree operations. Each carries the operation and agent it concerns.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("git {op} failed for agent {agent}: {message}")]
    Git {
        op: &'static str,
        agent: String,
        message: String,
    },

    #[error("{op} failed for agent {agent}: {source}")]
    Io {
        op: &'static str,
        agent: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorktreeError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName(_) => ErrorKind::Validation,
            Self::RepoNotFound(_) | Self::Io { .. } => ErrorKind::Fatal,
            Self::Git { .. } => ErrorKind::Transient,
        }
    }

    fn io(op: &'static str, agent: &str, source: std::io::Error) -> Self {
        Self::Io {
            op,
            agent: agent.to_string(),
            source,
        }
    }
}

/// An agent's isolated working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub agent_name: String,
    /// The branch did not exist before this call and was cut from `base_branch`.
    pub created_branch: bool,
}

/// A worktree as git reports it in `worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredWorktree {
    pub path: PathBuf,
    /// `None` for a detached HEAD.
    pub branch: Option<String>,
}

/// Validate an agent/branch name: alphanumeric, hyphens, underscores, slashes, dots.
/// Rejects path traversal (`..`), leading dashes, and control characters.
pub fn validate_name(name: &str) -> Result<(), WorktreeError> {
    if name.is_empty() {
        return Err(WorktreeError::InvalidName("name cannot be empty".into()));
    }
    if name.starts_with('-') {
        return Err(WorktreeError::InvalidName(
            "name cannot start with a dash".into(),
        ));
    }
    if name.contains("..") {
        return Err(WorktreeError::InvalidName(
            "name cannot contain '..'".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(WorktreeError::InvalidName(format!(
            "name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

/// Agent names become a single directory component, so slashes are refused too.
fn validate_agent_name(name: &str) -> Result<(), WorktreeError> {
    validate_name(name)?;
    if name.contains('/') || name == "." {
        return Err(WorktreeError::InvalidName(format!(
            "agent name must be a single path component: {name}"
        )));
    }
    Ok(())
}

fn validate_branch(branch: &str) -> Result<(), WorktreeError> {
    validate_name(branch)
        .map_err(|_| WorktreeError::InvalidName(format!("invalid branch name: {branch}")))
}

/// Run git in `repo`, returning trimmed stdout or a typed error with trimmed stderr.
async fn git(
    repo: &Path,
    args: &[&str],
    op: &'static str,
    agent: &str,
) -> Result<String, WorktreeError> {
    let start = std::time::Instant::now();
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .map_err(|e| WorktreeError::io(op, agent, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            op,
            agent,
            elapsed_ms = start.elapsed().as_millis(),
            status = %output.status,
            stderr = %stderr.trim(),
            "git command failed"
        );
        return Err(WorktreeError::Git {
            op,
            agent: agent.to_string(),
            message: stderr.trim().to_string(),
        });
    }

    debug!(op, agent, elapsed_ms = start.elapsed().as_millis(), "git command completed");
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Parse `git worktree list --porcelain` output.
fn parse_porcelain(output: &str) -> Vec<RegisteredWorktree> {
    let mut entries = Vec::new();
    let mut current: Option<RegisteredWorktree> = None;
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(RegisteredWorktree {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch ")
            && let Some(entry) = current.as_mut()
        {
            entry.branch = Some(
                branch
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch)
                    .to_string(),
            );
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

/// Creates and deletes per-agent git worktrees under a single root directory.
///
/// The repository's git metadata may be mutated behind our back (manual
/// prune, branch deletion), so every create re-derives state from git
/// instead of trusting earlier results.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    root: PathBuf,
    namespace: String,
    prune_attempts: u32,
}

impl WorktreeManager {
    /// Create a new worktree manager.
    pub fn new(config: &WorktreeConfig) -> Self {
        Self {
            root: config.root.clone(),
            namespace: config.branch_namespace.clone(),
            prune_attempts: config.prune_attempts.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Default branch for an agent: `<namespace>/<agent>`.
    pub fn branch_for(&self, agent: &str) -> String {
        format!("{}/{}", self.namespace, agent)
    }

    /// Root with symlinks resolved, created on demand. git reports canonical paths.
    async fn resolved_root(&self, agent: &str) -> Result<PathBuf, WorktreeError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| WorktreeError::io("create worktree root", agent, e))?;
        tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| WorktreeError::io("resolve worktree root", agent, e))
    }

    /// Path the agent's worktree lives at.
    pub async fn path_for(&self, agent: &str) -> Result<PathBuf, WorktreeError> {
        validate_agent_name(agent)?;
        Ok(self.resolved_root(agent).await?.join(agent))
    }

    /// Create (or reuse) the worktree for `agent`.
    ///
    /// * prunes stale registrations first (best-effort);
    /// * a registered worktree already at the path is reused when it has the
    ///   requested branch checked out, and removed otherwise (its branch stays);
    /// * an unregistered directory at the path is deleted and recreated;
    /// * an existing branch is attached, and force-recreated from `base_branch`
    ///   if attaching fails.
    pub async fn create(
        &self,
        repo: &Path,
        agent: &str,
        branch: Option<&str>,
        base_branch: Option<&str>,
    ) -> Result<Worktree, WorktreeError> {
        validate_agent_name(agent)?;
        let branch = branch.map_or_else(|| self.branch_for(agent), str::to_string);
        validate_branch(&branch)?;
        if let Some(base) = base_branch {
            validate_branch(base)?;
        }
        if !repo.exists() {
            return Err(WorktreeError::RepoNotFound(repo.display().to_string()));
        }

        self.prune(repo, agent).await;

        let path = self.resolved_root(agent).await?.join(agent);
        let path_str = path.to_string_lossy().into_owned();
        let base = match base_branch {
            Some(base) => base.to_string(),
            None => Self::current_branch(repo, agent).await,
        };

        if path.join(".git").exists()
            && let Some(checked_out) = self.registered_branch(repo, &path, agent).await?
        {
            if checked_out.as_deref() == Some(branch.as_str()) {
                info!(agent, path = %path.display(), "Reusing registered worktree");
                return Ok(Worktree {
                    path,
                    branch,
                    base_branch: base,
                    agent_name: agent.to_string(),
                    created_branch: false,
                });
            }
            warn!(
                agent,
                wanted = %branch,
                found = checked_out.as_deref().unwrap_or("(detached)"),
                "Registered worktree is on another branch, recreating"
            );
            git(
                repo,
                &["worktree", "remove", "--force", &path_str],
                "worktree remove",
                agent,
            )
            .await?;
        }

        if path.exists() {
            warn!(agent, path = %path.display(), "Removing unregistered worktree directory");
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| WorktreeError::io("remove orphaned worktree", agent, e))?;
        }

        if Self::branch_exists(repo, &branch, agent).await {
            let attached = git(
                repo,
                &["worktree", "add", &path_str, &branch],
                "worktree add",
                agent,
            )
            .await;
            match attached {
                Ok(_) => {
                    info!(agent, path = %path.display(), branch, "Attached existing branch");
                    return Ok(Worktree {
                        path,
                        branch,
                        base_branch: base,
                        agent_name: agent.to_string(),
                        created_branch: false,
                    });
                }
                Err(e) => {
                    warn!(agent, branch, error = %e, "Attach failed, recreating branch from base");
                    git(repo, &["branch", "-D", &branch], "branch -D", agent).await?;
                    if path.exists() {
                        tokio::fs::remove_dir_all(&path)
                            .await
                            .map_err(|e| WorktreeError::io("remove partial worktree", agent, e))?;
                    }
                }
            }
        }

        git(
            repo,
            &["worktree", "add", "-b", &branch, &path_str, &base],
            "worktree add -b",
            agent,
        )
        .await?;

        info!(agent, path = %path.display(), branch, base = %base, "Created git worktree");
        Ok(Worktree {
            path,
            branch,
            base_branch: base,
            agent_name: agent.to_string(),
            created_branch: true,
        })
    }

    /// Force-remove the agent's worktree, and its branch when `delete_branch` is set.
    pub async fn delete(
        &self,
        repo: &Path,
        agent: &str,
        delete_branch: Option<&str>,
    ) -> Result<(), WorktreeError> {
        validate_agent_name(agent)?;
        let path = self.resolved_root(agent).await?.join(agent);
        let path_str = path.to_string_lossy().into_owned();

        if path.exists() {
            if let Err(e) = git(
                repo,
                &["worktree", "remove", "--force", &path_str],
                "worktree remove",
                agent,
            )
            .await
            {
                warn!(agent, error = %e, "git worktree remove failed, deleting directory");
            }
            if path.exists() {
                tokio::fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| WorktreeError::io("remove worktree directory", agent, e))?;
            }
        }

        self.prune(repo, agent).await;

        if let Some(branch) = delete_branch {
            validate_branch(branch)?;
            if Self::branch_exists(repo, branch, agent).await {
                git(repo, &["branch", "-D", branch], "branch -D", agent).await?;
                debug!(agent, branch, "Deleted agent branch");
            }
        }

        info!(agent, path = %path.display(), "Removed git worktree");
        Ok(())
    }

    /// Registered worktrees living under this manager's root.
    pub async fn list(&self, repo: &Path) -> Result<Vec<RegisteredWorktree>, WorktreeError> {
        let root = self.resolved_root("").await?;
        let output = git(repo, &["worktree", "list", "--porcelain"], "worktree list", "").await?;
        Ok(parse_porcelain(&output)
            .into_iter()
            .filter(|wt| wt.path.starts_with(&root))
            .collect())
    }

    /// Branch checked out at `path`, or `None` when git has no worktree there.
    async fn registered_branch(
        &self,
        repo: &Path,
        path: &Path,
        agent: &str,
    ) -> Result<Option<Option<String>>, WorktreeError> {
        let output =
            git(repo, &["worktree", "list", "--porcelain"], "worktree list", agent).await?;
        Ok(parse_porcelain(&output)
            .into_iter()
            .find(|wt| wt.path == path)
            .map(|wt| wt.branch))
    }

    /// Best-effort `git worktree prune` with a short bounded retry.
    async fn prune(&self, repo: &Path, agent: &str) {
        for attempt in 1..=self.prune_attempts {
            match git(repo, &["worktree", "prune"], "worktree prune", agent).await {
                Ok(_) => return,
                Err(e) if attempt < self.prune_attempts => {
                    debug!(agent, attempt, error = %e, "worktree prune failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
                Err(e) => warn!(agent, error = %e, "worktree prune failed, continuing"),
            }
        }
    }

    async fn current_branch(repo: &Path, agent: &str) -> String {
        match git(repo, &["rev-parse", "--abbrev-ref", "HEAD"], "rev-parse", agent).await {
            Ok(branch) if !branch.is_empty() && branch != "HEAD" => branch,
            _ => "main".to_string(),
        }
    }

    async fn branch_exists(repo: &Path, branch: &str, agent: &str) -> bool {
        let refname = format!("refs/heads/{branch}");
        git(
            repo,
            &["rev-parse", "--verify", "--quiet", &refname],
            "rev-parse --verify",
            agent,
        )
        .await
        .is_ok()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::init_repo;

    struct Fixture {
        repo: tempfile::TempDir,
        _root: tempfile::TempDir,
        mgr: WorktreeManager,
    }

    fn fixture() -> Fixture {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path()).unwrap();
        let root = tempfile::tempdir().unwrap();
        let config = WorktreeConfig {
            root: root.path().to_path_buf(),
            ..WorktreeConfig::default()
        };
        Fixture {
            repo,
            _root: root,
            mgr: WorktreeManager::new(&config),
        }
    }

    fn git_sync(repo: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed");
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    fn registrations(repo: &Path, path: &Path) -> usize {
        parse_porcelain(&git_sync(repo, &["worktree", "list", "--porcelain"]))
            .iter()
            .filter(|wt| wt.path == path)
            .count()
    }

    #[test]
    fn validate_name_accepts_valid() {
        assert!(validate_name("drone-1").is_ok());
        assert!(validate_name("feature/auth").is_ok());
        assert!(validate_name("v1.2.3").is_ok());
        assert!(validate_name("my_worktree").is_ok());
    }

    #[test]
    fn validate_name_rejects_bad_input() {
        assert!(validate_name("").is_err());
        assert!(validate_name("-flag").is_err());
        assert!(validate_name("foo/../bar").is_err());
        assert!(validate_name("foo bar").is_err());
        assert!(validate_name("foo;bar").is_err());
    }

    #[test]
    fn agent_name_must_be_single_component() {
        assert!(validate_agent_name("drone-1").is_ok());
        assert!(validate_agent_name("team/drone").is_err());
        assert!(matches!(
            validate_agent_name("").unwrap_err().kind(),
            ErrorKind::Validation
        ));
    }

    #[test]
    fn parse_porcelain_reads_paths_and_branches() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /wt/d1\nHEAD def\nbranch refs/heads/hive/d1\n\nworktree /wt/d2\nHEAD 123\ndetached\n";
        let parsed = parse_porcelain(out);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].path, PathBuf::from("/wt/d1"));
        assert_eq!(parsed[1].branch.as_deref(), Some("hive/d1"));
        assert!(parsed[2].branch.is_none());
    }

    #[tokio::test]
    async fn create_places_worktree_under_root() {
        let fx = fixture();
        let wt = fx.mgr.create(fx.repo.path(), "drone-1", None, None).await.unwrap();

        assert_eq!(wt.path, fx.mgr.path_for("drone-1").await.unwrap());
        assert!(wt.path.join(".git").exists());
        assert_eq!(wt.branch, "hive/drone-1");
        assert_eq!(wt.base_branch, "main");
        assert_eq!(registrations(fx.repo.path(), &wt.path), 1);
    }

    #[tokio::test]
    async fn create_twice_is_idempotent() {
        let fx = fixture();
        let first = fx.mgr.create(fx.repo.path(), "drone-1", None, Some("main")).await.unwrap();
        let second = fx.mgr.create(fx.repo.path(), "drone-1", None, Some("main")).await.unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(registrations(fx.repo.path(), &first.path), 1);
    }

    #[tokio::test]
    async fn reuse_with_another_branch_checks_out_the_requested_one() {
        let fx = fixture();
        let first = fx.mgr.create(fx.repo.path(), "drone-1", None, Some("main")).await.unwrap();
        std::fs::write(first.path.join("work.txt"), "kept").unwrap();
        git_sync(&first.path, &["add", "work.txt"]);
        git_sync(&first.path, &["commit", "-q", "-m", "work"]);

        let second = fx
            .mgr
            .create(fx.repo.path(), "drone-1", Some("feature/x"), Some("main"))
            .await
            .unwrap();
        assert_eq!(second.path, first.path);
        assert_eq!(second.branch, "feature/x");
        assert!(second.created_branch);
        assert_eq!(
            git_sync(&second.path, &["rev-parse", "--abbrev-ref", "HEAD"]).trim(),
            "feature/x"
        );
        assert_eq!(registrations(fx.repo.path(), &second.path), 1);
        assert!(!second.path.join("work.txt").exists());
        assert!(!git_sync(fx.repo.path(), &["branch", "--list", "hive/drone-1"]).trim().is_empty());

        let listed = fx.mgr.list(fx.repo.path()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].branch.as_deref(), Some(second.branch.as_str()));
    }

    #[tokio::test]
    async fn unregistered_directory_is_replaced() {
        let fx = fixture();
        let path = fx.mgr.path_for("drone-1").await.unwrap();
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("leftover.txt"), "stale").unwrap();

        let wt = fx.mgr.create(fx.repo.path(), "drone-1", None, None).await.unwrap();
        assert!(!wt.path.join("leftover.txt").exists());
        assert_eq!(registrations(fx.repo.path(), &wt.path), 1);
    }

    #[tokio::test]
    async fn externally_pruned_registration_is_recovered() {
        let fx = fixture();
        let wt = fx.mgr.create(fx.repo.path(), "drone-1", None, None).await.unwrap();

        // Drop git's bookkeeping while the directory and branch survive.
        std::fs::remove_dir_all(fx.repo.path().join(".git").join("worktrees").join("drone-1"))
            .unwrap();
        assert_eq!(registrations(fx.repo.path(), &wt.path), 0);

        let again = fx.mgr.create(fx.repo.path(), "drone-1", None, None).await.unwrap();
        assert_eq!(again.branch, "hive/drone-1");
        assert_eq!(registrations(fx.repo.path(), &again.path), 1);
    }

    #[tokio::test]
    async fn existing_branch_is_attached() {
        let fx = fixture();
        git_sync(fx.repo.path(), &["branch", "hive/drone-2"]);

        let wt = fx.mgr.create(fx.repo.path(), "drone-2", None, None).await.unwrap();
        let head = git_sync(&wt.path, &["rev-parse", "--abbrev-ref", "HEAD"]);
        assert_eq!(head.trim(), "hive/drone-2");
    }

    #[tokio::test]
    async fn branch_checked_out_elsewhere_fails_with_typed_error() {
        let fx = fixture();
        // Another worktree holds the branch, so attaching it must fail.
        git_sync(fx.repo.path(), &["branch", "hive/busy"]);
        let other = tempfile::tempdir().unwrap();
        let other_path = other.path().join("holder");
        git_sync(
            fx.repo.path(),
            &["worktree", "add", other_path.to_str().unwrap(), "hive/busy"],
        );

        let result = fx.mgr.create(fx.repo.path(), "busy", Some("hive/busy"), None).await;
        // Deleting a checked-out branch is refused by git; the error names the agent.
        match result {
            Err(WorktreeError::Git { agent, op, .. }) => {
                assert_eq!(agent, "busy");
                assert_eq!(op, "branch -D");
            }
            other => panic!("expected branch -D failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_removes_directory_and_branch() {
        let fx = fixture();
        let wt = fx.mgr.create(fx.repo.path(), "drone-1", None, None).await.unwrap();

        fx.mgr
            .delete(fx.repo.path(), "drone-1", Some(&wt.branch))
            .await
            .unwrap();

        assert!(!wt.path.exists());
        assert_eq!(registrations(fx.repo.path(), &wt.path), 0);
        let branches = git_sync(fx.repo.path(), &["branch", "--list", "hive/drone-1"]);
        assert!(branches.trim().is_empty());
    }

    #[tokio::test]
    async fn delete_keeps_branch_when_asked() {
        let fx = fixture();
        fx.mgr.create(fx.repo.path(), "drone-1", None, None).await.unwrap();
        fx.mgr.delete(fx.repo.path(), "drone-1", None).await.unwrap();

        let branches = git_sync(fx.repo.path(), &["branch", "--list", "hive/drone-1"]);
        assert!(branches.contains("hive/drone-1"));
    }

    #[tokio::test]
    async fn delete_missing_worktree_is_ok() {
        let fx = fixture();
        assert!(fx.mgr.delete(fx.repo.path(), "ghost", Some("hive/ghost")).await.is_ok());
    }

    #[tokio::test]
    async fn list_only_reports_managed_worktrees() {
        let fx = fixture();
        fx.mgr.create(fx.repo.path(), "a", None, None).await.unwrap();
        fx.mgr.create(fx.repo.path(), "b", None, None).await.unwrap();

        let listed = fx.mgr.list(fx.repo.path()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|wt| wt.branch.as_deref().is_some_and(|b| b.starts_with("hive/"))));
    }

    #[tokio::test]
    async fn missing_repo_is_reported() {
        let fx = fixture();
        let err = fx
            .mgr
            .create(Path::new("/nonexistent/repo/path"), "drone-1", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::RepoNotFound(ref p) if p.contains("/nonexistent")));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
